//! gMSA Managed-Password Fetch
//!
//! Retrieves the `msDS-ManagedPassword` blob for a service account by
//! running `ldapsearch` over GSSAPI against each candidate domain
//! controller, extracts the UTF-16LE current password from the blob, and
//! drives `kinit` against the lease's credential cache with the UTF-8
//! password delivered over stdin.
//!
//! Blob layout (MSDS-MANAGEDPASSWORD_BLOB): a 16-byte little-endian header
//! (version, reserved, length, then four offsets) followed by the 256-byte
//! current password at `current_password_offset`.

use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{Config, CF_GMSA_BASE_DN, CF_GMSA_OU, CF_GMSA_SECRET_NAME};
use crate::dc_locator;
use crate::errors::{CredError, Result};
use crate::exec::{self, ShellCommand};
use crate::secrets_manager;
use crate::secure_types::SecretBuffer;
use crate::ticket_issuer::{IssueOutcome, KINIT, LDAPSEARCH};

/// Size of the `current_password` field in the managed-password blob.
pub(crate) const GMSA_PASSWORD_SIZE: usize = 256;

const BLOB_HEADER_SIZE: usize = 16;
const CURRENT_PASSWORD_OFFSET_FIELD: usize = 8;

/// Attribute requested from the directory.
const MANAGED_PASSWORD_ATTRIBUTE: &str = "msds-ManagedPassword";
/// Attribute prefix as it appears in LDIF output (base64 value marker).
const MANAGED_PASSWORD_PREFIX: &str = "msDS-ManagedPassword::";

const DEFAULT_GMSA_OU: &str = "CN=Managed Service Accounts";

/// `contoso.com` -> `DC=contoso,DC=com`
pub(crate) fn domain_to_dc_components(domain: &str) -> String {
    domain
        .split('.')
        .map(|part| format!("DC={}", part))
        .collect::<Vec<_>>()
        .join(",")
}

/// Default search base for a gMSA object.
pub(crate) fn default_base_dn(account_name: &str, domain: &str) -> String {
    format!(
        "CN={},{},{}",
        account_name,
        DEFAULT_GMSA_OU,
        domain_to_dc_components(domain)
    )
}

/// Resolves the search base, in precedence order: a distinguished name from
/// the secrets store, then `CF_GMSA_OU` (replacing the OU segment), then
/// `CF_GMSA_BASE_DN`, then the computed default.
pub(crate) fn resolve_base_dn(
    config: &Config,
    account_name: &str,
    domain: &str,
    secret_dn: Option<&str>,
) -> String {
    if let Some(dn) = secret_dn {
        if !dn.is_empty() {
            // The attribute selector is always passed separately; strip it
            // if the stored DN carries it embedded.
            let dn = dn
                .strip_suffix(&format!(" {}", MANAGED_PASSWORD_ATTRIBUTE))
                .unwrap_or(dn);
            return dn.to_string();
        }
    }
    if let Some(ou) = config.lookup(CF_GMSA_OU) {
        return format!(
            "CN={},{},{}",
            account_name,
            ou,
            domain_to_dc_components(domain)
        );
    }
    if let Some(base_dn) = config.lookup(CF_GMSA_BASE_DN) {
        return base_dn;
    }
    default_base_dn(account_name, domain)
}

/// Finds the base64 value of the managed-password attribute in ldapsearch
/// output. The output is split on `#` and the value follows the `::`
/// delimiter plus one separator character.
pub(crate) fn extract_encoded_password(ldap_output: &str) -> Option<Zeroizing<String>> {
    for token in ldap_output.split('#') {
        if let Some(pos) = token.find(MANAGED_PASSWORD_PREFIX) {
            let after_prefix = &token[pos + MANAGED_PASSWORD_PREFIX.len()..];
            let mut chars = after_prefix.chars();
            chars.next();
            let value = chars.as_str();
            if value.trim().is_empty() {
                return None;
            }
            return Some(Zeroizing::new(value.to_string()));
        }
    }
    None
}

/// Extracts the 256-byte `current_password` field from a decoded blob.
pub(crate) fn extract_current_password(blob: &SecretBuffer) -> Result<SecretBuffer> {
    let bytes = blob.as_bytes();
    if bytes.len() < BLOB_HEADER_SIZE {
        return Err(CredError::DecodeError(format!(
            "managed-password blob too short: {} bytes",
            bytes.len()
        )));
    }
    let offset = u16::from_le_bytes([
        bytes[CURRENT_PASSWORD_OFFSET_FIELD],
        bytes[CURRENT_PASSWORD_OFFSET_FIELD + 1],
    ]) as usize;
    let end = offset
        .checked_add(GMSA_PASSWORD_SIZE)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| {
            CredError::DecodeError(format!(
                "current password at offset {} exceeds blob of {} bytes",
                offset,
                bytes.len()
            ))
        })?;
    Ok(SecretBuffer::from_bytes(bytes[offset..end].to_vec()))
}

/// Converts UTF-16LE bytes to UTF-8, substituting U+FFFD for unpaired
/// surrogates. All intermediate copies are scrubbed.
pub(crate) fn utf16le_to_utf8(bytes: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut units = Zeroizing::new(Vec::with_capacity(bytes.len() / 2));
    for pair in bytes.chunks_exact(2) {
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }

    let mut utf8 = Zeroizing::new(Vec::with_capacity(bytes.len() * 2));
    let mut scratch = [0u8; 4];
    for decoded in char::decode_utf16(units.iter().copied()) {
        let ch = decoded.unwrap_or(char::REPLACEMENT_CHARACTER);
        utf8.extend_from_slice(ch.encode_utf8(&mut scratch).as_bytes());
    }
    scratch.zeroize();
    utf8
}

/// Fetches the managed-password blob for `account_name`, trying each
/// candidate domain controller in discovery order. Each DC gets one retry
/// before moving on; the first success wins.
pub(crate) async fn fetch_password(
    config: &Config,
    domain: &str,
    account_name: &str,
    secret_dn: Option<&str>,
) -> Result<SecretBuffer> {
    exec::validate_token(account_name, "account name")?;
    exec::validate_domain(domain)?;

    let base_dn = resolve_base_dn(config, account_name, domain, secret_dn);
    let controllers = dc_locator::locate(config, domain).await?;

    let mut search_output = None;
    'controllers: for fqdn in &controllers {
        for attempt in 0..2 {
            let output = ShellCommand::new(LDAPSEARCH)
                .arg("-LLL")
                .arg("-Y")
                .arg("GSSAPI")
                .arg("-H")
                .arg(format!("ldap://{}", fqdn))
                .arg("-b")
                .arg(&base_dn)
                .arg(MANAGED_PASSWORD_ATTRIBUTE)
                .timeout(config.command_timeout())
                .run()
                .await;
            match output {
                Ok(output) if output.success() => {
                    info!(account = account_name, dc = %fqdn, "ldapsearch succeeded");
                    search_output = Some(output);
                    break 'controllers;
                }
                Ok(output) => {
                    warn!(
                        account = account_name,
                        dc = %fqdn,
                        attempt,
                        exit = output.exit_code,
                        "ldapsearch failed to get gMSA credentials"
                    );
                }
                Err(err) => {
                    warn!(account = account_name, dc = %fqdn, attempt, "ldapsearch error: {}", err);
                }
            }
        }
    }

    let search_output = search_output.ok_or_else(|| {
        CredError::LdapFailure(format!(
            "all {} domain controllers failed for {}",
            controllers.len(),
            account_name
        ))
    })?;

    let encoded = extract_encoded_password(&search_output.text())
        .ok_or_else(|| CredError::PasswordNotFound(account_name.to_string()))?;
    let blob = SecretBuffer::decode_base64(&encoded)?;
    extract_current_password(&blob)
}

/// Fetches the gMSA password and issues its ticket into `cred_cache_path`.
///
/// The caller must already hold a machine or user TGT for the GSSAPI bind.
pub(crate) async fn issue_gmsa_ticket(
    config: &Config,
    domain: &str,
    account_name: &str,
    cred_cache_path: &str,
) -> Result<IssueOutcome> {
    exec::validate_token(account_name, "account name")?;
    exec::validate_domain(domain)?;

    // An optional distinguished name stored with the reader credentials
    // overrides the computed search base.
    let secret_dn = match config.lookup(CF_GMSA_SECRET_NAME) {
        Some(secret_name) => match secrets_manager::fetch(config, &secret_name).await {
            Ok(secret) => secret
                .map(|s| s.distinguished_name)
                .filter(|dn| !dn.is_empty()),
            Err(err) => {
                warn!(secret = %secret_name, "secrets store lookup failed: {}", err);
                None
            }
        },
        None => None,
    };

    let current_password = fetch_password(config, domain, account_name, secret_dn.as_deref()).await?;
    let utf8_password = utf16le_to_utf8(current_password.as_bytes());

    let gmsa_principal = format!("{}$@{}", account_name, domain.to_uppercase());
    info!(principal = %gmsa_principal, cache = cred_cache_path, "issuing gMSA ticket");

    let output = ShellCommand::new(KINIT)
        .arg("-c")
        .arg(cred_cache_path)
        .arg("-V")
        .arg(&gmsa_principal)
        .timeout(config.command_timeout())
        .run_with_stdin_bytes(&utf8_password)
        .await?;

    if !output.success() {
        warn!(principal = %gmsa_principal, exit = output.exit_code, "gMSA kinit failed");
    }
    Ok(IssueOutcome {
        exit_code: output.exit_code,
        diagnostic: output.text(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Well-known reference blob: a real `msDS-ManagedPassword` value as
    /// printed by ldapsearch.
    const TEST_MANAGED_PASSWORD: &str = concat!(
        "msDS-ManagedPassword:: ",
        "AQAAACIBAAAQAAAAEgEaAciMhCofvo1R4kkVYm79aRysUcOs7NhhHvOexhNTV9KXAn1v8AYMN1lM",
        "C/V6W0dZVrQRpGZ/EvWi33Lq2xoR5ANuJf623JQRj3pMZQBqQLRjRoPnUJYY8H74aVysf0t+1M0m",
        "oLkm0IPSCB52Mm0CC9flTT0D9KZV2Mvf4FpgvYpYoOQvUmd0UOV72Tk/dleM8zTWjRL5ccfzwt5p",
        "8akMEl6W0RPj1pDbqxtbpJFQiLQd7HRlSkYPeBKDB9r6CItrQTo8j+pgJfB4+wVbOUZuMXrKkDVh",
        "8XUOUBdGhznntRWnDM2DhwBoFEisBr133Vo8aRcedYqwNj/LEsrimEJaeuYAAAQCCBrPFgAABKQ3",
        "Z84WAAA= #",
    );

    /// UTF-8 rendition of the 256-byte UTF-16LE current password above.
    const TEST_GMSA_UTF8_PASSWORD: [u8; 374] = [
        0xe8, 0xb3, 0x88, 0xe2, 0xaa, 0x84, 0xeb, 0xb8, 0x9f, 0xe5, 0x86, 0x8d,
        0xe4, 0xa7, 0xa2, 0xe6, 0x88, 0x95, 0xef, 0xb5, 0xae, 0xe1, 0xb1, 0xa9,
        0xe5, 0x86, 0xac, 0xea, 0xb3, 0x83, 0xef, 0xbf, 0xbd, 0xe1, 0xb9, 0xa1,
        0xe9, 0xbb, 0xb3, 0xe1, 0x8f, 0x86, 0xe5, 0x9d, 0x93, 0xe9, 0x9f, 0x92,
        0xe7, 0xb4, 0x82, 0xef, 0x81, 0xaf, 0xe0, 0xb0, 0x86, 0xe5, 0xa4, 0xb7,
        0xe0, 0xad, 0x8c, 0xe7, 0xab, 0xb5, 0xe4, 0x9d, 0x9b, 0xe5, 0x99, 0x99,
        0xe1, 0x86, 0xb4, 0xe6, 0x9a, 0xa4, 0xe1, 0x89, 0xbf, 0xea, 0x8b, 0xb5,
        0xe7, 0x8b, 0x9f, 0xef, 0xbf, 0xbd, 0xe1, 0x84, 0x9a, 0xcf, 0xa4, 0xe2,
        0x95, 0xae, 0xeb, 0x9b, 0xbe, 0xe9, 0x93, 0x9c, 0xe8, 0xbc, 0x91, 0xe4,
        0xb1, 0xba, 0x65, 0xe4, 0x81, 0xaa, 0xe6, 0x8e, 0xb4, 0xe8, 0x8d, 0x86,
        0xe5, 0x83, 0xa7, 0xe1, 0xa2, 0x96, 0xe7, 0xbb, 0xb0, 0xe6, 0xa7, 0xb8,
        0xea, 0xb1, 0x9c, 0xe4, 0xad, 0xbf, 0xed, 0x91, 0xbe, 0xe2, 0x9b, 0x8d,
        0xeb, 0xa6, 0xa0, 0xed, 0x80, 0xa6, 0xed, 0x8a, 0x83, 0xe1, 0xb8, 0x88,
        0xe3, 0x89, 0xb6, 0xc9, 0xad, 0xed, 0x9c, 0x8b, 0xe4, 0xb7, 0xa5, 0xcc,
        0xbd, 0xea, 0x9b, 0xb4, 0xf0, 0xa5, 0x9f, 0x8b, 0xe5, 0xab, 0xa0, 0xeb,
        0xb5, 0xa0, 0xe5, 0xa2, 0x8a, 0xee, 0x92, 0xa0, 0xe5, 0x88, 0xaf, 0xe7,
        0x91, 0xa7, 0xee, 0x95, 0x90, 0xef, 0xbf, 0xbd, 0xe3, 0xbc, 0xb9, 0xe5,
        0x9d, 0xb6, 0xef, 0x8e, 0x8c, 0xed, 0x98, 0xb4, 0xe1, 0x8a, 0x8d, 0xe7,
        0x87, 0xb9, 0xef, 0x8f, 0x87, 0xef, 0xbf, 0xbd, 0xef, 0x85, 0xa9, 0xe0,
        0xb2, 0xa9, 0xe5, 0xb8, 0x92, 0xed, 0x86, 0x96, 0xee, 0x8c, 0x93, 0xe9,
        0x83, 0x96, 0xea, 0xaf, 0x9b, 0xe5, 0xac, 0x9b, 0xe9, 0x86, 0xa4, 0xe8,
        0xa1, 0x90, 0xe1, 0xb6, 0xb4, 0xe7, 0x93, 0xac, 0xe4, 0xa9, 0xa5, 0xe0,
        0xbd, 0x86, 0xe1, 0x89, 0xb8, 0xde, 0x83, 0xef, 0xab, 0x9a, 0xe8, 0xac,
        0x88, 0xe4, 0x85, 0xab, 0xe3, 0xb0, 0xba, 0xee, 0xaa, 0x8f, 0xe2, 0x95,
        0xa0, 0xe7, 0xa3, 0xb0, 0xd7, 0xbb, 0xe3, 0xa5, 0x9b, 0xe6, 0xb9, 0x86,
        0xe7, 0xa8, 0xb1, 0xe9, 0x83, 0x8a, 0xe6, 0x84, 0xb5, 0xe7, 0x97, 0xb1,
        0xe5, 0x80, 0x8e, 0xe4, 0x98, 0x97, 0xe3, 0xa6, 0x87, 0xeb, 0x97, 0xa7,
        0xea, 0x9c, 0x95, 0xec, 0xb4, 0x8c, 0xe8, 0x9e, 0x83, 0xe6, 0xa0, 0x80,
        0xe4, 0xa0, 0x94, 0xda, 0xac, 0xe7, 0x9e, 0xbd, 0xe5, 0xab, 0x9d, 0xe6,
        0xa4, 0xbc, 0xe1, 0xb8, 0x97, 0xe8, 0xa9, 0xb5, 0xe3, 0x9a, 0xb0, 0xec,
        0xac, 0xbf, 0xec, 0xa8, 0x92, 0xe9, 0xa3, 0xa2, 0xe5, 0xa9, 0x82, 0xee,
        0x99, 0xba,
    ];

    #[test]
    fn test_domain_to_dc_components() {
        assert_eq!(domain_to_dc_components("corp.example.com"), "DC=corp,DC=example,DC=com");
        assert_eq!(domain_to_dc_components("contoso.com"), "DC=contoso,DC=com");
        assert_eq!(domain_to_dc_components("local"), "DC=local");
    }

    #[test]
    fn test_default_base_dn() {
        assert_eq!(
            default_base_dn("webapp01", "contoso.com"),
            "CN=webapp01,CN=Managed Service Accounts,DC=contoso,DC=com"
        );
    }

    #[test]
    fn test_resolve_base_dn_precedence() {
        let mut config = Config::default().with_config_file("/nonexistent/ecs.config");

        // Default
        assert_eq!(
            resolve_base_dn(&config, "webapp01", "contoso.com", None),
            "CN=webapp01,CN=Managed Service Accounts,DC=contoso,DC=com"
        );

        // CF_GMSA_BASE_DN
        config.set_override(CF_GMSA_BASE_DN, "OU=Custom,DC=contoso,DC=com");
        assert_eq!(
            resolve_base_dn(&config, "webapp01", "contoso.com", None),
            "OU=Custom,DC=contoso,DC=com"
        );

        // CF_GMSA_OU beats CF_GMSA_BASE_DN
        config.set_override(CF_GMSA_OU, "OU=Service Accounts");
        assert_eq!(
            resolve_base_dn(&config, "webapp01", "contoso.com", None),
            "CN=webapp01,OU=Service Accounts,DC=contoso,DC=com"
        );

        // A DN from the secrets store beats everything
        assert_eq!(
            resolve_base_dn(
                &config,
                "webapp01",
                "contoso.com",
                Some("CN=webapp01,OU=Stored,DC=contoso,DC=com")
            ),
            "CN=webapp01,OU=Stored,DC=contoso,DC=com"
        );
    }

    #[test]
    fn test_resolve_base_dn_strips_embedded_attribute() {
        let config = Config::default().with_config_file("/nonexistent/ecs.config");
        assert_eq!(
            resolve_base_dn(
                &config,
                "webapp01",
                "contoso.com",
                Some("CN=webapp01,DC=contoso,DC=com msds-ManagedPassword")
            ),
            "CN=webapp01,DC=contoso,DC=com"
        );
    }

    #[test]
    fn test_extract_encoded_password_from_reference_output() {
        let encoded = extract_encoded_password(TEST_MANAGED_PASSWORD).unwrap();
        assert!(encoded.starts_with("AQAAACIBAAAQAAAA"));
        assert!(encoded.trim_end().ends_with("Z84WAAA="));
    }

    #[test]
    fn test_extract_encoded_password_absent() {
        assert!(extract_encoded_password("dn: CN=webapp01\nobjectClass: top\n").is_none());
        assert!(extract_encoded_password("").is_none());
        assert!(extract_encoded_password("msDS-ManagedPassword:: ").is_none());
    }

    #[test]
    fn test_extract_current_password_honors_blob_offset() {
        let encoded = extract_encoded_password(TEST_MANAGED_PASSWORD).unwrap();
        let blob = SecretBuffer::decode_base64(&encoded).unwrap();
        assert_eq!(blob.len(), 290);

        let password = extract_current_password(&blob).unwrap();
        assert_eq!(password.len(), GMSA_PASSWORD_SIZE);
    }

    #[test]
    fn test_extract_current_password_rejects_short_blob() {
        let blob = SecretBuffer::from_bytes(vec![0u8; 8]);
        assert!(matches!(
            extract_current_password(&blob),
            Err(CredError::DecodeError(_))
        ));

        // Valid header but truncated password region
        let mut bytes = vec![0u8; 64];
        bytes[8] = 16;
        let blob = SecretBuffer::from_bytes(bytes);
        assert!(matches!(
            extract_current_password(&blob),
            Err(CredError::DecodeError(_))
        ));
    }

    #[test]
    fn test_utf16_decode_matches_reference_vector() {
        let encoded = extract_encoded_password(TEST_MANAGED_PASSWORD).unwrap();
        let blob = SecretBuffer::decode_base64(&encoded).unwrap();
        let password = extract_current_password(&blob).unwrap();

        let utf8 = utf16le_to_utf8(password.as_bytes());
        assert_eq!(&utf8[..], &TEST_GMSA_UTF8_PASSWORD[..]);
    }

    #[test]
    fn test_utf16_decode_basic_and_replacement() {
        // "hi" in UTF-16LE
        assert_eq!(&utf16le_to_utf8(&[0x68, 0x00, 0x69, 0x00])[..], b"hi");
        // Lone high surrogate becomes U+FFFD
        assert_eq!(&utf16le_to_utf8(&[0x00, 0xD8])[..], "\u{FFFD}".as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_password_validates_inputs() {
        let config = Config::default().with_config_file("/nonexistent/ecs.config");
        let err = fetch_password(&config, "contoso.com", "web;app", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CredError::InvalidArgument(_)));

        let err = fetch_password(&config, "bad domain", "webapp01", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CredError::InvalidArgument(_)));
    }
}
