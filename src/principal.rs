//! Principal Resolver
//!
//! Derives the machine principal (`HOST$@REALM`) and user principals
//! (`user@REALM`) used for the initial Kerberos ticket exchange. The short
//! host name is capped at the NetBIOS limit of 15 characters; longer names
//! are truncated with a warning because oversized names break ticket
//! issuance against Active Directory.

use tracing::warn;

use crate::errors::{CredError, Result};
use crate::exec::ShellCommand;

/// NetBIOS computer-name limit imposed by Active Directory.
pub(crate) const HOST_NAME_LENGTH_LIMIT: usize = 15;

/// Returns the host name as reported by the `hostname` command.
pub(crate) async fn hostname() -> Result<String> {
    let output = ShellCommand::new("hostname")
        .run()
        .await
        .map_err(|err| CredError::HostnameUnavailable(err.to_string()))?;
    if !output.success() {
        return Err(CredError::HostnameUnavailable(format!(
            "hostname exited {}",
            output.exit_code
        )));
    }
    let name = output.text().trim().to_string();
    if name.is_empty() {
        return Err(CredError::HostnameUnavailable("hostname output empty".to_string()));
    }
    Ok(name)
}

/// Returns the joined Kerberos realm, uppercased, from `realm list`.
pub(crate) async fn realm_name() -> Result<String> {
    let output = ShellCommand::new("realm")
        .arg("list")
        .run()
        .await
        .map_err(|err| CredError::RealmUnavailable(err.to_string()))?;
    if !output.success() {
        return Err(CredError::RealmUnavailable(format!(
            "realm list exited {}",
            output.exit_code
        )));
    }
    parse_realm_list(&output.text())
}

/// Pulls the `realm-name:` field out of `realm list` output.
pub(crate) fn parse_realm_list(output: &str) -> Result<String> {
    for line in output.lines() {
        if let Some(value) = line.trim_start().strip_prefix("realm-name:") {
            let realm = value.trim();
            if !realm.is_empty() {
                return Ok(realm.to_uppercase());
            }
        }
    }
    Err(CredError::RealmUnavailable(
        "no realm-name in realm list output (host not joined?)".to_string(),
    ))
}

/// Shortens a host name to its first DNS label, truncated to the NetBIOS
/// limit. Truncation is a warning, not an error.
pub(crate) fn short_host_name(hostname: &str) -> String {
    let first_label = hostname.split('.').next().unwrap_or(hostname);
    if first_label.len() > HOST_NAME_LENGTH_LIMIT {
        warn!(
            hostname,
            limit = HOST_NAME_LENGTH_LIMIT,
            "hostname exceeds 15 characters, this can cause problems in getting \
             kerberos tickets, please reduce hostname length"
        );
        first_label.chars().take(HOST_NAME_LENGTH_LIMIT).collect()
    } else {
        first_label.to_string()
    }
}

/// Machine principal of the form `EC2AMAZ-Q5VJZQ$@CONTOSO.COM`.
pub(crate) async fn machine_principal() -> Result<String> {
    let host = hostname().await?;
    let realm = realm_name().await?;
    Ok(format_machine_principal(&host, &realm))
}

pub(crate) fn format_machine_principal(hostname: &str, realm: &str) -> String {
    format!("{}$@{}", short_host_name(hostname), realm.to_uppercase())
}

/// User principal of the form `user@CONTOSO.COM`.
pub(crate) fn user_principal(username: &str, domain: &str) -> String {
    format!("{}@{}", username, domain.to_uppercase())
}
