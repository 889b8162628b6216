//! Domain Controller Locator
//!
//! Resolves a domain name to an ordered list of domain-controller FQDNs:
//! forward A-lookup, dotted-quad validation, then reverse lookup filtered
//! to names that contain the domain. The list is recomputed on every gMSA
//! fetch so DNS changes propagate; a `CF_DOMAIN_CONTROLLER` override
//! bypasses discovery entirely.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{Config, CF_DOMAIN_CONTROLLER};
use crate::errors::{CredError, Result};
use crate::exec;

const IPV4_PATTERN: &str = r"^(([0-9]|[1-9][0-9]|1[0-9][0-9]|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9][0-9]|2[0-4][0-9]|25[0-5])$";

fn ipv4_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(IPV4_PATTERN).expect("valid dotted-quad pattern"))
}

/// Strict dotted-quad check applied to every resolved address.
pub(crate) fn is_valid_ipv4(address: &str) -> bool {
    ipv4_regex().is_match(address)
}

/// Keeps a reverse-lookup name only when it contains the queried domain.
/// Both sides are lowercased first; resolver artifacts like
/// `ip-10-0-0-162.us-west-1.compute.internal` fall out here.
pub(crate) fn fqdn_matches_domain(fqdn: &str, domain: &str) -> bool {
    fqdn.to_lowercase().contains(&domain.to_lowercase())
}

/// Resolves `domain` to the ordered list of domain-controller FQDNs.
pub(crate) async fn locate(config: &Config, domain: &str) -> Result<Vec<String>> {
    exec::validate_domain(domain)?;

    if let Some(override_fqdn) = config.lookup(CF_DOMAIN_CONTROLLER) {
        info!(domain, fqdn = %override_fqdn, "using configured domain controller");
        return Ok(vec![override_fqdn]);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

    let addresses = resolve_domain_ips(&resolver, domain).await?;

    let mut fqdns = Vec::new();
    for address in addresses {
        match resolver.reverse_lookup(IpAddr::V4(address)).await {
            Ok(response) => {
                for record in response.iter() {
                    let name = record.to_string();
                    let name = name.trim_end_matches('.');
                    if !name.is_empty() && fqdn_matches_domain(name, domain) {
                        fqdns.push(name.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(domain, ip = %address, "reverse lookup failed: {}", err);
            }
        }
    }

    if fqdns.is_empty() {
        return Err(CredError::NoDomainController(domain.to_string()));
    }
    info!(domain, controllers = ?fqdns, "discovered domain controllers");
    Ok(fqdns)
}

/// Forward-resolves the domain to IPv4 addresses. Any entry that fails the
/// dotted-quad check fails the whole call.
async fn resolve_domain_ips(
    resolver: &TokioAsyncResolver,
    domain: &str,
) -> Result<Vec<Ipv4Addr>> {
    let lookup = resolver
        .ipv4_lookup(domain)
        .await
        .map_err(|err| CredError::DnsFailure(format!("resolving {}: {}", domain, err)))?;

    let mut addresses = Vec::new();
    for record in lookup.iter() {
        let text = record.to_string();
        if !is_valid_ipv4(&text) {
            return Err(CredError::DnsFailure(format!(
                "malformed address {:?} resolving {}",
                text, domain
            )));
        }
        let parsed: Ipv4Addr = text
            .parse()
            .map_err(|_| CredError::DnsFailure(format!("unparsable address {:?}", text)))?;
        addresses.push(parsed);
    }

    if addresses.is_empty() {
        return Err(CredError::DnsFailure(format!("no A records for {}", domain)));
    }
    Ok(addresses)
}
