//! Error handling module
//!
//! This module provides structured error types for credential operations,
//! replacing silent failures and ensuring proper error propagation from the
//! acquisition pipeline up to the renewal engine.

use thiserror::Error;

/// Main error type for credential-fetch operations
#[derive(Error, Debug)]
pub(crate) enum CredError {
    /// An externally supplied string failed denylist validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host name could not be determined
    #[error("hostname unavailable: {0}")]
    HostnameUnavailable(String),

    /// The joined Kerberos realm could not be determined
    #[error("realm unavailable: {0}")]
    RealmUnavailable(String),

    /// A required external tool is missing or not executable
    #[error("required tool missing: {0}")]
    ToolingMissing(String),

    /// DNS resolution failed or returned malformed addresses
    #[error("DNS lookup failed: {0}")]
    DnsFailure(String),

    /// Discovery produced no usable domain controller
    #[error("no domain controller found for {0}")]
    NoDomainController(String),

    /// ldapsearch failed against every candidate domain controller
    #[error("LDAP query failed: {0}")]
    LdapFailure(String),

    /// The LDAP result carried no managed-password attribute
    #[error("managed password not found: {0}")]
    PasswordNotFound(String),

    /// Base64 or password-blob decoding failed
    #[error("decode failed: {0}")]
    DecodeError(String),

    /// kinit exited with a failure status
    #[error("kinit failed: {0}")]
    KinitFailure(String),

    /// File or process I/O error
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// The secrets-manager CLI failed
    #[error("secrets store failure: {0}")]
    SecretsStoreFailure(String),

    /// Structured data (JSON, klist output) could not be parsed
    #[error("parse failure: {0}")]
    ParseFailure(String),
}

impl CredError {
    /// Short kind tag used in per-operation failure log lines.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            CredError::InvalidArgument(_) => "InvalidArgument",
            CredError::HostnameUnavailable(_) => "HostnameUnavailable",
            CredError::RealmUnavailable(_) => "RealmUnavailable",
            CredError::ToolingMissing(_) => "ToolingMissing",
            CredError::DnsFailure(_) => "DnsFailure",
            CredError::NoDomainController(_) => "NoDomainController",
            CredError::LdapFailure(_) => "LdapFailure",
            CredError::PasswordNotFound(_) => "PasswordNotFound",
            CredError::DecodeError(_) => "DecodeError",
            CredError::KinitFailure(_) => "KinitFailure",
            CredError::IoFailure(_) => "IoFailure",
            CredError::SecretsStoreFailure(_) => "SecretsStoreFailure",
            CredError::ParseFailure(_) => "ParseFailure",
        }
    }
}

impl From<std::io::Error> for CredError {
    fn from(err: std::io::Error) -> Self {
        CredError::IoFailure(err.to_string())
    }
}

impl From<serde_json::Error> for CredError {
    fn from(err: serde_json::Error) -> Self {
        CredError::ParseFailure(format!("JSON parse error: {}", err))
    }
}

impl From<trust_dns_resolver::error::ResolveError> for CredError {
    fn from(err: trust_dns_resolver::error::ResolveError) -> Self {
        CredError::DnsFailure(err.to_string())
    }
}

/// Result type alias for credential operations
pub(crate) type Result<T> = std::result::Result<T, CredError>;
