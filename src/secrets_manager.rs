//! Secrets-Manager client
//!
//! Fetches the gMSA reader credentials (and optional distinguished name)
//! stored as a JSON blob in the cloud secrets store, by shelling out to the
//! provider CLI. The username and password fields are zeroized on drop and
//! the password is never logged.

use serde_json::Value;
use tracing::warn;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::errors::{CredError, Result};
use crate::exec::ShellCommand;

pub(crate) const AWS_CLI: &str = "/usr/bin/aws";

/// Credential material extracted from the secret JSON. Missing keys yield
/// empty strings rather than errors.
pub(crate) struct GmsaSecret {
    pub distinguished_name: String,
    pub username: Zeroizing<String>,
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for GmsaSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmsaSecret")
            .field("distinguished_name", &self.distinguished_name)
            .field("username", &self.username.as_str())
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Runs `aws secretsmanager get-secret-value` and parses the secret string.
///
/// Returns `Ok(None)` when the secret name is empty or the payload is not a
/// JSON object; CLI failures map to `SecretsStoreFailure`.
pub(crate) async fn fetch(config: &Config, secret_name: &str) -> Result<Option<GmsaSecret>> {
    if secret_name.trim().is_empty() {
        return Ok(None);
    }

    let output = ShellCommand::new(AWS_CLI)
        .arg("secretsmanager")
        .arg("get-secret-value")
        .arg("--secret-id")
        .arg(secret_name)
        .arg("--query")
        .arg("SecretString")
        .arg("--output")
        .arg("text")
        .timeout(config.command_timeout())
        .run()
        .await?;

    if !output.success() {
        return Err(CredError::SecretsStoreFailure(format!(
            "get-secret-value {} exited {}",
            secret_name, output.exit_code
        )));
    }

    match serde_json::from_str::<Value>(&output.text()) {
        Ok(root) if root.is_object() => Ok(Some(parse_secret(&root))),
        Ok(_) | Err(_) => {
            warn!(secret = secret_name, "secret payload is not a JSON object");
            Ok(None)
        }
    }
}

fn parse_secret(root: &Value) -> GmsaSecret {
    GmsaSecret {
        distinguished_name: string_field(root, "distinguishedName"),
        username: Zeroizing::new(string_field(root, "username")),
        password: Zeroizing::new(string_field(root, "password")),
    }
}

fn string_field(root: &Value, key: &str) -> String {
    root.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
