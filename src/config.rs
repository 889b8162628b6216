//! Daemon configuration
//!
//! Reads the ECS agent config file (`KEY=VALUE` lines) plus the `CF_*`
//! override variables once at startup. Operations receive this object
//! instead of consulting ambient globals, which keeps tests hermetic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

pub(crate) const CF_GMSA_BASE_DN: &str = "CF_GMSA_BASE_DN";
pub(crate) const CF_GMSA_SECRET_NAME: &str = "CF_GMSA_SECRET_NAME";
pub(crate) const CF_DOMAIN_CONTROLLER: &str = "CF_DOMAIN_CONTROLLER";
pub(crate) const CF_GMSA_OU: &str = "CF_GMSA_OU";

/// Keys the config file is allowed to set; anything else is ignored.
const RECOGNIZED_KEYS: [&str; 3] = [CF_GMSA_BASE_DN, CF_GMSA_SECRET_NAME, CF_DOMAIN_CONTROLLER];

/// Variables read from the process environment at startup.
const OVERRIDE_KEYS: [&str; 4] = [
    CF_GMSA_BASE_DN,
    CF_GMSA_SECRET_NAME,
    CF_DOMAIN_CONTROLLER,
    CF_GMSA_OU,
];

pub(crate) const DEFAULT_CONFIG_FILE: &str = "/etc/ecs/ecs.config";
pub(crate) const DEFAULT_KRB_DIR: &str = "/var/gmsa-credd/krbdir";

#[derive(Debug, Clone)]
pub(crate) struct Config {
    krb_dir: PathBuf,
    config_file: PathBuf,
    overrides: HashMap<String, String>,
    command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            krb_dir: PathBuf::from(DEFAULT_KRB_DIR),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            overrides: HashMap::new(),
            command_timeout: crate::exec::DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Config {
    /// Builds the daemon configuration, snapshotting the `CF_*` override
    /// variables from the process environment.
    pub(crate) fn from_process_env() -> Self {
        let mut config = Self::default();
        for key in OVERRIDE_KEYS {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    config.overrides.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        config
    }

    pub(crate) fn krb_dir(&self) -> &Path {
        &self.krb_dir
    }

    pub(crate) fn with_krb_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.krb_dir = dir.into();
        self
    }

    #[allow(dead_code)]
    pub(crate) fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = path.into();
        self
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Sets an override as if it had come from the environment.
    pub(crate) fn set_override(&mut self, key: &str, value: &str) {
        self.overrides.insert(key.to_string(), value.to_string());
    }

    /// Looks up a `CF_*` variable: the environment snapshot wins, then the
    /// config file. Empty values count as unset.
    pub(crate) fn lookup(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
        read_config_value(&self.config_file, key).filter(|v| !v.is_empty())
    }
}

/// Reads one recognized key from a `KEY=VALUE` config file.
///
/// The parse is all-or-nothing: any line that does not split into exactly
/// one `KEY=VALUE` pair (blank lines included) aborts the read with an
/// empty result.
pub(crate) fn read_config_value(path: &Path, key: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;

    for line in contents.lines() {
        let parts: Vec<&str> = line.split('=').collect();
        if parts.len() != 2 {
            warn!(file = %path.display(), "invalid configuration format, ignoring file");
            return None;
        }
        let file_key = parts[0].trim_end();
        let value = parts[1].trim_start();

        if file_key == key && RECOGNIZED_KEYS.contains(&file_key) {
            return Some(value.to_string());
        }
    }
    None
}
