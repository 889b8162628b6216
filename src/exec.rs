//! Shell/Exec adapter
//!
//! Every external command the daemon runs (`hostname`, `realm`, `kinit`,
//! `ldapsearch`, `klist`, `kdestroy`, the AWS CLI) goes through this module.
//! Arguments that originate outside the daemon are checked against a
//! character denylist before any process is forked, and secret bytes only
//! ever travel over stdin pipes, never over argv or the environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{CredError, Result};

/// Characters never allowed in externally supplied command arguments.
pub(crate) const INVALID_CHARACTERS: [char; 24] = [
    '&', '|', ';', ':', '$', '*', '?', '<', '>', '!', ' ', '\\', '.', ']', '[', '+', '\'', '`',
    '~', '}', '{', '"', ')', '(',
];

/// Upper bound on a single external command, renewal operations included.
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn contains_invalid_characters(value: &str) -> bool {
    value.chars().any(|c| INVALID_CHARACTERS.contains(&c))
}

/// Validates an externally supplied token (lease id, account name, user name)
/// against the denylist. Empty tokens are rejected as well.
pub(crate) fn validate_token(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CredError::InvalidArgument(format!("{} is empty", what)));
    }
    if contains_invalid_characters(value) {
        return Err(CredError::InvalidArgument(format!(
            "{} {:?} contains disallowed characters",
            what, value
        )));
    }
    Ok(())
}

/// Validates an externally supplied DNS domain name. Dots separate labels;
/// every label must individually satisfy the token denylist.
pub(crate) fn validate_domain(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CredError::InvalidArgument("domain name is empty".to_string()));
    }
    for label in value.split('.') {
        validate_token(label, "domain label")?;
    }
    Ok(())
}

/// Exit status plus combined stdout/stderr of a finished command.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output as lossy UTF-8, for parsing and diagnostics.
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Builder for one external command invocation.
pub(crate) struct ShellCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl ShellCommand {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Appends a fixed, daemon-controlled argument.
    pub(crate) fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub(crate) fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the command, capturing combined stdout/stderr.
    pub(crate) async fn run(&self) -> Result<CommandOutput> {
        self.spawn_and_wait(None).await
    }

    /// Runs the command with `bytes` written to its stdin. This is the only
    /// way secret material may reach a child process.
    pub(crate) async fn run_with_stdin_bytes(&self, bytes: &[u8]) -> Result<CommandOutput> {
        self.spawn_and_wait(Some(bytes)).await
    }

    async fn spawn_and_wait(&self, stdin_bytes: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(program = %self.program, args = ?self.args, "running external command");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if stdin_bytes.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|err| CredError::IoFailure(format!("spawning {}: {}", self.program, err)))?;

        if let Some(bytes) = stdin_bytes {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                CredError::IoFailure(format!("no stdin pipe for {}", self.program))
            })?;
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
            drop(stdin);
        }

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(result) => result?,
            Err(_) => {
                return Err(CredError::IoFailure(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                )));
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

/// Checks that `name` resolves to a regular, executable file. Accepts an
/// absolute path or a bare program name searched on `PATH`.
pub(crate) fn require_tool(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        if is_executable_file(path) {
            return Ok(path.to_path_buf());
        }
        return Err(CredError::ToolingMissing(name.to_string()));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search_path) {
        let candidate = dir.join(name);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CredError::ToolingMissing(name.to_string()))
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
