//! Ticket Issuer
//!
//! Establishes the initial Kerberos identity later used for the GSSAPI
//! LDAP bind, in one of three modes:
//! - machine keytab (`/etc/krb5.keytab`, domain-joined hosts)
//! - user credentials held in the secrets store
//! - explicit domainless user credentials
//!
//! Passwords reach `kinit` over stdin only and are zeroized after use.

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::errors::{CredError, Result};
use crate::exec::{self, ShellCommand};
use crate::principal;
use crate::secrets_manager::{self, AWS_CLI};

pub(crate) const KINIT: &str = "kinit";
pub(crate) const LDAPSEARCH: &str = "ldapsearch";
pub(crate) const KLIST: &str = "klist";
pub(crate) const KDESTROY: &str = "kdestroy";

/// Exit status and diagnostic text of one issuance attempt.
#[derive(Debug)]
pub(crate) struct IssueOutcome {
    pub exit_code: i32,
    pub diagnostic: String,
}

impl IssueOutcome {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Verifies that every required external tool is present and executable.
pub(crate) fn preflight(tools: &[&str]) -> Result<()> {
    for tool in tools {
        exec::require_tool(tool)?;
    }
    Ok(())
}

/// Issues the machine TGT from `/etc/krb5.keytab`.
///
/// The machine principal is derived from the host name and joined realm,
/// e.g. `EC2AMAZ-Q5VJZQ$@CONTOSO.COM`.
pub(crate) async fn issue_machine(config: &Config, domain: &str) -> Result<IssueOutcome> {
    preflight(&["hostname", "realm", KINIT, LDAPSEARCH])?;
    exec::validate_domain(domain)?;

    let machine_principal = principal::machine_principal().await?;
    info!(domain, principal = %machine_principal, "issuing machine ticket from keytab");

    let output = ShellCommand::new(KINIT)
        .arg("-k")
        .arg(&machine_principal)
        .timeout(config.command_timeout())
        .run()
        .await?;
    if !output.success() {
        warn!(principal = %machine_principal, exit = output.exit_code, "machine kinit failed");
    }
    Ok(IssueOutcome {
        exit_code: output.exit_code,
        diagnostic: output.text(),
    })
}

/// Issues a user TGT with credentials fetched from the secrets store.
///
/// Returns the distinguished name stored alongside the credentials (empty
/// when the secret does not carry one) so the gMSA fetch can reuse it. The
/// fetched username and password are zeroized when the secret drops.
pub(crate) async fn issue_user_from_secret(
    config: &Config,
    domain: &str,
    secret_name: &str,
) -> Result<(IssueOutcome, String)> {
    preflight(&[KINIT, LDAPSEARCH, AWS_CLI])?;
    exec::validate_domain(domain)?;

    let secret = secrets_manager::fetch(config, secret_name)
        .await?
        .ok_or_else(|| {
            CredError::SecretsStoreFailure(format!("secret {} not found", secret_name))
        })?;
    let distinguished_name = secret.distinguished_name.clone();

    let outcome = kinit_user(config, domain, &secret.username, &secret.password).await?;
    Ok((outcome, distinguished_name))
}

/// Issues a user TGT from explicit domainless credentials. The password is
/// only borrowed for the call; the caller's `Zeroizing` wrapper scrubs it.
pub(crate) async fn issue_domainless(
    config: &Config,
    domain: &str,
    username: &str,
    password: &Zeroizing<String>,
) -> Result<IssueOutcome> {
    preflight(&[KINIT, LDAPSEARCH])?;
    exec::validate_domain(domain)?;
    kinit_user(config, domain, username, password).await
}

/// Drives `kinit <user>@<REALM>` with the password written to stdin.
async fn kinit_user(
    config: &Config,
    domain: &str,
    username: &str,
    password: &str,
) -> Result<IssueOutcome> {
    exec::validate_token(username, "user name")?;

    let user_principal = principal::user_principal(username, domain);
    info!(principal = %user_principal, "issuing user ticket");

    // kinit's prompter reads the password up to the newline.
    let mut password_line = Zeroizing::new(Vec::with_capacity(password.len() + 1));
    password_line.extend_from_slice(password.as_bytes());
    password_line.push(b'\n');

    let output = ShellCommand::new(KINIT)
        .arg(&user_principal)
        .timeout(config.command_timeout())
        .run_with_stdin_bytes(&password_line)
        .await?;

    if !output.success() {
        warn!(principal = %user_principal, exit = output.exit_code, "user kinit failed");
    }
    Ok(IssueOutcome {
        exit_code: output.exit_code,
        diagnostic: output.text(),
    })
}
