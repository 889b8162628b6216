//! Renewal Engine
//!
//! Periodically scans the lease metadata, parses `klist` output for the
//! krbtgt renewal deadline, and reissues any ticket whose deadline is
//! within the renewal threshold. Only one pass runs at a time; ticks that
//! land during a pass are coalesced.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::errors::{CredError, Result};
use crate::exec::ShellCommand;
use crate::gmsa;
use crate::lease_store::{self, KrbTicketInfo, LeaseStore};
use crate::ticket_issuer::{self, KLIST};

/// Tickets whose renewal deadline is at most this many hours away are due.
pub(crate) const RENEW_TICKET_HOURS: i64 = 6;

const SECONDS_IN_HOUR: f64 = 3600.0;

/// krbtgt line with four-digit years:
/// `12/04/2023 19:39:06  12/05/2023 05:39:06  krbtgt/...`
const KRBTGT_LINE_4Y: &str = r"([0-9]{2}/[0-9]{2}/[0-9]{4}) +([0-9]{2}:[0-9]{2}:[0-9]{2}) +([0-9]{2}/[0-9]{2}/[0-9]{4}) +([0-9]{2}:[0-9]{2}:[0-9]{2}) +krbtgt";
/// Same with two-digit years, as some klist builds print.
const KRBTGT_LINE_2Y: &str = r"([0-9]{2}/[0-9]{2}/[0-9]{2}) +([0-9]{2}:[0-9]{2}:[0-9]{2}) +([0-9]{2}/[0-9]{2}/[0-9]{2}) +([0-9]{2}:[0-9]{2}:[0-9]{2}) +krbtgt";

fn krbtgt_regex_4y() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(KRBTGT_LINE_4Y).expect("valid krbtgt pattern"))
}

fn krbtgt_regex_2y() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(KRBTGT_LINE_2Y).expect("valid krbtgt pattern"))
}

/// Extracts the expiry (`MM/DD/YYYY HH:MM:SS`) of the krbtgt ticket from
/// klist output. Tries the four-digit-year format first, then two-digit.
/// Returns an empty string when neither matches.
pub(crate) fn parse_ticket_expiration(klist_output: &str) -> String {
    for pattern in [krbtgt_regex_4y(), krbtgt_regex_2y()] {
        if let Some(captures) = pattern.captures(klist_output) {
            return format!("{} {}", &captures[3], &captures[4]);
        }
    }
    String::new()
}

fn parse_deadline(text: &str) -> Option<NaiveDateTime> {
    // The year token decides the format; `%Y` would happily parse a
    // two-digit year as year 23.
    match text.split(['/', ' ']).nth(2).map(str::len) {
        Some(4) => NaiveDateTime::parse_from_str(text, "%m/%d/%Y %H:%M:%S").ok(),
        Some(2) => NaiveDateTime::parse_from_str(text, "%m/%d/%y %H:%M:%S").ok(),
        _ => None,
    }
}

/// Whether a ticket needs renewal, judged purely from klist output and the
/// current time. Output without a `renew until` segment or a parsable
/// krbtgt line is never due (the caller logs and skips it).
pub(crate) fn is_ticket_due(
    klist_output: &str,
    now: NaiveDateTime,
    threshold_hours: i64,
) -> bool {
    if !klist_output.contains("renew until") {
        return false;
    }
    let expiration = parse_ticket_expiration(klist_output);
    if expiration.is_empty() {
        warn!("unable to parse klist output for ticket expiration");
        return false;
    }
    let Some(deadline) = parse_deadline(&expiration) else {
        return false;
    };
    let hours = (deadline - now).num_seconds() as f64 / SECONDS_IN_HOUR;
    hours <= threshold_hours as f64
}

/// Caller identity for renewing tickets created in domainless mode. The
/// password is scrubbed when the caller's request goes out of scope.
pub(crate) struct DomainlessUser {
    pub domain: String,
    pub username: Zeroizing<String>,
    pub password: Zeroizing<String>,
}

/// Outcome counters of one renewal pass.
#[derive(Debug, Default)]
pub(crate) struct PassSummary {
    pub checked: usize,
    pub renewed: Vec<String>,
    pub failed: usize,
}

pub(crate) struct RenewalEngine {
    config: Config,
    store: LeaseStore,
    threshold_hours: i64,
    interval: Duration,
    pass_lock: Mutex<()>,
}

impl RenewalEngine {
    pub(crate) fn new(config: Config, store: LeaseStore) -> Self {
        Self {
            config,
            store,
            threshold_hours: RENEW_TICKET_HOURS,
            interval: Duration::from_secs(600),
            pass_lock: Mutex::new(()),
        }
    }

    pub(crate) fn with_threshold_hours(mut self, hours: i64) -> Self {
        self.threshold_hours = hours;
        self
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one renewal pass over every metadata file. Re-entrant calls
    /// coalesce: if a pass is already running this returns immediately.
    ///
    /// With `domainless` set, only tickets created by that user are renewed
    /// and a failed renewal refreshes the user TGT before one retry.
    pub(crate) async fn run_pass(&self, domainless: Option<&DomainlessUser>) -> PassSummary {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            info!("renewal pass already running, coalescing tick");
            return PassSummary::default();
        };

        let mut summary = PassSummary::default();
        let metadata_files = match self.store.list_metadata_files() {
            Ok(files) => files,
            Err(err) => {
                error!(kind = err.kind(), "cannot enumerate lease metadata: {}", err);
                return summary;
            }
        };

        // Identical consecutive failures collapse into one log line.
        let mut last_failure: Option<String> = None;
        let mut suppressed = 0usize;

        for file in metadata_files {
            let tickets = match lease_store::read_metadata(&file) {
                Ok(tickets) => tickets,
                Err(err) => {
                    warn!(file = %file.display(), kind = err.kind(), "skipping unreadable metadata: {}", err);
                    continue;
                }
            };

            for ticket in tickets {
                if let Some(user) = domainless {
                    if ticket.domainless_user.is_empty()
                        || ticket.domainless_user != user.username.as_str()
                    {
                        continue;
                    }
                }
                summary.checked += 1;

                match self.ticket_is_due(&ticket).await {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        warn!(
                            account = %ticket.service_account_name,
                            kind = err.kind(),
                            "klist check failed: {}",
                            err
                        );
                        continue;
                    }
                }

                info!(
                    account = %ticket.service_account_name,
                    cache = %ticket.krb_file_path,
                    "ticket due for renewal"
                );
                match self.renew_ticket(&ticket, domainless).await {
                    Ok(path) => {
                        last_failure = None;
                        summary.renewed.push(path);
                    }
                    Err(err) => {
                        summary.failed += 1;
                        let line = format!(
                            "cannot renew ticket for {}: {}",
                            ticket.service_account_name, err
                        );
                        if last_failure.as_deref() == Some(line.as_str()) {
                            suppressed += 1;
                        } else {
                            error!(kind = err.kind(), "{}", line);
                            last_failure = Some(line);
                        }
                    }
                }
            }
        }

        if suppressed > 0 {
            warn!(suppressed, "identical renewal failures coalesced");
        }
        info!(
            checked = summary.checked,
            renewed = summary.renewed.len(),
            failed = summary.failed,
            "renewal pass complete"
        );
        summary
    }

    /// Checks one ticket's cred cache with `klist`.
    async fn ticket_is_due(&self, ticket: &KrbTicketInfo) -> Result<bool> {
        let output = ShellCommand::new(KLIST)
            .env("KRB5CCNAME", &ticket.krb_file_path)
            .timeout(self.config.command_timeout())
            .run()
            .await?;
        if !output.success() {
            return Err(CredError::ParseFailure(format!(
                "klist exited {} for {}",
                output.exit_code, ticket.krb_file_path
            )));
        }
        let now = Local::now().naive_local();
        Ok(is_ticket_due(&output.text(), now, self.threshold_hours))
    }

    /// Reissues one due ticket. In domainless mode a failure refreshes the
    /// user TGT and retries once before giving up.
    async fn renew_ticket(
        &self,
        ticket: &KrbTicketInfo,
        domainless: Option<&DomainlessUser>,
    ) -> Result<String> {
        let first_attempt = gmsa::issue_gmsa_ticket(
            &self.config,
            &ticket.domain_name,
            &ticket.service_account_name,
            &ticket.krb_file_path,
        )
        .await;

        match first_attempt {
            Ok(outcome) if outcome.success() => return Ok(ticket.krb_file_path.clone()),
            Ok(outcome) => {
                warn!(
                    account = %ticket.service_account_name,
                    exit = outcome.exit_code,
                    "cannot get gMSA ticket, possibly expired user/machine ticket"
                );
            }
            Err(err) => {
                warn!(
                    account = %ticket.service_account_name,
                    kind = err.kind(),
                    "cannot get gMSA ticket: {}",
                    err
                );
            }
        }

        let Some(user) = domainless else {
            return Err(CredError::KinitFailure(format!(
                "renewal failed for {}",
                ticket.service_account_name
            )));
        };
        if ticket.domainless_user != user.username.as_str() {
            return Err(CredError::KinitFailure(format!(
                "renewal failed for {} (no matching domainless user)",
                ticket.service_account_name
            )));
        }

        // Refresh the user TGT, then retry the gMSA ticket once.
        let refresh = ticket_issuer::issue_domainless(
            &self.config,
            &user.domain,
            &user.username,
            &user.password,
        )
        .await?;
        if !refresh.success() {
            return Err(CredError::KinitFailure(format!(
                "user TGT refresh exited {}",
                refresh.exit_code
            )));
        }

        let retry = gmsa::issue_gmsa_ticket(
            &self.config,
            &ticket.domain_name,
            &ticket.service_account_name,
            &ticket.krb_file_path,
        )
        .await?;
        if retry.success() {
            Ok(ticket.krb_file_path.clone())
        } else {
            Err(CredError::KinitFailure(format!(
                "renewal retry exited {} for {}",
                retry.exit_code, ticket.service_account_name
            )))
        }
    }
}
