//! gmsa-credd
//!
//! Long-running daemon that obtains and continuously renews Kerberos
//! credentials for Group Managed Service Accounts. Consumers reference a
//! credential lease; for each account of a lease the daemon keeps a valid
//! credential cache file on disk until the lease is released.

mod config;
mod dc_locator;
mod errors;
mod exec;
mod gmsa;
mod lease_store;
mod principal;
mod renewal;
mod secrets_manager;
mod secure_types;
mod ticket_issuer;

use std::process::ExitCode;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::config::Config;
use crate::lease_store::LeaseStore;
use crate::renewal::RenewalEngine;
use crate::ticket_issuer::{KDESTROY, KINIT, KLIST, LDAPSEARCH};

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            // Single structured error line on stderr for the service manager.
            eprintln!("gmsa-credd: fatal: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_process_env();
    let config = match std::env::args().nth(1) {
        Some(dir) => config.with_krb_dir(dir),
        None => config,
    };

    info!(krb_dir = %config.krb_dir().display(), "gmsa-credd starting");

    // Missing tooling is fatal at startup, not at first use.
    ticket_issuer::preflight(&["hostname", "realm", KINIT, LDAPSEARCH, KLIST, KDESTROY])
        .context("required tooling missing")?;

    std::fs::create_dir_all(config.krb_dir())
        .with_context(|| format!("creating state directory {}", config.krb_dir().display()))?;

    let store = LeaseStore::new(config.krb_dir());
    verify_metadata_readable(&store).context("corrupt lease metadata directory")?;

    let engine = RenewalEngine::new(config, store);

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut ticker = tokio::time::interval(engine.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // The in-flight pass always completes before shutdown is
                // observed; individual commands are bounded by the
                // per-operation timeout.
                engine.run_pass(None).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Startup sanity pass: every metadata file present on disk must parse.
fn verify_metadata_readable(store: &LeaseStore) -> anyhow::Result<()> {
    for file in store.list_metadata_files()? {
        lease_store::read_metadata(&file).map_err(|err| {
            error!(file = %file.display(), kind = err.kind(), "unreadable metadata");
            anyhow::anyhow!("{}: {}", file.display(), err)
        })?;
    }
    Ok(())
}
