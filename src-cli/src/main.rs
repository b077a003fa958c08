//! Axis Fulfillment - command-line driver
//!
//! Fulfills one book, printing progress, and cancels cleanly on Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use axis_core::{
    Config, Database, FulfillmentError, FulfillmentLedger, FulfillmentOrchestrator,
    ReqwestTransport, StaticIdentity,
};
use clap::Parser;
use tokio::runtime::Handle;

#[derive(Debug, Parser)]
#[command(name = "axis-fulfill", version, about = "Download and validate an Axis DRM book")]
struct Args {
    /// Book ISBN
    #[arg(long)]
    isbn: String,

    /// Vault identifier issued with the entitlement
    #[arg(long)]
    vault_id: String,

    #[arg(long)]
    device_id: String,

    /// Client address sent with the license request
    #[arg(long)]
    client_ip: Option<String>,

    /// Destination directory [default: configured library directory]
    #[arg(long)]
    dest: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    axis_core::init_logging();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let Args {
        isbn,
        vault_id,
        device_id,
        client_ip,
        dest,
        config,
    } = args;

    let config = match config {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let destination = dest.unwrap_or_else(|| config.library_dir.clone());
    let transport = ReqwestTransport::new().context("failed to create HTTP client")?;
    let ledger = open_ledger(&config);

    let mut orchestrator = FulfillmentOrchestrator::new(
        config,
        Arc::new(transport),
        Arc::new(StaticIdentity::new(device_id, client_ip)),
        Handle::current(),
    );
    if let Some(ledger) = ledger {
        orchestrator = orchestrator.with_ledger(ledger);
    }

    let handle = orchestrator.start(&isbn, &vault_id, &destination);
    handle.on_progress(|progress| println!("{:>5.1}%", progress * 100.0));

    let result = tokio::select! {
        result = handle.finished() => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            handle.cancel();
            handle.finished().await
        }
    };

    match result {
        Ok(()) => {
            println!("Fulfilled {isbn} into {}", handle.book_dir().display());
            Ok(ExitCode::SUCCESS)
        }
        Err(FulfillmentError::UserCancelled) => {
            eprintln!("{}", FulfillmentError::UserCancelled.user_message());
            Ok(ExitCode::from(130))
        }
        Err(e) => {
            tracing::debug!(error = %e, retryable = e.is_retryable(), "Fulfillment failed");
            eprintln!("{}", e.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// `None` when the ledger database cannot be opened
fn open_ledger(config: &Config) -> Option<FulfillmentLedger> {
    if let Some(parent) = config.database_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "Ledger directory unavailable");
            return None;
        }
    }

    match Database::open(&config.database_path).and_then(FulfillmentLedger::open) {
        Ok(ledger) => Some(ledger),
        Err(e) => {
            tracing::warn!(path = %config.database_path.display(), error = %e, "Ledger unavailable");
            None
        }
    }
}
