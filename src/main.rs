//! CLI binary for the relay replicator.
//!
//! One invocation is one agent run; schedule it externally.

use clap::Parser;
use relay_replicator::{Replicator, ReplicatorConfig, SqliteLedger};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay Replicator - change-tracking replication through a relay database.
#[derive(Parser, Debug)]
#[command(name = "relay-replicator")]
#[command(about = "Runs one master or slave replication cycle")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: PathBuf,

    /// Log level or filter directive; overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration, print it as JSON and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Invalid arguments exit 1, not clap's default 2.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(args.log_level.as_deref());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ReplicatorConfig::from_file(&args.config)?;

    if args.validate {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    config.log_summary();
    let ledger = SqliteLedger::new(&config.ledger.sqlite_path, config.ledger.wal_mode).await?;
    let ledger = Arc::new(ledger);

    let replicator = Replicator::new(config, ledger.clone());
    let result = replicator.run().await;
    ledger.close().await;

    let summary = result?;
    info!(
        path = summary.path,
        ctids = ?summary.ctids,
        tables_skipped = summary.tables_skipped.len(),
        "Done"
    );
    Ok(())
}
