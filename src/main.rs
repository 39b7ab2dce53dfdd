//! Command-line entry point for the replicator.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use depot_relay::client::p4::{P4Source, P4Target};
use depot_relay::config::{Config, parse_end_datetime};
use depot_relay::errors::RelayError;
use depot_relay::logging;
use depot_relay::replicate::driver::{DriverOptions, Replicator};

/// One-way changelist replicator between two depot servers.
#[derive(Parser, Debug)]
#[command(name = "depot-relay", version, about)]
struct Cli {
    /// Path to the transfer configuration file.
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    config: PathBuf,

    /// Stop on the first change that fails to submit.
    #[arg(short = 's', long = "stop-on-error")]
    stop_on_error: bool,

    /// Replicate at most N changes, then stop.
    #[arg(short = 'm', long = "max-changes", value_name = "N")]
    max_changes: Option<u64>,

    /// Wall-clock cutoff, `YYYY/M/D HH:MM`.
    #[arg(long = "end-datetime", value_name = "DT")]
    end_datetime: Option<String>,

    /// Strip keyword expansion from every replicated file type.
    #[arg(long = "nokeywords")]
    nokeywords: bool,

    /// Drop and reopen server connections every N changes.
    #[arg(long = "reset-connection", value_name = "N")]
    reset_connection: Option<u64>,
}

fn run(cli: Cli) -> Result<(), RelayError> {
    let config = Config::load(&cli.config)?;
    let log = logging::init(config.logfile.clone())?;

    let end_datetime = cli
        .end_datetime
        .as_deref()
        .map(parse_end_datetime)
        .transpose()?;

    let mut source = P4Source::new(
        &config.source.p4port,
        &config.source.p4user,
        &config.source.p4client,
    );
    let mut target = P4Target::new(
        &config.target.p4port,
        &config.target.p4user,
        &config.target.p4client,
        &config.workspace_root,
    );

    let options = DriverOptions {
        max_changes: cli.max_changes,
        stop_on_error: cli.stop_on_error,
        nokeywords: cli.nokeywords,
        reset_connection: cli.reset_connection,
        end_datetime,
    };
    let summary = Replicator::new(&config, &mut source, &mut target, options)
        .with_log(log)
        .run()?;
    eprintln!(
        "transferred {} change(s), skipped {}",
        summary.transferred, summary.skipped
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ RelayError::Config(_)) => {
            error!(%error, "configuration error");
            eprintln!("{error}");
            ExitCode::from(2)
        }
        Err(error) => {
            error!(%error, "replication failed");
            eprintln!("{error}");
            ExitCode::from(1)
        }
    }
}
