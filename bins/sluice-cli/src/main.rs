//! # Sluice CLI - Extract-Load Job Runner
//!
//! Loads a declarative YAML job configuration and executes it as one
//! task: source → dataflow → target, under the configured load mode.
//!
//! ## Usage
//!
//! ```bash
//! # Run a job from a YAML configuration file
//! sluice --config jobs/orders.yml
//!
//! # Pipe CSV through the engine
//! cat data.csv | sluice --config jobs/load.yml --stdin
//!
//! # Enable debug logging
//! RUST_LOG=debug sluice --config jobs/orders.yml
//! ```
//!
//! Exits non-zero when the task ends in error; a no-new-files
//! incremental run is a success.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_core::Config;
use sluice_task::TaskExecution;
use tokio::signal;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the Sluice job runner
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Streaming extract-load job runner")]
struct Args {
    /// Job YAML configuration file defining source, target, and mode
    #[arg(short, long)]
    config: PathBuf,

    /// Read the source from standard input (CSV with headers)
    #[arg(long)]
    stdin: bool,

    /// Write the target to standard output as CSV
    #[arg(long)]
    stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config: Config = {
        let body = std::fs::read_to_string(&args.config)
            .with_context(|| format!("could not read {}", args.config.display()))?;
        serde_yaml::from_str(&body).context("invalid job configuration")?
    };
    config.options.stdin |= args.stdin;
    config.options.stdout |= args.stdout;

    let mut task = TaskExecution::new(config)?;
    let cancel = task.cancel_token();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            eprintln!("\nreceived ctrl-c, interrupting task...");
            cancel.cancel();
        }
    });

    if let Err(err) = task.execute().await {
        error!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}
