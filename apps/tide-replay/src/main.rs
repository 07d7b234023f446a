mod config;
mod error;
mod replay;
mod trace;

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::ReplayConfig;
use crate::error::ReplayError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a message trace through the ordering engine", long_about = None)]
struct Cli {
    /// JSON-lines trace of real-time messages, in arrival order
    #[arg(long)]
    trace: PathBuf,
    /// JSON-lines history served by the fixture storage node
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Pass messages through in arrival order
    #[arg(long)]
    no_ordering: bool,
    #[arg(long)]
    max_requests_per_gap: Option<u32>,
    /// Log filter, overrides RUST_LOG
    #[arg(long, env = "TIDE_LOG")]
    log_level: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), ReplayError> {
    let mut cfg = ReplayConfig::new(cli.config)?;
    if cli.no_ordering {
        cfg.ordering_enabled = false;
    }
    if let Some(max) = cli.max_requests_per_gap {
        cfg.max_requests_per_gap = max;
    }

    let stored = match &cli.storage {
        Some(path) => trace::read_records(path)?,
        None => Vec::new(),
    };
    let file = File::open(&cli.trace).map_err(|source| ReplayError::Read {
        path: cli.trace.clone(),
        source,
    })?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    replay::replay(&cfg, BufReader::new(file), stored, &mut out).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    if let Err(err) = run(cli).await {
        error!("{err}");
        std::process::exit(1);
    }
}
