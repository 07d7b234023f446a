use std::path::PathBuf;

use thiserror::Error;
use tide_core::TideError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid ordering config: {0}")]
    InvalidConfig(#[from] tide_ordering::config::ConfigError),
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("input failed: {0}")]
    Input(#[from] TideError),
}
