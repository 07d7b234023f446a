use thiserror::Error;

/// Shared lightweight error type for core primitive operations and input streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TideError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Upstream message source failed; terminal for the consuming pipeline.
    #[error("upstream failure: {0}")]
    Upstream(String),
}
