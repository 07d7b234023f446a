//! Core TIDE primitives shared across crates.
//!
//! Includes message references, chain identity, the gap model, and base errors.

pub mod error;
pub mod gap;
pub mod types;

pub use error::TideError;
pub use gap::{Gap, ResendRange};
pub use types::{ChainKey, MessageRef, PublisherId, StreamMessage};
