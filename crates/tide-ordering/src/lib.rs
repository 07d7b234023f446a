//! TIDE ordering engine.
//!
//! This crate turns an unordered, possibly duplicated multi-publisher message
//! stream into per-chain ordered output, backfilling missing ranges from
//! storage nodes and giving up on them after a bounded number of attempts.

pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod filled_chain;
pub mod gap_filler;
pub mod sequencer;
pub mod stats;
pub mod storage;

pub use chain::{ChainEvent, OrderedMessageChain};
pub use config::{GapFillStrategy, GapFillerConfig, OrderingConfig};
pub use dispatcher::{ChainDispatcher, DispatcherHandle, OrderedStream, OrderingEvent};
pub use sequencer::{ChainSequencer, SequencerOutput, TransformFailure};
pub use stats::{OrderingStats, OrderingStatsSnapshot};
pub use storage::{InMemoryStorage, ResendError, ResendSource, StorageNodeAddress};
