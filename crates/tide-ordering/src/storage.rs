//! Historical-data collaborator contract.
//!
//! The engine never talks to storage nodes directly; it only depends on the
//! [`ResendSource`] trait defined here.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use thiserror::Error;
use tide_core::{Gap, StreamMessage};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Opaque storage node address (URL, account address, peer id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageNodeAddress(pub String);

impl From<&str> for StorageNodeAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for StorageNodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResendError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage request timed out")]
    Timeout,
    #[error("resend cancelled")]
    Cancelled,
}

/// Lazily produced messages returned by one resend request.
pub type MessageStream = BoxStream<'static, Result<StreamMessage, ResendError>>;

/// Historical-data source used to backfill gaps.
#[async_trait]
pub trait ResendSource: Send + Sync {
    /// Storage nodes able to serve the subscribed stream. Empty is valid.
    async fn storage_node_addresses(&self) -> Result<Vec<StorageNodeAddress>, ResendError>;

    /// Fetches the messages of `gap.resend_range()` from one storage node.
    ///
    /// Implementations must stop promptly once `cancel` fires. An empty
    /// stream means the node has no data for the range.
    async fn resend(
        &self,
        gap: &Gap,
        storage_node: &StorageNodeAddress,
        cancel: CancellationToken,
    ) -> Result<MessageStream, ResendError>;
}

/// Caches the first successful storage node lookup for a dispatcher's lifetime.
pub struct StorageNodeCache {
    source: Arc<dyn ResendSource>,
    cached: OnceCell<Vec<StorageNodeAddress>>,
}

impl StorageNodeCache {
    pub fn new(source: Arc<dyn ResendSource>) -> Self {
        Self {
            source,
            cached: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Vec<StorageNodeAddress>, ResendError> {
        self.cached
            .get_or_try_init(|| self.source.storage_node_addresses())
            .await
            .cloned()
    }
}

/// In-memory storage node set for tests and trace replay.
///
/// Every configured address serves the same message set.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    messages: Vec<StreamMessage>,
    addresses: Vec<StorageNodeAddress>,
    address_calls: AtomicUsize,
    resend_calls: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new(addresses: Vec<StorageNodeAddress>, mut messages: Vec<StreamMessage>) -> Self {
        messages.sort_by_key(|m| m.message_ref);
        Self {
            messages,
            addresses,
            address_calls: AtomicUsize::new(0),
            resend_calls: AtomicUsize::new(0),
        }
    }

    /// Storage with a single node named `address`.
    pub fn single_node(address: &str, messages: Vec<StreamMessage>) -> Self {
        Self::new(vec![StorageNodeAddress::from(address)], messages)
    }

    pub fn address_calls(&self) -> usize {
        self.address_calls.load(Ordering::Relaxed)
    }

    pub fn resend_calls(&self) -> usize {
        self.resend_calls.load(Ordering::Relaxed)
    }

    pub fn stored_len(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl ResendSource for InMemoryStorage {
    async fn storage_node_addresses(&self) -> Result<Vec<StorageNodeAddress>, ResendError> {
        self.address_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.addresses.clone())
    }

    async fn resend(
        &self,
        gap: &Gap,
        storage_node: &StorageNodeAddress,
        cancel: CancellationToken,
    ) -> Result<MessageStream, ResendError> {
        self.resend_calls.fetch_add(1, Ordering::Relaxed);
        if cancel.is_cancelled() {
            return Err(ResendError::Cancelled);
        }
        if !self.addresses.contains(storage_node) {
            return Err(ResendError::Unavailable(format!(
                "unknown storage node {storage_node}"
            )));
        }
        let range = gap.resend_range();
        let found: Vec<_> = self
            .messages
            .iter()
            .filter(|m| m.chain_key() == range.key && range.contains(&m.message_ref))
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(found)
            .take_until(cancel.cancelled_owned())
            .boxed())
    }
}
