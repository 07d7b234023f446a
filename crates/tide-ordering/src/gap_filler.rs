//! Active backfill of one detected gap.
//!
//! A `GapFiller` is created per gap and runs as its own task. It first waits
//! `initial_wait_time` so that late real-time data can close the gap for free,
//! then asks randomly chosen storage nodes for the missing range up to
//! `max_requests_per_gap` times, feeding everything it gets back into the
//! chain. If the gap is still open afterwards, it asks the chain to resolve
//! the gap by force.
//!
//! The task's token is cancelled by the chain the moment the gap closes, and
//! by the dispatcher on destroy. Cancellation ends the task silently.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::seq::SliceRandom;
use tide_core::Gap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{GapFillStrategy, GapFillerConfig};
use crate::filled_chain::FilledChain;
use crate::stats::OrderingStats;
use crate::storage::{ResendError, ResendSource, StorageNodeAddress, StorageNodeCache};

/// Collaborators shared by every gap fill task of one dispatcher.
pub struct GapFillContext {
    pub config: GapFillerConfig,
    pub resend: Arc<dyn ResendSource>,
    pub storage_nodes: Arc<StorageNodeCache>,
    pub stats: Arc<OrderingStats>,
}

impl GapFillContext {
    pub fn new(
        config: GapFillerConfig,
        resend: Arc<dyn ResendSource>,
        stats: Arc<OrderingStats>,
    ) -> Self {
        let storage_nodes = Arc::new(StorageNodeCache::new(Arc::clone(&resend)));
        Self {
            config,
            resend,
            storage_nodes,
            stats,
        }
    }
}

pub struct GapFiller {
    gap: Gap,
    gap_id: u64,
    chain: FilledChain,
    ctx: Arc<GapFillContext>,
    cancel: CancellationToken,
}

impl GapFiller {
    pub(crate) fn new(
        gap: Gap,
        gap_id: u64,
        chain: FilledChain,
        ctx: Arc<GapFillContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gap,
            gap_id,
            chain,
            ctx,
            cancel,
        }
    }

    pub async fn run(self) {
        if !self.wait(self.ctx.config.initial_wait_time).await {
            return;
        }
        if self.ctx.config.max_requests_per_gap > 0 {
            self.fill_from_storage().await;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        let to = match self.ctx.config.strategy {
            GapFillStrategy::Full => Some(self.gap.to.message_ref),
            GapFillStrategy::Light => None,
        };
        self.chain.resolve_unfillable(self.gap_id, to);
    }

    /// Sleeps unless cancelled first; returns false on cancellation.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn fill_from_storage(&self) {
        let key = self.chain.key();
        let lookup = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            lookup = self.ctx.storage_nodes.get() => lookup,
        };
        let addresses = match lookup {
            Ok(addresses) if !addresses.is_empty() => addresses,
            Ok(_) => {
                debug!(
                    publisher_id = %key.publisher_id,
                    msg_chain_id = %key.msg_chain_id,
                    "no storage nodes available for gap fill"
                );
                return;
            }
            Err(err) => {
                warn!(
                    publisher_id = %key.publisher_id,
                    msg_chain_id = %key.msg_chain_id,
                    error = %err,
                    "storage node lookup failed"
                );
                return;
            }
        };

        let max_requests = self.ctx.config.max_requests_per_gap;
        for attempt in 1..=max_requests {
            let Some(address) = addresses.choose(&mut rand::thread_rng()).cloned() else {
                return;
            };
            self.ctx.stats.note_resend_attempt();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                outcome = self.fetch_into_chain(&address) => outcome,
            };
            match outcome {
                Ok(received) => debug!(
                    publisher_id = %key.publisher_id,
                    msg_chain_id = %key.msg_chain_id,
                    storage_node = %address,
                    attempt,
                    received,
                    "resend finished"
                ),
                Err(err) => {
                    self.ctx.stats.note_resend_failure();
                    warn!(
                        publisher_id = %key.publisher_id,
                        msg_chain_id = %key.msg_chain_id,
                        storage_node = %address,
                        attempt,
                        error = %err,
                        "resend failed"
                    );
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }
            if attempt < max_requests && !self.wait(self.ctx.config.retry_wait_time).await {
                return;
            }
        }
    }

    async fn fetch_into_chain(&self, address: &StorageNodeAddress) -> Result<usize, ResendError> {
        let mut messages = self
            .ctx
            .resend
            .resend(&self.gap, address, self.cancel.clone())
            .await?;
        let mut received = 0_usize;
        while let Some(msg) = messages.next().await {
            self.chain.add_message(msg?);
            received += 1;
        }
        Ok(received)
    }
}
