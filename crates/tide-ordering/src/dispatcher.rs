//! Multi-chain ordering front door.
//!
//! The dispatcher routes every incoming message to the [`FilledChain`] of its
//! publisher and message chain, creating chains lazily, and merges the
//! ordered output of all chains into one [`OrderedStream`].

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tide_core::{ChainKey, Gap, StreamMessage, TideError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrderingConfig;
use crate::filled_chain::{FilledChain, OrderedItem};
use crate::gap_filler::GapFillContext;
use crate::stats::{OrderingStats, OrderingStatsSnapshot};
use crate::storage::ResendSource;

/// Observable engine event, tagged with the chain it happened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingEvent {
    GapFound { key: ChainKey, gap: Gap },
    GapResolved { key: ChainKey },
    UnfillableGap { key: ChainKey, gap: Gap },
    OrderedMessageAdded { key: ChainKey, message: StreamMessage },
}

/// Cloneable remote control for a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    token: CancellationToken,
}

impl DispatcherHandle {
    /// Cancels every chain and gap fill task; the output ends after
    /// already-emitted items are read.
    pub fn destroy(&self) {
        self.token.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ChainDispatcher {
    config: OrderingConfig,
    ctx: Arc<GapFillContext>,
    stats: Arc<OrderingStats>,
    chains: HashMap<ChainKey, FilledChain>,
    output: Option<mpsc::UnboundedSender<OrderedItem>>,
    events: Option<mpsc::UnboundedSender<OrderingEvent>>,
    token: CancellationToken,
}

impl ChainDispatcher {
    pub fn new(config: OrderingConfig, resend: Arc<dyn ResendSource>) -> (Self, OrderedStream) {
        let stats = Arc::new(OrderingStats::default());
        let ctx = Arc::new(GapFillContext::new(
            config.gap_filler_config(),
            resend,
            Arc::clone(&stats),
        ));
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            config,
            ctx,
            stats,
            chains: HashMap::new(),
            output: Some(tx),
            events: None,
            token: token.clone(),
        };
        let stream = OrderedStream {
            rx,
            token,
            closed: false,
        };
        (dispatcher, stream)
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            token: self.token.clone(),
        }
    }

    /// Event feed for chains created from now on.
    pub fn subscribe_events(&mut self) -> mpsc::UnboundedReceiver<OrderingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn stats(&self) -> OrderingStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Consumes `input` to completion.
    ///
    /// Returns after every chain has drained (or the dispatcher was
    /// destroyed); the output stream ends right after. An input error tears
    /// all chains down and is delivered as the final output item.
    pub async fn add_messages<S>(&mut self, input: S)
    where
        S: Stream<Item = Result<StreamMessage, TideError>>,
    {
        let mut input = pin!(input);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.close(None);
                    return;
                }
                next = input.next() => next,
            };
            match next {
                Some(Ok(msg)) => self.route(msg),
                Some(Err(err)) => {
                    warn!(error = %err, "input failed, closing ordered output");
                    self.close(Some(err));
                    return;
                }
                None => break,
            }
        }

        let chains: Vec<FilledChain> = self.chains.values().cloned().collect();
        let drained = async {
            for chain in &chains {
                chain.wait_until_idle().await;
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            _ = drained => {}
        }
        debug!(chains = chains.len(), "input exhausted, closing ordered output");
        self.close(None);
    }

    /// Cancels every chain and gap fill task and closes the output.
    pub fn destroy(&mut self) {
        if !self.token.is_cancelled() {
            info!(chains = self.chains.len(), "destroying ordering dispatcher");
        }
        self.token.cancel();
        self.close(None);
    }

    fn route(&mut self, msg: StreamMessage) {
        self.stats.note_received();
        if !self.config.ordering_enabled {
            if let Some(output) = &self.output {
                self.stats.note_emitted();
                let _ = output.send(Ok(msg));
            }
            return;
        }
        let Some(output) = &self.output else {
            return;
        };
        let key = msg.chain_key();
        let chain = self.chains.entry(key).or_insert_with_key(|key| {
            debug!(
                publisher_id = %key.publisher_id,
                msg_chain_id = %key.msg_chain_id,
                "new ordering chain"
            );
            FilledChain::new(
                key.clone(),
                Arc::clone(&self.ctx),
                self.token.child_token(),
                output.clone(),
                self.events.clone(),
            )
        });
        chain.add_message(msg);
    }

    fn close(&mut self, error: Option<TideError>) {
        for chain in self.chains.values() {
            chain.destroy();
        }
        self.events = None;
        if let Some(output) = self.output.take() {
            if let Some(err) = error {
                let _ = output.send(Err(err));
            }
        }
    }
}

impl Drop for ChainDispatcher {
    fn drop(&mut self) {
        self.close(None);
    }
}

/// Merged ordered output of a dispatcher.
pub struct OrderedStream {
    rx: mpsc::UnboundedReceiver<OrderedItem>,
    token: CancellationToken,
    closed: bool,
}

impl OrderedStream {
    /// Next ordered message, a terminal input error, or `None` once the
    /// dispatcher finished or was destroyed.
    pub async fn next(&mut self) -> Option<OrderedItem> {
        if !self.closed {
            tokio::select! {
                biased;
                item = self.rx.recv() => return item,
                _ = self.token.cancelled() => {
                    self.closed = true;
                    self.rx.close();
                }
            }
        }
        self.rx.recv().await
    }

    /// Reads the stream to its end; fails with the terminal input error.
    pub async fn collect_all(mut self) -> Result<Vec<StreamMessage>, TideError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = OrderedItem> {
        futures_util::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}
