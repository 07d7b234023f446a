//! One ordering chain wired to its gap fill tasks.
//!
//! All chain operations (real-time adds, resend adds, forced resolution,
//! destroy) run under a per-chain lock, and the resulting events are applied
//! under the same lock: ordered messages are forwarded to the merged output,
//! a found gap spawns a fresh [`GapFiller`] task, and a resolved gap cancels
//! that task. A forced resolution is only honoured while the requesting task
//! still owns the open gap, so data resolution and forced resolution cannot
//! both take effect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tide_core::{ChainKey, MessageRef, StreamMessage, TideError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::chain::{ChainEvent, OrderedMessageChain};
use crate::dispatcher::OrderingEvent;
use crate::gap_filler::{GapFillContext, GapFiller};

/// Item on the merged output: an ordered message or a terminal input error.
pub type OrderedItem = Result<StreamMessage, TideError>;

struct GapTask {
    id: u64,
    cancel: CancellationToken,
}

struct ChainState {
    chain: OrderedMessageChain,
    gap_task: Option<GapTask>,
    next_gap_id: u64,
    output: Option<mpsc::UnboundedSender<OrderedItem>>,
    events: Option<mpsc::UnboundedSender<OrderingEvent>>,
}

struct Shared {
    key: ChainKey,
    state: Mutex<ChainState>,
    idle: watch::Sender<bool>,
    cancel: CancellationToken,
    ctx: Arc<GapFillContext>,
}

/// Cheaply cloneable handle to a chain and its gap fill wiring.
#[derive(Clone)]
pub struct FilledChain {
    shared: Arc<Shared>,
}

impl FilledChain {
    /// Creates a chain whose tasks are cancelled together with `cancel`.
    pub fn new(
        key: ChainKey,
        ctx: Arc<GapFillContext>,
        cancel: CancellationToken,
        output: mpsc::UnboundedSender<OrderedItem>,
        events: Option<mpsc::UnboundedSender<OrderingEvent>>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                key: key.clone(),
                state: Mutex::new(ChainState {
                    chain: OrderedMessageChain::new(key),
                    gap_task: None,
                    next_gap_id: 0,
                    output: Some(output),
                    events,
                }),
                idle,
                cancel,
                ctx,
            }),
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.shared.key
    }

    /// Adds a real-time or resent message. Never fails; duplicates are dropped.
    pub fn add_message(&self, msg: StreamMessage) {
        let mut state = self.lock();
        if self.halt_if_cancelled(&mut state) {
            return;
        }
        if state.chain.is_duplicate(&msg) {
            self.shared.ctx.stats.note_duplicate();
            return;
        }
        let events = state.chain.add_message(msg);
        self.apply(&mut state, events);
    }

    /// Forces the open gap through on behalf of gap task `gap_id`.
    ///
    /// Ignored when that task no longer owns the gap.
    pub(crate) fn resolve_unfillable(&self, gap_id: u64, to: Option<MessageRef>) {
        let mut state = self.lock();
        if self.halt_if_cancelled(&mut state) {
            return;
        }
        let owns_gap = state
            .gap_task
            .as_ref()
            .is_some_and(|task| task.id == gap_id && !task.cancel.is_cancelled());
        if !owns_gap {
            return;
        }
        let events = state.chain.resolve_messages(to);
        self.apply(&mut state, events);
    }

    /// Tears the chain down: cancels its gap task and closes its output.
    pub fn destroy(&self) {
        self.shared.cancel.cancel();
        let mut state = self.lock();
        self.teardown(&mut state);
    }

    pub fn is_idle(&self) -> bool {
        *self.shared.idle.borrow()
    }

    pub fn has_active_gap_task(&self) -> bool {
        self.lock().gap_task.is_some()
    }

    /// Resolves once nothing is pending (or the chain was destroyed).
    pub async fn wait_until_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn halt_if_cancelled(&self, state: &mut ChainState) -> bool {
        if !self.shared.cancel.is_cancelled() {
            return false;
        }
        if !state.chain.is_destroyed() {
            self.teardown(state);
        }
        true
    }

    fn teardown(&self, state: &mut ChainState) {
        state.chain.destroy();
        if let Some(task) = state.gap_task.take() {
            task.cancel.cancel();
        }
        state.output = None;
        state.events = None;
        self.shared.idle.send_replace(true);
    }

    fn apply(&self, state: &mut ChainState, events: Vec<ChainEvent>) {
        let key = &self.shared.key;
        let stats = &self.shared.ctx.stats;
        for event in events {
            match event {
                ChainEvent::OrderedMessageAdded(message) => {
                    stats.note_emitted();
                    if let Some(events) = &state.events {
                        let _ = events.send(OrderingEvent::OrderedMessageAdded {
                            key: key.clone(),
                            message: message.clone(),
                        });
                    }
                    if let Some(output) = &state.output {
                        let _ = output.send(Ok(message));
                    }
                }
                ChainEvent::GapFound(gap) => {
                    stats.note_gap_found();
                    if let Some(events) = &state.events {
                        let _ = events.send(OrderingEvent::GapFound {
                            key: key.clone(),
                            gap: gap.clone(),
                        });
                    }
                    let id = state.next_gap_id;
                    state.next_gap_id += 1;
                    let cancel = self.shared.cancel.child_token();
                    let filler = GapFiller::new(
                        gap,
                        id,
                        self.clone(),
                        Arc::clone(&self.shared.ctx),
                        cancel.clone(),
                    );
                    if let Some(previous) = state.gap_task.replace(GapTask { id, cancel }) {
                        previous.cancel.cancel();
                    }
                    tokio::spawn(filler.run());
                }
                ChainEvent::GapResolved => {
                    stats.note_gap_resolved();
                    if let Some(task) = state.gap_task.take() {
                        task.cancel.cancel();
                    }
                    if let Some(events) = &state.events {
                        let _ = events.send(OrderingEvent::GapResolved { key: key.clone() });
                    }
                }
                ChainEvent::UnfillableGap(gap) => {
                    stats.note_unfillable_gap();
                    warn!(
                        publisher_id = %key.publisher_id,
                        msg_chain_id = %key.msg_chain_id,
                        from = %gap.from.message_ref,
                        to = %gap.to.message_ref,
                        "skipping unfillable gap"
                    );
                    if let Some(events) = &state.events {
                        let _ = events.send(OrderingEvent::UnfillableGap {
                            key: key.clone(),
                            gap,
                        });
                    }
                }
            }
        }
        self.shared.idle.send_replace(state.chain.is_idle());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tide_core::{ChainKey, MessageRef, StreamMessage};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{FilledChain, OrderedItem};
    use crate::config::{GapFillStrategy, GapFillerConfig};
    use crate::gap_filler::GapFillContext;
    use crate::stats::OrderingStats;
    use crate::storage::InMemoryStorage;

    fn msg(ts: i64) -> StreamMessage {
        StreamMessage::new(
            "pub",
            "chain",
            MessageRef::new(ts, 0),
            Some(MessageRef::new(ts - 1, 0)),
            Vec::new(),
        )
    }

    fn passive_chain() -> (FilledChain, mpsc::UnboundedReceiver<OrderedItem>) {
        let ctx = GapFillContext::new(
            GapFillerConfig {
                initial_wait_time: Duration::from_millis(50),
                retry_wait_time: Duration::from_millis(20),
                max_requests_per_gap: 0,
                strategy: GapFillStrategy::Full,
            },
            Arc::new(InMemoryStorage::default()),
            Arc::new(OrderingStats::default()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let chain = FilledChain::new(
            ChainKey::new("pub", "chain"),
            Arc::new(ctx),
            CancellationToken::new(),
            tx,
            None,
        );
        (chain, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OrderedItem>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item.expect("no errors expected").timestamp());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn gap_task_lives_only_while_gap_is_open() {
        let (chain, mut rx) = passive_chain();
        chain.add_message(msg(1));
        chain.add_message(msg(3));
        assert!(chain.has_active_gap_task());
        assert!(!chain.is_idle());

        chain.add_message(msg(2));
        assert!(!chain.has_active_gap_task());
        assert!(chain.is_idle());
        assert_eq!(drain(&mut rx), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_resolution_request_is_ignored() {
        let (chain, mut rx) = passive_chain();
        chain.add_message(msg(1));
        chain.add_message(msg(3));
        chain.add_message(msg(2));
        chain.add_message(msg(5));
        // gap 0 was closed by data; only gap 1 may be forced
        chain.resolve_unfillable(0, None);
        assert_eq!(drain(&mut rx), vec![1, 2, 3]);
        chain.resolve_unfillable(1, Some(MessageRef::new(5, 0)));
        assert_eq!(drain(&mut rx), vec![5]);
        assert!(chain.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_closes_output_and_silences_chain() {
        let (chain, mut rx) = passive_chain();
        chain.add_message(msg(1));
        chain.add_message(msg(3));
        chain.destroy();
        chain.add_message(msg(2));
        assert!(chain.is_idle());
        assert!(!chain.has_active_gap_task());
        assert_eq!(drain(&mut rx), vec![1]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_idle_follows_late_arrivals() {
        let (chain, mut rx) = passive_chain();
        chain.add_message(msg(1));
        chain.add_message(msg(2));
        chain.add_message(msg(4));
        let late = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for ts in [5, 7, 6, 3] {
                late.add_message(msg(ts));
            }
        });
        chain.wait_until_idle().await;
        assert_eq!(drain(&mut rx), vec![1, 2, 3, 4, 5, 6, 7]);
    }
}
