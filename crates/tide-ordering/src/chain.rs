//! Per-chain ordering state machine.
//!
//! A chain keeps a head (the last message emitted in order) and a pending
//! buffer sorted by message ref. A buffered message becomes emittable when its
//! `prev_message_ref` points at the head. When the earliest buffered message
//! cannot be linked to the head, the chain declares a gap and keeps that one
//! gap open until the head reaches the gap's `to` message, either because the
//! missing messages arrived or because the gap was resolved by force.
//!
//! Every operation returns the events it produced, in emission order. The
//! caller is responsible for reacting to them (forwarding output, starting
//! or cancelling gap fill work).

use std::collections::BTreeMap;

use tide_core::{ChainKey, Gap, MessageRef, StreamMessage};
use tracing::debug;

/// Observable outcome of a chain operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// Message accepted as the new head of the chain.
    OrderedMessageAdded(StreamMessage),
    /// New gap detected; at most one gap is open at a time.
    GapFound(Gap),
    /// The open gap was closed.
    GapResolved,
    /// A range was skipped during forced resolution.
    UnfillableGap(Gap),
}

#[derive(Debug, Clone, Copy)]
enum ConsumeMode {
    /// Only messages linked to the head.
    Ordered,
    /// Also messages up to `to` (or every pending message when `None`).
    Forced { to: Option<MessageRef> },
}

#[derive(Debug)]
pub struct OrderedMessageChain {
    key: ChainKey,
    last_ordered: Option<StreamMessage>,
    pending: BTreeMap<MessageRef, StreamMessage>,
    current_gap: Option<Gap>,
    destroyed: bool,
}

impl OrderedMessageChain {
    pub fn new(key: ChainKey) -> Self {
        Self {
            key,
            last_ordered: None,
            pending: BTreeMap::new(),
            current_gap: None,
            destroyed: false,
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Adds a message from any source (real-time or resend).
    ///
    /// Stale and already-buffered messages are dropped without events.
    pub fn add_message(&mut self, msg: StreamMessage) -> Vec<ChainEvent> {
        let mut events = Vec::new();
        if self.destroyed || self.is_duplicate(&msg) {
            return events;
        }
        self.pending.insert(msg.message_ref, msg);
        self.consume_pending(ConsumeMode::Ordered, &mut events);
        events
    }

    /// Forces pending messages through regardless of missing predecessors.
    ///
    /// Every pending message with a ref `<= to` is emitted, each skipped range
    /// reported as [`ChainEvent::UnfillableGap`]. With `to == None` the whole
    /// buffer is flushed. Gap detection runs again afterwards.
    pub fn resolve_messages(&mut self, to: Option<MessageRef>) -> Vec<ChainEvent> {
        let mut events = Vec::new();
        if !self.destroyed {
            self.consume_pending(ConsumeMode::Forced { to }, &mut events);
        }
        events
    }

    /// Terminal: drops buffered state and silences all further operations.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.pending.clear();
        self.current_gap = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// True when nothing is waiting to be emitted.
    pub fn is_idle(&self) -> bool {
        self.destroyed || self.pending.is_empty()
    }

    /// True when `msg` is at or behind the head, or already buffered.
    pub fn is_duplicate(&self, msg: &StreamMessage) -> bool {
        let behind_head = self
            .last_ordered
            .as_ref()
            .is_some_and(|last| msg.message_ref <= last.message_ref);
        behind_head || self.pending.contains_key(&msg.message_ref)
    }

    pub fn current_gap(&self) -> Option<&Gap> {
        self.current_gap.as_ref()
    }

    pub fn last_ordered_ref(&self) -> Option<MessageRef> {
        self.last_ordered.as_ref().map(|m| m.message_ref)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn consume_pending(&mut self, mode: ConsumeMode, events: &mut Vec<ChainEvent>) {
        while let Some((_, head)) = self.pending.first_key_value() {
            let unfillable = if is_next_ordered(self.last_ordered.as_ref(), head) {
                None
            } else {
                let forced = match mode {
                    ConsumeMode::Ordered => false,
                    ConsumeMode::Forced { to } => to.map_or(true, |to| head.message_ref <= to),
                };
                if !forced {
                    break;
                }
                self.last_ordered
                    .as_ref()
                    .map(|from| Gap::new(from.clone(), head.clone()))
            };

            let Some((_, next)) = self.pending.pop_first() else {
                break;
            };
            if let Some(gap) = unfillable {
                events.push(ChainEvent::UnfillableGap(gap));
            }
            self.last_ordered = Some(next.clone());
            events.push(ChainEvent::OrderedMessageAdded(next));
            self.check_gap_resolved(events);
        }
        self.check_gap_found(events);
    }

    fn check_gap_found(&mut self, events: &mut Vec<ChainEvent>) {
        if self.current_gap.is_some() {
            return;
        }
        let (Some(from), Some((_, to))) = (&self.last_ordered, self.pending.first_key_value())
        else {
            return;
        };
        let gap = Gap::new(from.clone(), to.clone());
        debug!(
            publisher_id = %self.key.publisher_id,
            msg_chain_id = %self.key.msg_chain_id,
            from = %gap.from.message_ref,
            to = %gap.to.message_ref,
            "gap found"
        );
        self.current_gap = Some(gap.clone());
        events.push(ChainEvent::GapFound(gap));
    }

    fn check_gap_resolved(&mut self, events: &mut Vec<ChainEvent>) {
        let reached = match (&self.current_gap, &self.last_ordered) {
            (Some(gap), Some(last)) => gap.to.message_ref == last.message_ref,
            _ => false,
        };
        if !reached {
            return;
        }
        if let Some(gap) = self.current_gap.take() {
            debug!(
                publisher_id = %self.key.publisher_id,
                msg_chain_id = %self.key.msg_chain_id,
                from = %gap.from.message_ref,
                to = %gap.to.message_ref,
                "gap resolved"
            );
            events.push(ChainEvent::GapResolved);
        }
    }
}

/// A message may follow the head when the chain has not started yet, when it
/// carries no predecessor ref, or when its predecessor is the head.
fn is_next_ordered(last: Option<&StreamMessage>, msg: &StreamMessage) -> bool {
    match (last, msg.prev_message_ref) {
        (None, _) | (_, None) => true,
        (Some(last), Some(prev)) => prev == last.message_ref,
    }
}
