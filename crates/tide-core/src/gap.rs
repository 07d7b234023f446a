use serde::{Deserialize, Serialize};

use crate::types::{ChainKey, MessageRef, StreamMessage};

/// Missing range between two messages of one chain.
///
/// `from` is the last message emitted in order; `to` is the earliest buffered
/// message that could not be linked to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub from: StreamMessage,
    pub to: StreamMessage,
}

/// Inclusive storage query range covering a gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRange {
    pub key: ChainKey,
    pub from: MessageRef,
    pub to: MessageRef,
}

impl Gap {
    pub fn new(from: StreamMessage, to: StreamMessage) -> Self {
        Self { from, to }
    }

    pub fn chain_key(&self) -> ChainKey {
        self.to.chain_key()
    }

    /// Range a storage node must return to close this gap.
    ///
    /// Starts right after `from` and ends at the message `to` claims as its
    /// predecessor.
    pub fn resend_range(&self) -> ResendRange {
        let from_ref = self.from.message_ref;
        ResendRange {
            key: self.chain_key(),
            from: MessageRef::new(from_ref.timestamp, from_ref.sequence_number.saturating_add(1)),
            to: self.to.prev_message_ref.unwrap_or(self.to.message_ref),
        }
    }
}

impl ResendRange {
    pub fn contains(&self, message_ref: &MessageRef) -> bool {
        *message_ref >= self.from && *message_ref <= self.to
    }
}

#[cfg(test)]
mod tests {
    use super::Gap;
    use crate::types::{ChainKey, MessageRef, StreamMessage};

    fn msg(ts: i64) -> StreamMessage {
        StreamMessage::new(
            "pub",
            "chain",
            MessageRef::new(ts, 0),
            Some(MessageRef::new(ts - 1000, 0)),
            Vec::new(),
        )
    }

    #[test]
    fn resend_range_spans_after_from_until_prev_of_to() {
        let gap = Gap::new(msg(2000), msg(4000));
        let range = gap.resend_range();
        assert_eq!(range.key, ChainKey::new("pub", "chain"));
        assert_eq!(range.from, MessageRef::new(2000, 1));
        assert_eq!(range.to, MessageRef::new(3000, 0));
        assert!(range.contains(&MessageRef::new(3000, 0)));
        assert!(!range.contains(&MessageRef::new(2000, 0)));
        assert!(!range.contains(&MessageRef::new(4000, 0)));
    }

    #[test]
    fn resend_range_falls_back_to_own_ref_without_prev() {
        let mut to = msg(5000);
        to.prev_message_ref = None;
        let range = Gap::new(msg(1000), to).resend_range();
        assert_eq!(range.to, MessageRef::new(5000, 0));
    }
}
