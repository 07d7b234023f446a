use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TideError;

/// Position of a message within its chain.
///
/// Ordered by `timestamp`, then `sequence_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: u32,
}

impl MessageRef {
    pub const fn new(timestamp: i64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl Ord for MessageRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence_number.cmp(&other.sequence_number))
    }
}

impl PartialOrd for MessageRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.timestamp, self.sequence_number)
    }
}

/// Opaque publisher identity (address, pubkey, or any stable string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherId(pub String);

impl From<&str> for PublisherId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PublisherId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one ordering chain: one publisher's one sending session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub publisher_id: PublisherId,
    pub msg_chain_id: String,
}

impl ChainKey {
    pub fn new(publisher_id: impl Into<PublisherId>, msg_chain_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.publisher_id, self.msg_chain_id)
    }
}

/// A message as seen by the ordering engine.
///
/// Only the chain identity and the two refs are interpreted; `content` is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub publisher_id: PublisherId,
    pub msg_chain_id: String,
    pub message_ref: MessageRef,
    /// Ref of the causally preceding message in the same chain.
    pub prev_message_ref: Option<MessageRef>,
    pub content: Bytes,
}

impl StreamMessage {
    pub fn new(
        publisher_id: impl Into<PublisherId>,
        msg_chain_id: impl Into<String>,
        message_ref: MessageRef,
        prev_message_ref: Option<MessageRef>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
            message_ref,
            prev_message_ref,
            content: content.into(),
        }
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey {
            publisher_id: self.publisher_id.clone(),
            msg_chain_id: self.msg_chain_id.clone(),
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.message_ref.timestamp
    }

    /// Rejects a predecessor ref that does not precede the message's own ref.
    pub fn check_refs(&self) -> Result<(), TideError> {
        match self.prev_message_ref {
            Some(prev) if prev >= self.message_ref => Err(TideError::InvalidInput(
                "prev_message_ref must precede message_ref",
            )),
            _ => Ok(()),
        }
    }
}
