//! JSON-lines trace format.
//!
//! One record per line; blank lines are skipped.

use std::fs;
use std::io::BufRead;
use std::path::Path;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tide_core::{MessageRef, StreamMessage, TideError};

use crate::error::ReplayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub sequence_number: u32,
    #[serde(default)]
    pub prev_timestamp: Option<i64>,
    #[serde(default)]
    pub prev_sequence_number: Option<u32>,
    /// Raw payload; interpreted only by the replay transform.
    pub content: String,
}

impl TraceRecord {
    pub fn into_message(self) -> StreamMessage {
        let prev = self
            .prev_timestamp
            .map(|ts| MessageRef::new(ts, self.prev_sequence_number.unwrap_or(0)));
        StreamMessage::new(
            self.publisher_id,
            self.msg_chain_id,
            MessageRef::new(self.timestamp, self.sequence_number),
            prev,
            self.content.into_bytes(),
        )
    }
}

fn parse_line(line_no: usize, line: &str) -> Result<Option<StreamMessage>, ReplayError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let record: TraceRecord = serde_json::from_str(line).map_err(|source| ReplayError::Parse {
        line: line_no,
        source,
    })?;
    let msg = record.into_message();
    msg.check_refs()?;
    Ok(Some(msg))
}

/// Lazily parses a trace; the first unreadable or malformed line ends the
/// stream with an upstream error.
pub fn trace_stream<R>(reader: R) -> impl Stream<Item = Result<StreamMessage, TideError>>
where
    R: BufRead,
{
    let messages = reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let parsed = line
                .map_err(ReplayError::from)
                .and_then(|line| parse_line(idx + 1, &line));
            match parsed {
                Ok(Some(msg)) => Some(Ok(msg)),
                Ok(None) => None,
                Err(err) => Some(Err(TideError::Upstream(err.to_string()))),
            }
        });
    futures_util::stream::iter(messages)
}

/// Reads a whole storage fixture into memory.
pub fn read_records(path: &Path) -> Result<Vec<StreamMessage>, ReplayError> {
    let raw = fs::read_to_string(path).map_err(|source| ReplayError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut messages = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if let Some(msg) = parse_line(idx + 1, line)? {
            messages.push(msg);
        }
    }
    Ok(messages)
}
