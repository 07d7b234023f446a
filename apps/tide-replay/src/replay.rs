use std::io::{BufRead, Write};
use std::sync::Arc;

use serde::Serialize;
use tide_core::StreamMessage;
use tide_ordering::{
    ChainDispatcher, ChainSequencer, InMemoryStorage, OrderingStatsSnapshot, TransformFailure,
};
use tracing::{info, warn};

use crate::config::ReplayConfig;
use crate::error::ReplayError;
use crate::trace::trace_stream;

#[derive(Debug, Clone, Serialize)]
struct OutputLine {
    publisher_id: String,
    msg_chain_id: String,
    timestamp: i64,
    sequence_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OutputLine {
    fn new(msg: &StreamMessage) -> Self {
        Self {
            publisher_id: msg.publisher_id.to_string(),
            msg_chain_id: msg.msg_chain_id.clone(),
            timestamp: msg.message_ref.timestamp,
            sequence_number: msg.message_ref.sequence_number,
            content: None,
            error: None,
        }
    }

    fn parsed(msg: StreamMessage) -> Result<Self, serde_json::Error> {
        let content = serde_json::from_slice(&msg.content)?;
        Ok(Self {
            content: Some(content),
            ..Self::new(&msg)
        })
    }

    fn failed(failure: TransformFailure<serde_json::Error>) -> Self {
        Self {
            error: Some(failure.error.to_string()),
            ..Self::new(&failure.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub stats: OrderingStatsSnapshot,
    pub written: usize,
    pub transform_failures: usize,
}

/// Orders `trace`, parses every payload per chain and writes one JSON line
/// per message to `out`.
pub async fn replay<R, W>(
    cfg: &ReplayConfig,
    trace: R,
    stored: Vec<StreamMessage>,
    out: &mut W,
) -> Result<ReplaySummary, ReplayError>
where
    R: BufRead,
    W: Write,
{
    let ordering = cfg.ordering();
    ordering.validate()?;

    let storage = Arc::new(InMemoryStorage::single_node(&cfg.storage_node, stored));
    info!(
        stored = storage.stored_len(),
        storage_node = %cfg.storage_node,
        ordering_enabled = ordering.ordering_enabled,
        max_requests_per_gap = ordering.gap_filler_config().max_requests_per_gap,
        "starting replay"
    );

    let (mut dispatcher, mut ordered) = ChainDispatcher::new(ordering, storage);
    let (mut sequencer, mut results) =
        ChainSequencer::new(|msg: StreamMessage| async move { OutputLine::parsed(msg) });

    let feed = dispatcher.add_messages(trace_stream(trace));
    let pump = async {
        let mut input_error = None;
        while let Some(item) = ordered.next().await {
            match item {
                Ok(msg) => sequencer.add_message(msg),
                Err(err) => {
                    input_error = Some(err);
                    break;
                }
            }
        }
        sequencer.finish();
        input_error
    };
    let print = async {
        let mut written = 0_usize;
        let mut failures = 0_usize;
        while let Some(result) = results.next().await {
            let line = result.unwrap_or_else(|failure| {
                failures += 1;
                OutputLine::failed(failure)
            });
            serde_json::to_writer(&mut *out, &line).map_err(std::io::Error::from)?;
            writeln!(out)?;
            written += 1;
        }
        out.flush()?;
        Ok::<_, ReplayError>((written, failures))
    };

    let ((), input_error, printed) = tokio::join!(feed, pump, print);
    let (written, transform_failures) = printed?;
    let stats = dispatcher.stats();
    info!(
        received = stats.messages_received,
        emitted = stats.messages_emitted,
        duplicates = stats.duplicates_dropped,
        gaps_found = stats.gaps_found,
        gaps_resolved = stats.gaps_resolved,
        unfillable_gaps = stats.unfillable_gaps,
        resend_attempts = stats.resend_attempts,
        resend_failures = stats.resend_failures,
        transform_failures,
        "replay finished"
    );
    if let Some(err) = input_error {
        warn!(error = %err, written, "replay stopped on input error");
        return Err(err.into());
    }
    Ok(ReplaySummary {
        stats,
        written,
        transform_failures,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use serde_json::Value;
    use tide_core::{MessageRef, StreamMessage};

    use super::replay;
    use crate::config::ReplayConfig;
    use crate::error::ReplayError;

    fn config() -> ReplayConfig {
        let mut cfg = ReplayConfig::from_sources(None, Some(Default::default()))
            .expect("default config");
        cfg.initial_wait_time = Duration::from_millis(50);
        cfg.retry_wait_time = Duration::from_millis(20);
        cfg.max_requests_per_gap = 2;
        cfg
    }

    fn record(publisher: &str, ts: i64, content: &str) -> String {
        let prev = if ts > 1 {
            format!(r#","prev_timestamp":{}"#, ts - 1)
        } else {
            String::new()
        };
        format!(
            r#"{{"publisher_id":"{publisher}","msg_chain_id":"c","timestamp":{ts}{prev},"content":{}}}"#,
            serde_json::to_string(content).expect("content string")
        )
    }

    fn stored(publisher: &str, ts: i64, content: &str) -> StreamMessage {
        StreamMessage::new(
            publisher,
            "c",
            MessageRef::new(ts, 0),
            Some(MessageRef::new(ts - 1, 0)),
            content.as_bytes().to_vec(),
        )
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).expect("output line is json"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn replays_trace_in_order_with_backfill() {
        let trace = [
            record("a", 1, r#"{"n":1}"#),
            record("a", 4, r#"{"n":4}"#),
            record("a", 2, r#"{"n":2}"#),
        ]
        .join("\n");
        let mut out = Vec::new();
        let summary = replay(
            &config(),
            Cursor::new(trace),
            vec![stored("a", 3, r#"{"n":3}"#)],
            &mut out,
        )
        .await
        .expect("replay should succeed");

        let got: Vec<i64> = lines(&out)
            .iter()
            .map(|line| line["content"]["n"].as_i64().expect("n field"))
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert_eq!(summary.written, 4);
        assert_eq!(summary.stats.messages_received, 3);
        assert_eq!(summary.stats.gaps_resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_payload_is_reported_per_message() {
        let trace = [
            record("a", 1, r#"{"n":1}"#),
            record("a", 2, "not json"),
            record("a", 3, r#"{"n":3}"#),
        ]
        .join("\n");
        let mut out = Vec::new();
        let summary = replay(&config(), Cursor::new(trace), Vec::new(), &mut out)
            .await
            .expect("replay should succeed");

        let out = lines(&out);
        assert_eq!(out.len(), 3);
        assert!(out[1]["error"].is_string());
        assert_eq!(out[1]["timestamp"], 2);
        assert_eq!(out[2]["content"]["n"], 3);
        assert_eq!(summary.transform_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_trace_line_fails_replay() {
        let trace = format!("{}\n{{broken\n", record("a", 1, "{}"));
        let mut out = Vec::new();
        let err = replay(&config(), Cursor::new(trace), Vec::new(), &mut out)
            .await
            .err();
        assert!(matches!(err, Some(ReplayError::Input(_))), "{err:?}");
        assert_eq!(lines(&out).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_ordering_config_is_rejected() {
        let mut cfg = config();
        cfg.retry_wait_time = Duration::ZERO;
        let err = replay(&cfg, Cursor::new(""), Vec::new(), &mut Vec::new())
            .await
            .err();
        assert!(matches!(err, Some(ReplayError::InvalidConfig(_))));
    }
}
