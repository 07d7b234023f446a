use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tide_core::{Gap, MessageRef, StreamMessage, TideError};
use tide_ordering::storage::MessageStream;
use tide_ordering::{
    ChainDispatcher, GapFillStrategy, InMemoryStorage, OrderingConfig, OrderingEvent,
    ResendError, ResendSource, StorageNodeAddress,
};
use tokio_util::sync::CancellationToken;

const MAX_GAP_REQUESTS: u32 = 5;
const CHUNK1: [i64; 4] = [1000, 3000, 8000, 10000];
const CHUNK2: [i64; 3] = [11000, 12000, 14000];

fn msg(ts: i64) -> StreamMessage {
    StreamMessage::new(
        "publisher",
        "chain",
        MessageRef::new(ts, 0),
        Some(MessageRef::new(ts - 1000, 0)),
        &b"{}"[..],
    )
}

fn all_messages() -> Vec<StreamMessage> {
    (1..=14).map(|i| msg(i * 1000)).collect()
}

fn all_except(excluded: &[i64]) -> Vec<i64> {
    (1..=14)
        .map(|i| i * 1000)
        .filter(|ts| !excluded.contains(ts))
        .collect()
}

/// Storage that fails every request whose range starts at a listed timestamp.
struct CountingStorage {
    inner: InMemoryStorage,
    failing_from: Vec<i64>,
    calls: AtomicUsize,
}

impl CountingStorage {
    fn new(available: Vec<StreamMessage>, failing_from: Vec<i64>) -> Self {
        Self {
            inner: InMemoryStorage::single_node("node-1", available),
            failing_from,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResendSource for CountingStorage {
    async fn storage_node_addresses(&self) -> Result<Vec<StorageNodeAddress>, ResendError> {
        self.inner.storage_node_addresses().await
    }

    async fn resend(
        &self,
        gap: &Gap,
        storage_node: &StorageNodeAddress,
        cancel: CancellationToken,
    ) -> Result<MessageStream, ResendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_from
            .contains(&gap.resend_range().from.timestamp)
        {
            return Err(ResendError::Unavailable("mock-error".into()));
        }
        self.inner.resend(gap, storage_node, cancel).await
    }
}

struct Outcome {
    output: Vec<i64>,
    unfillable: Vec<(i64, i64)>,
    resend_calls: usize,
    resend_failures: u64,
}

/// Feeds CHUNK1, waits until its last message is emitted, then feeds CHUNK2.
async fn run_scenario(strategy: GapFillStrategy, storage: Arc<CountingStorage>) -> Outcome {
    let config = OrderingConfig {
        gap_fill_strategy: strategy,
        max_requests_per_gap: MAX_GAP_REQUESTS,
        initial_wait_time: Duration::from_millis(50),
        retry_wait_time: Duration::from_millis(50),
        ..OrderingConfig::default()
    };
    let (mut dispatcher, output) = ChainDispatcher::new(config, storage.clone());
    let mut events = dispatcher.subscribe_events();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut output = Box::pin(output.into_stream());
            while let Some(item) = output.next().await {
                let msg = item.expect("no input errors");
                seen.lock().expect("seen lock").push(msg.timestamp());
            }
        })
    };

    let pick = |wanted: &[i64]| -> Vec<Result<StreamMessage, TideError>> {
        all_messages()
            .into_iter()
            .filter(|m| wanted.contains(&m.timestamp()))
            .map(Ok)
            .collect()
    };
    let barrier = {
        let seen = Arc::clone(&seen);
        stream::once(async move {
            let last = CHUNK1[CHUNK1.len() - 1];
            while !seen.lock().expect("seen lock").contains(&last) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .filter_map(|()| async { None::<Result<StreamMessage, TideError>> })
    };
    let input = stream::iter(pick(&CHUNK1[..]))
        .chain(barrier)
        .chain(stream::iter(pick(&CHUNK2[..])));

    dispatcher.add_messages(input).await;
    consumer.await.expect("consumer task");

    let mut unfillable = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let OrderingEvent::UnfillableGap { gap, .. } = event {
            unfillable.push((gap.from.timestamp(), gap.to.timestamp()));
        }
    }
    let output = seen.lock().expect("seen lock").clone();
    Outcome {
        output,
        unfillable,
        resend_calls: storage.calls.load(Ordering::SeqCst),
        resend_failures: dispatcher.stats().resend_failures,
    }
}

fn available_without(excluded: &[i64]) -> Vec<StreamMessage> {
    all_messages()
        .into_iter()
        .filter(|m| !excluded.contains(&m.timestamp()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_strategy_skips_only_the_unfillable_range() {
    let unavailable = [5000, 6000];
    let storage = Arc::new(CountingStorage::new(available_without(&unavailable), Vec::new()));
    let outcome = run_scenario(GapFillStrategy::Full, storage).await;

    assert_eq!(outcome.output, all_except(&unavailable));
    assert_eq!(outcome.resend_calls, 3 + MAX_GAP_REQUESTS as usize);
    assert_eq!(outcome.unfillable, vec![(4000, 7000)]);
}

#[tokio::test(start_paused = true)]
async fn full_strategy_with_failing_storage() {
    let missing = [4000, 5000, 6000, 7000];
    let storage = Arc::new(CountingStorage::new(available_without(&missing), vec![3000]));
    let outcome = run_scenario(GapFillStrategy::Full, storage).await;

    assert_eq!(outcome.output, all_except(&missing));
    assert_eq!(outcome.resend_calls, 3 + MAX_GAP_REQUESTS as usize);
    assert_eq!(outcome.resend_failures, u64::from(MAX_GAP_REQUESTS));
    assert_eq!(outcome.unfillable, vec![(3000, 8000)]);
}

#[tokio::test(start_paused = true)]
async fn light_strategy_drops_gaps_accumulated_meanwhile() {
    let unavailable = [5000, 6000];
    let storage = Arc::new(CountingStorage::new(available_without(&unavailable), Vec::new()));
    let outcome = run_scenario(GapFillStrategy::Light, storage).await;

    assert_eq!(outcome.output, all_except(&[5000, 6000, 9000]));
    assert_eq!(outcome.resend_calls, 2 + MAX_GAP_REQUESTS as usize);
    assert_eq!(outcome.unfillable, vec![(4000, 7000), (8000, 10000)]);
}

#[tokio::test(start_paused = true)]
async fn light_strategy_with_failing_storage() {
    let missing = [4000, 5000, 6000, 7000];
    let storage = Arc::new(CountingStorage::new(available_without(&missing), vec![3000]));
    let outcome = run_scenario(GapFillStrategy::Light, storage).await;

    let mut excluded = missing.to_vec();
    excluded.push(9000);
    assert_eq!(outcome.output, all_except(&excluded));
    assert_eq!(outcome.resend_calls, 2 + MAX_GAP_REQUESTS as usize);
    assert_eq!(outcome.unfillable, vec![(3000, 8000), (8000, 10000)]);
}
