//! Per-chain serialized async processing.
//!
//! Messages of one chain are transformed strictly one after another in
//! arrival order; different chains run concurrently. Results land on one
//! shared output in completion order.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use thiserror::Error;
use tide_core::{ChainKey, StreamMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Transform<T, E> = Arc<dyn Fn(StreamMessage) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Output item of a [`ChainSequencer`].
pub type SequencedItem<T, E> = Result<T, TransformFailure<E>>;

/// A failed transform, paired with the message it failed on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transform failed for {} at {}: {error}", .message.chain_key(), .message.message_ref)]
pub struct TransformFailure<E: fmt::Display> {
    pub message: StreamMessage,
    pub error: E,
}

pub struct ChainSequencer<T, E: fmt::Display> {
    transform: Transform<T, E>,
    queues: HashMap<ChainKey, mpsc::UnboundedSender<StreamMessage>>,
    output: Option<mpsc::UnboundedSender<SequencedItem<T, E>>>,
    token: CancellationToken,
}

impl<T, E> ChainSequencer<T, E>
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(transform: F) -> (Self, SequencerOutput<T, E>)
    where
        F: Fn(StreamMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Self {
            transform: Arc::new(move |msg: StreamMessage| transform(msg).boxed()),
            queues: HashMap::new(),
            output: Some(tx),
            token: token.clone(),
        };
        let output = SequencerOutput {
            rx,
            token,
            closed: false,
        };
        (sequencer, output)
    }

    /// Queues `msg` behind earlier messages of its chain.
    pub fn add_message(&mut self, msg: StreamMessage) {
        if self.token.is_cancelled() {
            return;
        }
        let Some(output) = &self.output else {
            return;
        };
        let key = msg.chain_key();
        let queue = self.queues.entry(key).or_insert_with_key(|key| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(
                key.clone(),
                rx,
                Arc::clone(&self.transform),
                output.clone(),
                self.token.clone(),
            ));
            tx
        });
        let _ = queue.send(msg);
    }

    /// Stops accepting input; the output ends once every queue is drained.
    pub fn finish(&mut self) {
        self.queues.clear();
        self.output = None;
    }

    /// Abandons queued and in-flight transforms.
    pub fn destroy(&mut self) {
        self.token.cancel();
        self.finish();
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn run_worker<T, E: fmt::Display>(
    key: ChainKey,
    mut queue: mpsc::UnboundedReceiver<StreamMessage>,
    transform: Transform<T, E>,
    output: mpsc::UnboundedSender<SequencedItem<T, E>>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        let message_ref = msg.message_ref;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = transform(msg.clone()) => result,
        };
        let item = result.map_err(|error| {
            debug!(
                publisher_id = %key.publisher_id,
                msg_chain_id = %key.msg_chain_id,
                message_ref = %message_ref,
                error = %error,
                "message transform failed"
            );
            TransformFailure {
                message: msg,
                error,
            }
        });
        if output.send(item).is_err() {
            return;
        }
    }
}

/// Shared output of a [`ChainSequencer`].
pub struct SequencerOutput<T, E: fmt::Display> {
    rx: mpsc::UnboundedReceiver<SequencedItem<T, E>>,
    token: CancellationToken,
    closed: bool,
}

impl<T, E: fmt::Display> SequencerOutput<T, E> {
    pub async fn next(&mut self) -> Option<SequencedItem<T, E>> {
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

    pub fn into_stream(self) -> impl Stream<Item = SequencedItem<T, E>> {
        futures_util::stream::unfold(self, |mut output| async move {
            let item = output.next().await?;
            Some((item, output))
        })
    }
}
