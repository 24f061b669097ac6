//! One chat run, from lock to terminal record.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{StreamRecord, StreamingBridge};
use crate::adapter::{ExecutionAdapter, ExecutionMode};
use crate::backend::RunRequest;
use crate::cancellation::CancellationRegistry;
use crate::conversation::{ConversationKey, ConversationLocks};
use crate::util::{as_millis_u64, lock};

/// Cancel flag of a run plus the reader task to release when it fires.
#[derive(Default)]
pub(crate) struct CancelState {
    token: CancellationToken,
    reader: Mutex<Option<AbortHandle>>,
}

impl CancelState {
    pub(crate) fn trigger(&self) {
        self.token.cancel();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }

    fn attach_reader(&self, reader: AbortHandle) {
        *lock(&self.reader) = Some(reader);
        // A trigger that ran before the handle was stored must still abort it.
        if self.token.is_cancelled() {
            if let Some(reader) = lock(&self.reader).take() {
                reader.abort();
            }
        }
    }

    fn detach_reader(&self) {
        lock(&self.reader).take();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    /// Cancelled out of band.
    Cancelled,
    Errored(String),
    /// The client stopped reading.
    Aborted,
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Errored(_) => "errored",
            Self::Aborted => "aborted",
        }
    }
}

/// Releases everything a run holds. The first `close` wins; later calls do nothing.
pub(crate) struct RunCloser {
    closed: AtomicBool,
    request_id: String,
    conversation: ConversationKey,
    locks: Arc<ConversationLocks>,
    registry: Arc<CancellationRegistry>,
    adapter: Mutex<Option<Arc<dyn ExecutionAdapter>>>,
    /// Fired after cleanup, for callers waiting on a cancel.
    done: CancellationToken,
}

impl RunCloser {
    pub(crate) fn new(
        request_id: String,
        conversation: ConversationKey,
        locks: Arc<ConversationLocks>,
        registry: Arc<CancellationRegistry>,
        done: CancellationToken,
    ) -> Self {
        Self {
            closed: AtomicBool::new(false),
            request_id,
            conversation,
            locks,
            registry,
            adapter: Mutex::new(None),
            done,
        }
    }

    fn set_adapter(&self, adapter: Arc<dyn ExecutionAdapter>) {
        *lock(&self.adapter) = Some(adapter);
    }

    /// Release the current adapter's resources early, e.g. before falling back.
    fn release_adapter(&self) {
        if let Some(adapter) = lock(&self.adapter).take() {
            adapter.release();
        }
    }

    pub(crate) fn close(&self, outcome: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.registry.unregister(&self.request_id);
        self.release_adapter();
        self.locks.unlock(&self.conversation);
        self.done.cancel();
        tracing::info!(
            request_id = %self.request_id,
            conversation = %self.conversation,
            outcome,
            "Run closed"
        );
        true
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Closes the run if the driver task ends without doing it (panic, runtime shutdown).
struct CloseGuard(Arc<RunCloser>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close("dropped");
    }
}

/// Everything the driver task needs for one run.
pub(crate) struct Run {
    pub(crate) bridge: Arc<StreamingBridge>,
    pub(crate) request: RunRequest,
    pub(crate) conversation: ConversationKey,
    pub(crate) cancel: Arc<CancelState>,
    pub(crate) closer: Arc<RunCloser>,
}

impl Run {
    pub(crate) async fn drive(self, tx: mpsc::Sender<StreamRecord>) {
        let _guard = CloseGuard(Arc::clone(&self.closer));
        let request_id = self.request.request_id.clone();

        let (outcome, adapter) = self.execute(&tx).await;

        self.cancel.detach_reader();
        if outcome == RunOutcome::Aborted {
            tracing::info!(request_id = %request_id, "Client went away, cancelling run");
            self.bridge.registry.cancel(&request_id);
        }
        if let Some(adapter) = adapter.filter(|_| outcome != RunOutcome::Completed) {
            stop_adapter(adapter, self.bridge.config.stop_timeout, &request_id).await;
        }

        self.closer.close(outcome.label());

        let terminal = match outcome {
            RunOutcome::Completed => StreamRecord::Complete { request_id },
            RunOutcome::Cancelled | RunOutcome::Aborted => StreamRecord::Cancelled { request_id },
            RunOutcome::Errored(message) => StreamRecord::Error {
                request_id,
                message,
            },
        };
        let _ = tx.send(terminal).await;
    }

    async fn execute(
        &self,
        tx: &mpsc::Sender<StreamRecord>,
    ) -> (RunOutcome, Option<Arc<dyn ExecutionAdapter>>) {
        let request_id = &self.request.request_id;
        let token = &self.cancel.token;

        let mut adapter = tokio::select! {
            biased;
            _ = token.cancelled() => return (RunOutcome::Cancelled, None),
            _ = tx.closed() => return (RunOutcome::Aborted, None),
            adapter = self.bridge.selector.select(&self.request.workspace) => adapter,
        };
        self.closer.set_adapter(Arc::clone(&adapter));

        let mut started = tokio::select! {
            biased;
            _ = token.cancelled() => return (RunOutcome::Cancelled, Some(adapter)),
            started = adapter.start(self.request.clone()) => started,
        };

        if let Err(err) = &started {
            if adapter.mode() == ExecutionMode::Pooled && !self.cancel.is_cancelled() {
                tracing::warn!(
                    request_id = %request_id,
                    error = %err,
                    "Pooled worker failed to start the run, falling back to one-shot"
                );
                self.closer.release_adapter();
                adapter = self.bridge.selector.one_shot();
                self.closer.set_adapter(Arc::clone(&adapter));
                started = tokio::select! {
                    biased;
                    _ = token.cancelled() => return (RunOutcome::Cancelled, Some(adapter)),
                    started = adapter.start(self.request.clone()) => started,
                };
            }
        }

        let start = StreamRecord::Start {
            request_id: request_id.clone(),
            conversation_key: self.conversation.clone(),
            mode: adapter.mode(),
        };
        if tx.send(start).await.is_err() {
            return (RunOutcome::Aborted, Some(adapter));
        }

        let (mut events, reader) = match started {
            Ok(pump) => pump,
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "Run failed to start");
                return (RunOutcome::Errored(err.to_string()), Some(adapter));
            }
        };
        self.cancel.attach_reader(reader.abort_handle());
        tracing::info!(request_id = %request_id, mode = %adapter.mode(), "Run streaming");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break RunOutcome::Cancelled,
                _ = tx.closed() => break RunOutcome::Aborted,
                event = events.recv() => {
                    let Some(event) = event else {
                        break RunOutcome::Completed;
                    };
                    if let Some(message) = event.error_message() {
                        break RunOutcome::Errored(message.to_string());
                    }
                    let record = StreamRecord::Event {
                        request_id: request_id.clone(),
                        event,
                    };
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break RunOutcome::Cancelled,
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                break RunOutcome::Aborted;
                            }
                        }
                    }
                }
            }
        };
        (outcome, Some(adapter))
    }
}

/// Stop the adapter, waiting at most `timeout`. A slower stop keeps running detached.
async fn stop_adapter(adapter: Arc<dyn ExecutionAdapter>, timeout: Duration, request_id: &str) {
    let stopping = tokio::spawn(async move { adapter.stop().await });
    if tokio::time::timeout(timeout, stopping).await.is_err() {
        tracing::warn!(
            request_id = %request_id,
            timeout_ms = as_millis_u64(timeout),
            "Adapter stop timed out, cleaning up anyway"
        );
    }
}

/// Records of one run, in order. Dropping it aborts the run.
pub struct RunStream {
    request_id: String,
    conversation: ConversationKey,
    rx: mpsc::Receiver<StreamRecord>,
}

impl RunStream {
    pub(crate) fn new(
        request_id: String,
        conversation: ConversationKey,
        rx: mpsc::Receiver<StreamRecord>,
    ) -> Self {
        Self {
            request_id,
            conversation,
            rx,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn conversation(&self) -> &ConversationKey {
        &self.conversation
    }

    /// Wait for the next record.
    pub async fn next_record(&mut self) -> Option<StreamRecord> {
        self.rx.recv().await
    }

    /// Newline-delimited JSON body for an HTTP response.
    pub fn into_ndjson(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let mut rx = self.rx;
        async_stream::stream! {
            while let Some(record) = rx.recv().await {
                match record.to_ndjson() {
                    Ok(line) => yield Ok(line),
                    Err(e) => {
                        tracing::warn!(request_id = %record.request_id(), "Failed to encode stream record: {}", e);
                    }
                }
            }
        }
    }
}

impl Stream for RunStream {
    type Item = StreamRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
