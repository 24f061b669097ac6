//! Streaming bridge between a chat request and an agent run.
//!
//! `start` takes the conversation lock, registers the run for out-of-band
//! cancellation and spawns a driver task that forwards adapter events as
//! [`StreamRecord`]s. Whatever ends the run (natural completion, an error
//! event, an external cancel, or the client dropping the stream), cleanup
//! runs exactly once: unregister, release the worker, unlock.

mod record;
mod run;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterSelector;
use crate::backend::{AgentEngine, RunRequest};
use crate::cancellation::{CancellationRegistry, RunScope};
use crate::conversation::{ConversationKey, ConversationLocks};
use crate::pool::WorkerPool;
use crate::util::as_millis_u64;
use crate::workspace::Workspace;

pub use record::StreamRecord;
pub use run::RunStream;

use run::{CancelState, Run, RunCloser};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long to wait for an adapter to stop before cleaning up anyway.
    pub stop_timeout: Duration,
    /// How long a cancel call waits for the run's cleanup.
    pub cancel_wait: Duration,
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(3),
            cancel_wait: Duration::from_secs(5),
            channel_capacity: 64,
        }
    }
}

/// A validated chat turn.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation: ConversationKey,
    pub workspace: Workspace,
    pub prompt: String,
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("conversation {0} already has a run in progress")]
    Busy(ConversationKey),
}

pub struct StreamingBridge {
    locks: Arc<ConversationLocks>,
    registry: Arc<CancellationRegistry>,
    pool: Arc<WorkerPool>,
    selector: AdapterSelector,
    config: BridgeConfig,
}

impl StreamingBridge {
    pub fn new(
        locks: Arc<ConversationLocks>,
        registry: Arc<CancellationRegistry>,
        pool: Arc<WorkerPool>,
        engine: Arc<dyn AgentEngine>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            selector: AdapterSelector::new(Arc::clone(&pool), engine),
            locks,
            registry,
            pool,
            config,
        })
    }

    pub fn locks(&self) -> &Arc<ConversationLocks> {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Lock the conversation and start streaming a run.
    ///
    /// Fails only with [`BridgeError::Busy`], before anything is acquired.
    /// Later failures arrive in-band as a terminal `error` record.
    pub fn start(self: &Arc<Self>, request: ChatRequest) -> Result<RunStream, BridgeError> {
        let ChatRequest {
            conversation,
            workspace,
            prompt,
            model,
        } = request;

        if !self.locks.try_lock(&conversation) {
            tracing::info!(conversation = %conversation, "Conversation busy, refusing run");
            return Err(BridgeError::Busy(conversation));
        }

        let request_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(CancelState::default());
        let done = CancellationToken::new();
        let closer = Arc::new(RunCloser::new(
            request_id.clone(),
            conversation.clone(),
            Arc::clone(&self.locks),
            Arc::clone(&self.registry),
            done.clone(),
        ));

        {
            let cancel = Arc::clone(&cancel);
            self.registry.register_run(
                request_id.clone(),
                RunScope {
                    conversation: conversation.clone(),
                    workspace: workspace.key.clone(),
                },
                done,
                move || cancel.trigger(),
            );
        }

        tracing::info!(
            request_id = %request_id,
            conversation = %conversation,
            workspace = %workspace.key,
            "Run started"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let run = Run {
            bridge: Arc::clone(self),
            request: RunRequest {
                request_id: request_id.clone(),
                prompt,
                workspace,
                model,
            },
            conversation: conversation.clone(),
            cancel,
            closer,
        };
        tokio::spawn(run.drive(tx));

        Ok(RunStream::new(request_id, conversation, rx))
    }

    /// Cancel a run by request id and wait for its cleanup. False if unknown.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let Some(done) = self.registry.cancel_run(request_id) else {
            return false;
        };
        self.wait_closed(request_id, done).await;
        true
    }

    /// Cancel every run of `conversation` in `workspace` and wait for their cleanup.
    pub async fn cancel_conversation(
        &self,
        conversation: &ConversationKey,
        workspace: &str,
    ) -> Vec<String> {
        let runs = self.registry.cancel_scope(conversation, workspace);
        join_all(
            runs.iter()
                .map(|(request_id, done)| self.wait_closed(request_id, done.clone())),
        )
        .await;
        runs.into_iter().map(|(request_id, _)| request_id).collect()
    }

    async fn wait_closed(&self, request_id: &str, done: CancellationToken) {
        if tokio::time::timeout(self.config.cancel_wait, done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(
                request_id = %request_id,
                wait_ms = as_millis_u64(self.config.cancel_wait),
                "Run did not finish cleanup in time after cancel"
            );
        }
    }
}
