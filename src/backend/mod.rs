//! Agent engine boundary.
//!
//! The agent engine is a black box: given a prompt and a workspace it
//! produces a sequence of [`ExecutionEvent`]s and eventually terminates, or
//! can be asked to stop. Engines come in two shapes:
//! - long-lived [`WorkerSession`]s bound to one workspace (pooled, warm)
//! - one-shot runs that spawn a fresh process per request
//!
//! # Engines
//! - **CliEngine**: spawns an agent CLI speaking NDJSON over stdio
//! - **ScriptedEngine**: in-process replay of scripted events (tests, demos)

pub mod cli;
pub mod events;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::workspace::Workspace;

pub use cli::{CliConfig, CliEngine};
pub use events::ExecutionEvent;
pub use scripted::{ScriptStep, ScriptedEngine};

/// Receiving end of a run's events. Closes when the run is over.
pub type EventStream = mpsc::Receiver<ExecutionEvent>;

/// Event stream plus the task feeding it. Aborting the task releases the reader.
pub type EventPump = (EventStream, JoinHandle<()>);

/// A single agent run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: String,
    pub prompt: String,
    pub workspace: Workspace,
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare workspace directory: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("failed to capture agent {0}")]
    MissingPipe(&'static str),
    #[error("failed to write to agent stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to serialize agent request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("worker process exited")]
    WorkerExited,
    #[error("{0}")]
    Rejected(String),
}

/// A live worker process bound to one workspace.
#[async_trait]
pub trait WorkerSession: Send + Sync {
    /// Stable identifier for logs.
    fn id(&self) -> &str;

    /// False once the underlying process has exited.
    fn is_alive(&self) -> bool;

    /// False while a query is still in flight, including one draining after a cancel.
    fn is_idle(&self) -> bool {
        true
    }

    /// Run one query. The stream ends when the query finishes or `cancel` fires.
    async fn query(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError>;

    /// Ask the worker to stop the given query. Best effort.
    async fn cancel(&self, request_id: &str);

    /// Terminate the worker.
    async fn shutdown(&self);
}

/// Factory for worker sessions and one-shot runs.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn a worker for `workspace` and wait until it reports ready.
    async fn spawn_worker(&self, workspace: &Workspace)
        -> Result<Arc<dyn WorkerSession>, EngineError>;

    /// Run a request in a fresh, non-reused process.
    async fn run_once(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError>;
}
