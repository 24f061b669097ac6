//! One interface over "run on a warm worker" and "run in a fresh process".
//!
//! The bridge never knows which one it got. `stop` is safe to call at any
//! point: before `start`, while streaming, and after the stream ended.

mod oneshot;
mod pooled;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::backend::{AgentEngine, EngineError, EventPump, RunRequest};
use crate::pool::{PoolError, WorkerPool};
use crate::workspace::Workspace;

pub use oneshot::OneShotAdapter;
pub use pooled::PooledAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Pooled,
    OneShot,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled => write!(f, "pooled"),
            Self::OneShot => write!(f, "one_shot"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter was stopped before the run started")]
    Stopped,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Begin the run and return its event stream.
    async fn start(&self, request: RunRequest) -> Result<EventPump, AdapterError>;

    /// Ask the run to stop. Idempotent.
    async fn stop(&self);

    /// Give back whatever execution resource the adapter holds. Idempotent.
    fn release(&self) {}
}

/// Picks a pooled adapter when a worker is available, one-shot otherwise.
pub struct AdapterSelector {
    pool: Arc<WorkerPool>,
    engine: Arc<dyn AgentEngine>,
}

impl AdapterSelector {
    pub fn new(pool: Arc<WorkerPool>, engine: Arc<dyn AgentEngine>) -> Self {
        Self { pool, engine }
    }

    pub async fn select(&self, workspace: &Workspace) -> Arc<dyn ExecutionAdapter> {
        match self.pool.acquire(workspace).await {
            Ok(lease) => Arc::new(PooledAdapter::new(lease)),
            Err(err) => {
                match &err {
                    PoolError::Disabled => {}
                    PoolError::WorkerBusy(_) | PoolError::WorkerStarting(_) => {
                        tracing::info!(workspace = %workspace.key, "{}, running one-shot", err);
                    }
                    _ => {
                        tracing::warn!(workspace = %workspace.key, error = %err, "No pooled worker, falling back to one-shot");
                    }
                }
                self.one_shot()
            }
        }
    }

    pub fn one_shot(&self) -> Arc<dyn ExecutionAdapter> {
        Arc::new(OneShotAdapter::new(Arc::clone(&self.engine)))
    }
}
