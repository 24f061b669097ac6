use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::backend::EngineError;

/// Lifecycle of a pooled worker: `Starting -> Idle <-> Busy -> evicted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, not yet ready. Not assignable.
    Starting,
    Idle,
    /// Running a query.
    Busy,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    /// Upper bound on live workers, including those still starting.
    pub max_workers: usize,
    /// Idle workers older than this are evicted.
    pub idle_timeout: Duration,
    pub eviction_interval: Duration,
    /// How long a spawned worker may take to report ready.
    pub ready_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 4,
            idle_timeout: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub starting: usize,
    pub max_workers: usize,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub workspace_key: String,
    pub worker_id: String,
    pub state: WorkerState,
    pub is_active: bool,
    pub queries_processed: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
}

/// Reasons `acquire` did not hand out a worker. All of them mean "use one-shot".
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is disabled")]
    Disabled,
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("worker for workspace {0} is busy")]
    WorkerBusy(String),
    #[error("worker for workspace {0} is still starting")]
    WorkerStarting(String),
    #[error("worker pool is at capacity ({0} workers)")]
    Exhausted(usize),
    #[error("failed to spawn worker for workspace {workspace}: {source}")]
    Spawn {
        workspace: String,
        #[source]
        source: EngineError,
    },
    #[error("worker for workspace {0} not ready after {1:?}")]
    ReadyTimeout(String, Duration),
}
