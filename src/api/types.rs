//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationInfo;
use crate::conversation::ConversationKey;
use crate::pool::{PoolStats, WorkerInfo};

/// Body of `POST /api/chat`.
///
/// Identity normally comes from an auth layer in front of the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub user_id: String,
    pub tab_group_id: String,
    pub tab_id: String,
    pub workspace: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of `POST /api/chat/cancel`: a request id, or the full conversation scope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tab_group_id: Option<String>,
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    /// True when at least one run was cancelled.
    pub ok: bool,
    pub cancelled: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub engine: String,
    pub pool_enabled: bool,
}

/// Snapshot served by `GET /api/debug/state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub locks: LocksState,
    pub cancellation_registry: RegistryState,
    pub worker_pool: PoolState,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocksState {
    pub count: usize,
    pub keys: Vec<ConversationKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryState {
    pub count: usize,
    pub entries: Vec<CancellationInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolState {
    pub enabled: bool,
    pub stats: PoolStats,
    pub workers: Vec<WorkerInfo>,
}
