use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use super::routes::AppState;
use super::types::{DebugState, LocksState, PoolState, RegistryState};

/// Read-only view of the process-wide tables.
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<DebugState> {
    let bridge = &state.bridge;

    let mut keys = bridge.locks().list_locked();
    keys.sort();
    let entries = bridge.registry().list();
    let pool = bridge.pool();

    Json(DebugState {
        locks: LocksState {
            count: keys.len(),
            keys,
        },
        cancellation_registry: RegistryState {
            count: entries.len(),
            entries,
        },
        worker_pool: PoolState {
            enabled: pool.is_enabled(),
            stats: pool.stats(),
            workers: pool.info(),
        },
    })
}
