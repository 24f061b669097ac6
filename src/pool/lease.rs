use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::WorkerPool;
use crate::backend::WorkerSession;

/// Exclusive use of a Busy worker. Returns it to the pool on release or drop.
pub struct WorkerLease {
    pub(super) pool: Arc<WorkerPool>,
    pub(super) workspace_key: String,
    pub(super) worker_id: Uuid,
    pub(super) session: Arc<dyn WorkerSession>,
    pub(super) released: AtomicBool,
}

impl WorkerLease {
    pub fn session(&self) -> &Arc<dyn WorkerSession> {
        &self.session
    }

    pub fn workspace_key(&self) -> &str {
        &self.workspace_key
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Hand the worker back. Only the first call has an effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release_worker(&self.workspace_key, self.worker_id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("workspace_key", &self.workspace_key)
            .field("worker_id", &self.worker_id)
            .field("released", &self.is_released())
            .finish()
    }
}
