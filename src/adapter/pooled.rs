use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, ExecutionAdapter, ExecutionMode};
use crate::backend::{EventPump, RunRequest};
use crate::pool::WorkerLease;
use crate::util::lock;

/// Runs on a leased warm worker.
pub struct PooledAdapter {
    lease: WorkerLease,
    cancel: CancellationToken,
    request_id: Mutex<Option<String>>,
}

impl PooledAdapter {
    pub fn new(lease: WorkerLease) -> Self {
        Self {
            lease,
            cancel: CancellationToken::new(),
            request_id: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for PooledAdapter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Pooled
    }

    async fn start(&self, request: RunRequest) -> Result<EventPump, AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Stopped);
        }
        *lock(&self.request_id) = Some(request.request_id.clone());
        tracing::debug!(
            request_id = %request.request_id,
            worker = %self.lease.session().id(),
            "Starting pooled run"
        );
        Ok(self.lease.session().query(request, self.cancel.clone()).await?)
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let request_id = lock(&self.request_id).clone();
        if let Some(request_id) = request_id {
            self.lease.session().cancel(&request_id).await;
        }
    }

    fn release(&self) {
        self.lease.release();
    }
}
