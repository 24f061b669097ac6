use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, ExecutionAdapter, ExecutionMode};
use crate::backend::{AgentEngine, EventPump, RunRequest};

/// Runs in a fresh agent process that exits with the run.
pub struct OneShotAdapter {
    engine: Arc<dyn AgentEngine>,
    cancel: CancellationToken,
}

impl OneShotAdapter {
    pub fn new(engine: Arc<dyn AgentEngine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for OneShotAdapter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::OneShot
    }

    async fn start(&self, request: RunRequest) -> Result<EventPump, AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Stopped);
        }
        tracing::debug!(request_id = %request.request_id, engine = %self.engine.name(), "Starting one-shot run");
        Ok(self.engine.run_once(request, self.cancel.clone()).await?)
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }
}
