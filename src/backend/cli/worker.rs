//! Long-lived agent worker process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{encode_line, WorkerMessage, WorkerRequest};
use super::{build_command, spawn, spawn_stderr_logger, CliConfig, EVENT_BUFFER};
use crate::backend::{EngineError, EventPump, ExecutionEvent, RunRequest, WorkerSession};
use crate::util::{lock, preview};
use crate::workspace::Workspace;

/// What the stdout reader hands to the query currently in flight.
enum QueryOutput {
    Event(ExecutionEvent),
    Done(Option<String>),
    Exited,
}

struct ActiveQuery {
    request_id: String,
    tx: mpsc::Sender<QueryOutput>,
}

struct WorkerInner {
    id: String,
    workspace_key: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    /// Query the worker is processing. Cleared only when the worker answers
    /// `done` (or exits), so a cancelled query still occupies the worker.
    active: Mutex<Option<ActiveQuery>>,
    idle: Notify,
    alive: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_grace: Duration,
    drain_timeout: Duration,
}

impl WorkerInner {
    async fn send(&self, request: &WorkerRequest<'_>) -> Result<(), EngineError> {
        let line = encode_line(request)?;
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(EngineError::WorkerExited)?;
        stdin.write_all(&line).await.map_err(EngineError::Write)?;
        stdin.flush().await.map_err(EngineError::Write)
    }

    fn route(&self, request_id: &str) -> Option<mpsc::Sender<QueryOutput>> {
        lock(&self.active)
            .as_ref()
            .filter(|active| active.request_id == request_id)
            .map(|active| active.tx.clone())
    }

    fn finish(&self, request_id: &str) -> Option<mpsc::Sender<QueryOutput>> {
        let mut active = lock(&self.active);
        if active.as_ref().map(|a| a.request_id.as_str()) != Some(request_id) {
            return None;
        }
        let finished = active.take().map(|a| a.tx);
        drop(active);
        self.idle.notify_waiters();
        finished
    }

    fn is_idle(&self) -> bool {
        lock(&self.active).is_none()
    }

    /// Wait until the worker has no query in flight.
    async fn wait_idle(&self) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.is_idle() || !self.alive.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.drain_timeout, wait).await.is_ok()
    }

    async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// Worker session backed by a CLI process started in worker mode.
pub struct CliWorker {
    inner: Arc<WorkerInner>,
}

/// Kills a worker whose startup was abandoned (timeout or caller gone).
struct StartupGuard {
    inner: Option<Arc<WorkerInner>>,
}

impl Drop for StartupGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.alive.store(false, Ordering::SeqCst);
            if let Ok(mut child) = inner.child.try_lock() {
                let _ = child.start_kill();
            }
        }
    }
}

impl CliWorker {
    pub(crate) async fn spawn(config: &CliConfig, workspace: &Workspace) -> Result<Self, EngineError> {
        workspace.ensure_dir().await.map_err(EngineError::Workspace)?;

        let command = build_command(config, &config.worker_args, workspace);
        let mut child = spawn(command, config, &config.worker_args)?;
        let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(EngineError::MissingPipe("stderr"))?;

        let id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
        tracing::info!(
            worker_id = %id,
            workspace = %workspace.key,
            pid = child.id().unwrap_or(0),
            "Spawned agent worker, waiting for ready"
        );

        let inner = Arc::new(WorkerInner {
            id: id.clone(),
            workspace_key: workspace.key.clone(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            active: Mutex::new(None),
            idle: Notify::new(),
            alive: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            shutdown_grace: config.shutdown_grace,
            drain_timeout: config.drain_timeout,
        });
        let mut guard = StartupGuard {
            inner: Some(Arc::clone(&inner)),
        };

        spawn_stderr_logger(stderr, id);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_worker_output(Arc::clone(&inner), stdout, ready_tx));

        match ready_rx.await {
            Ok(()) => {
                guard.inner = None;
                tracing::info!(worker_id = %inner.id, workspace = %inner.workspace_key, "Agent worker ready");
                Ok(Self { inner })
            }
            // The reader drops the sender when stdout closes before `ready`.
            Err(_) => Err(EngineError::WorkerExited),
        }
    }
}

#[async_trait]
impl WorkerSession for CliWorker {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    async fn query(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError> {
        let inner = Arc::clone(&self.inner);

        if !inner.wait_idle().await {
            tracing::warn!(worker_id = %inner.id, "Worker still busy with a previous query, killing it");
            inner.kill().await;
            return Err(EngineError::WorkerExited);
        }
        if !self.is_alive() {
            return Err(EngineError::WorkerExited);
        }

        let (out_tx, mut out_rx) = mpsc::channel(EVENT_BUFFER);
        {
            let mut active = lock(&inner.active);
            if active.is_some() {
                return Err(EngineError::Rejected(format!(
                    "worker {} already has a query in flight",
                    inner.id
                )));
            }
            *active = Some(ActiveQuery {
                request_id: request.request_id.clone(),
                tx: out_tx,
            });
        }

        let sent = inner
            .send(&WorkerRequest::Query {
                request_id: &request.request_id,
                prompt: &request.prompt,
                model: request.model.as_deref(),
            })
            .await;
        if let Err(e) = sent {
            inner.finish(&request.request_id);
            return Err(e);
        }

        tracing::debug!(worker_id = %inner.id, request_id = %request.request_id, "Query sent to worker");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let request_id = request.request_id;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = inner.send(&WorkerRequest::Cancel { request_id: &request_id }).await;
                        break;
                    }
                    output = out_rx.recv() => match output {
                        Some(QueryOutput::Event(event)) => {
                            if tx.send(event).await.is_err() {
                                let _ = inner.send(&WorkerRequest::Cancel { request_id: &request_id }).await;
                                break;
                            }
                        }
                        Some(QueryOutput::Done(None)) | None => break,
                        Some(QueryOutput::Done(Some(message))) => {
                            let _ = tx.send(ExecutionEvent::error(message)).await;
                            break;
                        }
                        Some(QueryOutput::Exited) => {
                            let _ = tx.send(ExecutionEvent::error("Agent worker exited mid-query")).await;
                            break;
                        }
                    }
                }
            }
        });
        Ok((rx, handle))
    }

    async fn cancel(&self, request_id: &str) {
        if lock(&self.inner.active).as_ref().map(|a| a.request_id.as_str()) != Some(request_id) {
            return;
        }
        if let Err(e) = self.inner.send(&WorkerRequest::Cancel { request_id }).await {
            tracing::debug!(worker_id = %self.inner.id, "Failed to send cancel: {}", e);
        }
        if !self.inner.wait_idle().await {
            tracing::warn!(
                worker_id = %self.inner.id,
                request_id = %request_id,
                "Worker did not acknowledge cancel, killing it"
            );
            self.inner.kill().await;
        }
    }

    async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(worker_id = %self.inner.id, workspace = %self.inner.workspace_key, "Shutting down agent worker");

        let _ = tokio::time::timeout(
            Duration::from_millis(500),
            self.inner.send(&WorkerRequest::Shutdown),
        )
        .await;
        // Dropping stdin signals EOF to workers that ignore `shutdown`.
        self.inner.stdin.lock().await.take();

        let mut child = self.inner.child.lock().await;
        match tokio::time::timeout(self.inner.shutdown_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(worker_id = %self.inner.id, "Worker ignored shutdown, killing");
                let _ = child.kill().await;
            }
        }
        self.inner.alive.store(false, Ordering::SeqCst);
    }
}

async fn read_worker_output(
    inner: Arc<WorkerInner>,
    stdout: ChildStdout,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(worker_id = %inner.id, "Error reading worker output: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: WorkerMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    worker_id = %inner.id,
                    "Failed to parse worker message: {} - line: {}",
                    e,
                    preview(line, 200)
                );
                continue;
            }
        };

        match message {
            WorkerMessage::Ready => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            WorkerMessage::Event { request_id, event } => match inner.route(&request_id) {
                Some(tx) => {
                    let _ = tx.send(QueryOutput::Event(event)).await;
                }
                None => {
                    tracing::debug!(worker_id = %inner.id, request_id = %request_id, "Dropping event for inactive query");
                }
            },
            WorkerMessage::Done { request_id, error } => {
                if let Some(tx) = inner.finish(&request_id) {
                    let _ = tx.send(QueryOutput::Done(error)).await;
                }
            }
            WorkerMessage::Log { message } => {
                tracing::debug!(worker_id = %inner.id, "worker: {}", preview(&message, 500));
            }
        }
    }

    inner.alive.store(false, Ordering::SeqCst);
    let active = lock(&inner.active).take();
    inner.idle.notify_waiters();
    if let Some(active) = active {
        let _ = active.tx.send(QueryOutput::Exited).await;
    }
    tracing::info!(worker_id = %inner.id, workspace = %inner.workspace_key, "Agent worker exited");
}
