//! In-process engine that replays a fixed script of events.
//!
//! Used by the test suite and by `BROKER_ENGINE=scripted` for running the
//! broker without an agent CLI installed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgentEngine, EngineError, EventPump, ExecutionEvent, RunRequest, WorkerSession};
use crate::util::lock;
use crate::workspace::Workspace;

/// One scripted event, emitted after `delay`.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub event: ExecutionEvent,
}

impl ScriptStep {
    pub fn new(event: ExecutionEvent) -> Self {
        Self {
            delay: Duration::ZERO,
            event,
        }
    }

    pub fn after(delay: Duration, event: ExecutionEvent) -> Self {
        Self { delay, event }
    }
}

#[derive(Default)]
struct ScriptState {
    steps: Mutex<Vec<ScriptStep>>,
    fail_spawn: AtomicBool,
    fail_queries: AtomicBool,
    workers_spawned: AtomicUsize,
    one_shot_runs: AtomicUsize,
    shutdowns: AtomicUsize,
    events_delivered: AtomicUsize,
    worker_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Engine whose runs replay a script instead of calling an agent.
#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<ScriptState>,
    spawn_delay: Duration,
    cancel_delay: Duration,
    shutdown_delay: Duration,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        let state = ScriptState::default();
        *lock(&state.steps) = steps;
        Self {
            state: Arc::new(state),
            spawn_delay: Duration::ZERO,
            cancel_delay: Duration::ZERO,
            shutdown_delay: Duration::ZERO,
        }
    }

    /// A short canned conversation.
    pub fn demo() -> Self {
        let pause = Duration::from_millis(150);
        Self::new(vec![
            ScriptStep::new(ExecutionEvent::Thinking {
                content: "Looking at the workspace".to_string(),
            }),
            ScriptStep::after(
                pause,
                ExecutionEvent::TextDelta {
                    content: "Hello from the ".to_string(),
                },
            ),
            ScriptStep::after(
                pause,
                ExecutionEvent::TextDelta {
                    content: "scripted engine.".to_string(),
                },
            ),
            ScriptStep::after(
                pause,
                ExecutionEvent::MessageComplete { session_id: None },
            ),
        ])
    }

    /// Delay before a spawned worker reports ready.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Delay a worker takes to acknowledge a cancel. It stays busy until then.
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }

    /// Delay a worker takes to exit once asked to shut down.
    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    pub fn failing_spawns(self) -> Self {
        self.set_fail_spawn(true);
        self
    }

    pub fn set_script(&self, steps: Vec<ScriptStep>) {
        *lock(&self.state.steps) = steps;
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.state.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make worker queries fail, as a worker that rejects requests would.
    pub fn set_fail_queries(&self, fail: bool) {
        self.state.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn workers_spawned(&self) -> usize {
        self.state.workers_spawned.load(Ordering::SeqCst)
    }

    pub fn one_shot_runs(&self) -> usize {
        self.state.one_shot_runs.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Events pushed into a run's event channel, across all runs.
    pub fn events_delivered(&self) -> usize {
        self.state.events_delivered.load(Ordering::SeqCst)
    }

    /// Mark every spawned worker as dead, as if their processes crashed.
    pub fn kill_workers(&self) {
        for flag in lock(&self.state.worker_flags).iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn script(&self) -> Vec<ScriptStep> {
        lock(&self.state.steps).clone()
    }
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn spawn_worker(
        &self,
        workspace: &Workspace,
    ) -> Result<Arc<dyn WorkerSession>, EngineError> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.state.fail_spawn.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected(format!(
                "scripted spawn failure for {}",
                workspace.key
            )));
        }

        self.state.workers_spawned.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        lock(&self.state.worker_flags).push(Arc::clone(&alive));

        Ok(Arc::new(ScriptedWorker {
            id: format!("scripted-{}", &Uuid::new_v4().simple().to_string()[..8]),
            engine: self.clone(),
            alive,
            draining: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn run_once(
        &self,
        _request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError> {
        self.state.one_shot_runs.fetch_add(1, Ordering::SeqCst);
        Ok(replay(self.script(), cancel, Arc::clone(&self.state), None))
    }
}

struct ScriptedWorker {
    id: String,
    engine: ScriptedEngine,
    alive: Arc<AtomicBool>,
    /// Set while a query runs, cleared when it ends or a cancel is acknowledged.
    draining: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerSession for ScriptedWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        !self.draining.load(Ordering::SeqCst)
    }

    async fn query(
        &self,
        _request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<EventPump, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::WorkerExited);
        }
        if self.engine.state.fail_queries.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected(format!("{} rejected the query", self.id)));
        }
        self.draining.store(true, Ordering::SeqCst);
        Ok(replay(
            self.engine.script(),
            cancel,
            Arc::clone(&self.engine.state),
            Some(Arc::clone(&self.draining)),
        ))
    }

    async fn cancel(&self, _request_id: &str) {
        if !self.engine.cancel_delay.is_zero() {
            tokio::time::sleep(self.engine.cancel_delay).await;
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        self.engine.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        if !self.engine.shutdown_delay.is_zero() {
            tokio::time::sleep(self.engine.shutdown_delay).await;
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Feed `steps` into a fresh channel. `draining` is cleared when the script
/// runs out or the reader goes away, but not on cancel.
fn replay(
    steps: Vec<ScriptStep>,
    cancel: CancellationToken,
    state: Arc<ScriptState>,
    draining: Option<Arc<AtomicBool>>,
) -> EventPump {
    let (tx, rx) = mpsc::channel(steps.len().max(1));
    let handle = tokio::spawn(async move {
        for step in steps {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(step.delay) => {}
            }
            if cancel.is_cancelled() {
                return;
            }
            if tx.send(step.event).await.is_err() {
                break;
            }
            state.events_delivered.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(draining) = draining {
            draining.store(false, Ordering::SeqCst);
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(root: &std::path::Path) -> RunRequest {
        RunRequest {
            request_id: "r".to_string(),
            prompt: "p".to_string(),
            workspace: Workspace::resolve(root, "ws").unwrap(),
            model: None,
        }
    }

    fn text(content: &str) -> ExecutionEvent {
        ExecutionEvent::TextDelta {
            content: content.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_replay_between_steps() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::new(text("a")),
            ScriptStep::after(Duration::from_secs(5), text("b")),
        ]);
        let cancel = CancellationToken::new();
        let (mut rx, handle) = engine
            .run_once(request(std::path::Path::new("/tmp")), cancel.clone())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(text("a")));
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert_eq!(engine.one_shot_runs(), 1);
    }

    #[tokio::test]
    async fn killed_workers_refuse_queries() {
        let engine = ScriptedEngine::new(vec![ScriptStep::new(text("a"))]);
        let workspace = Workspace::resolve(std::path::Path::new("/tmp"), "ws").unwrap();
        let worker = engine.spawn_worker(&workspace).await.unwrap();
        assert!(worker.is_alive());

        engine.kill_workers();
        assert!(!worker.is_alive());
        let result = worker
            .query(request(std::path::Path::new("/tmp")), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::WorkerExited)));
    }

    #[tokio::test]
    async fn failing_spawns_can_be_toggled() {
        let engine = ScriptedEngine::new(Vec::new()).failing_spawns();
        let workspace = Workspace::resolve(std::path::Path::new("/tmp"), "ws").unwrap();
        assert!(engine.spawn_worker(&workspace).await.is_err());

        engine.set_fail_spawn(false);
        assert!(engine.spawn_worker(&workspace).await.is_ok());
        assert_eq!(engine.workers_spawned(), 1);
    }
}
