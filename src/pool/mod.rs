//! Bounded pool of warm, workspace-affine agent workers.
//!
//! At most one worker exists per workspace key. A worker is handed out
//! exclusively (Busy) through a [`WorkerLease`] and goes back to Idle when
//! the lease is released. A worker still draining a cancelled query when its
//! lease is released is retired instead. Idle workers are evicted after
//! `idle_timeout`, both by a background loop and opportunistically on
//! `acquire`; the latter never waits for the evicted workers to exit.
//!
//! `acquire` never waits for another run: a Busy or Starting worker for the
//! workspace is reported as an error and the caller runs one-shot instead.

mod lease;
mod types;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{AgentEngine, WorkerSession};
use crate::util::{as_millis_u64, lock};
use crate::workspace::Workspace;

pub use lease::WorkerLease;
pub use types::{PoolConfig, PoolError, PoolStats, WorkerInfo, WorkerState};

struct WorkerSlot {
    id: Uuid,
    state: WorkerState,
    created_at: Instant,
    last_activity: Instant,
    queries_processed: u64,
    /// `None` while Starting.
    session: Option<Arc<dyn WorkerSession>>,
}

impl WorkerSlot {
    fn is_live_idle(&self) -> bool {
        self.state == WorkerState::Idle && self.session.as_ref().is_some_and(|s| is_reusable(s.as_ref()))
    }
}

pub struct WorkerPool {
    engine: Arc<dyn AgentEngine>,
    config: PoolConfig,
    workers: Mutex<HashMap<String, WorkerSlot>>,
    shutdown: CancellationToken,
}

/// Removes a Starting slot if the acquire that created it does not finish.
struct StartingGuard<'a> {
    pool: &'a WorkerPool,
    workspace_key: &'a str,
    worker_id: Uuid,
    armed: bool,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut workers = lock(&self.pool.workers);
        let matches = workers.get(self.workspace_key).is_some_and(|slot| {
            slot.id == self.worker_id && slot.state == WorkerState::Starting
        });
        if matches {
            workers.remove(self.workspace_key);
        }
    }
}

impl WorkerPool {
    pub fn new(engine: Arc<dyn AgentEngine>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            workers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get exclusive use of the workspace's worker, spawning it if needed.
    pub async fn acquire(self: &Arc<Self>, workspace: &Workspace) -> Result<WorkerLease, PoolError> {
        if !self.config.enabled {
            return Err(PoolError::Disabled);
        }
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        spawn_shutdowns(
            self.take_expired()
                .into_iter()
                .filter_map(|(_, slot)| slot.session)
                .collect(),
        );

        let key = workspace.key.clone();
        let mut retired: Vec<Arc<dyn WorkerSession>> = Vec::new();
        let worker_id = {
            let mut workers = lock(&self.workers);

            if let Some(slot) = workers.get_mut(&key) {
                match slot.state {
                    WorkerState::Busy => return Err(PoolError::WorkerBusy(key)),
                    WorkerState::Starting => return Err(PoolError::WorkerStarting(key)),
                    WorkerState::Idle if slot.is_live_idle() => {
                        if let Some(session) = slot.session.clone() {
                            slot.state = WorkerState::Busy;
                            tracing::info!(
                                workspace = %key,
                                worker_id = %slot.id,
                                queries_processed = slot.queries_processed,
                                "Reusing warm worker"
                            );
                            return Ok(self.lease(key, slot.id, session));
                        }
                    }
                    WorkerState::Idle => {}
                }
                // Idle but its process is gone or still draining.
                if let Some(dead) = workers.remove(&key) {
                    tracing::info!(workspace = %key, worker_id = %dead.id, "Dropping unusable idle worker");
                    retired.extend(dead.session);
                }
            }

            if workers.len() >= self.config.max_workers {
                let lru = workers
                    .iter()
                    .filter(|(_, slot)| slot.state == WorkerState::Idle)
                    .min_by_key(|(_, slot)| slot.last_activity)
                    .map(|(k, _)| k.clone());
                match lru.and_then(|k| workers.remove(&k).map(|slot| (k, slot))) {
                    Some((evicted_key, slot)) => {
                        tracing::info!(
                            workspace = %evicted_key,
                            worker_id = %slot.id,
                            "Evicting least recently used worker to make room"
                        );
                        retired.extend(slot.session);
                    }
                    None => {
                        spawn_shutdowns(retired);
                        return Err(PoolError::Exhausted(self.config.max_workers));
                    }
                }
            }

            let now = Instant::now();
            let worker_id = Uuid::new_v4();
            workers.insert(
                key.clone(),
                WorkerSlot {
                    id: worker_id,
                    state: WorkerState::Starting,
                    created_at: now,
                    last_activity: now,
                    queries_processed: 0,
                    session: None,
                },
            );
            worker_id
        };
        spawn_shutdowns(retired);

        let mut guard = StartingGuard {
            pool: self,
            workspace_key: &key,
            worker_id,
            armed: true,
        };

        tracing::info!(workspace = %key, worker_id = %worker_id, "Starting worker");
        let spawned =
            tokio::time::timeout(self.config.ready_timeout, self.engine.spawn_worker(workspace))
                .await;
        let session = match spawned {
            Ok(Ok(session)) => session,
            Ok(Err(source)) => {
                tracing::warn!(workspace = %key, error = %source, "Worker failed to start");
                return Err(PoolError::Spawn {
                    workspace: key.clone(),
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(
                    workspace = %key,
                    timeout_ms = as_millis_u64(self.config.ready_timeout),
                    "Worker not ready in time"
                );
                return Err(PoolError::ReadyTimeout(key.clone(), self.config.ready_timeout));
            }
        };

        let promoted = {
            let mut workers = lock(&self.workers);
            match workers.get_mut(&key) {
                Some(slot)
                    if slot.id == worker_id
                        && slot.state == WorkerState::Starting
                        && !self.shutdown.is_cancelled() =>
                {
                    let now = Instant::now();
                    slot.state = WorkerState::Busy;
                    slot.created_at = now;
                    slot.last_activity = now;
                    slot.session = Some(Arc::clone(&session));
                    true
                }
                _ => false,
            }
        };
        guard.armed = promoted;
        drop(guard);

        if !promoted {
            spawn_shutdowns(vec![session]);
            return Err(PoolError::ShuttingDown);
        }

        tracing::info!(workspace = %key, worker_id = %worker_id, session = %session.id(), "Worker ready");
        Ok(self.lease(key, worker_id, session))
    }

    fn lease(self: &Arc<Self>, workspace_key: String, worker_id: Uuid, session: Arc<dyn WorkerSession>) -> WorkerLease {
        WorkerLease {
            pool: Arc::clone(self),
            workspace_key,
            worker_id,
            session,
            released: AtomicBool::new(false),
        }
    }

    /// Return a leased worker to the pool. Same as [`WorkerLease::release`].
    pub fn release(&self, lease: &WorkerLease) {
        lease.release();
    }

    pub(crate) fn release_worker(&self, workspace_key: &str, worker_id: Uuid) {
        let mut workers = lock(&self.workers);
        let Some(slot) = workers.get_mut(workspace_key) else {
            return;
        };
        if slot.id != worker_id || slot.state != WorkerState::Busy {
            return;
        }

        let session = slot.session.as_deref();
        if session.is_some_and(|s| is_reusable(s)) {
            slot.state = WorkerState::Idle;
            slot.queries_processed += 1;
            slot.last_activity = Instant::now();
            tracing::debug!(
                workspace = %workspace_key,
                worker_id = %worker_id,
                queries_processed = slot.queries_processed,
                "Worker released"
            );
            return;
        }

        if session.is_some_and(|s| s.is_alive()) {
            tracing::warn!(
                workspace = %workspace_key,
                worker_id = %worker_id,
                "Released worker is still draining its last query, retiring"
            );
        } else {
            tracing::info!(workspace = %workspace_key, worker_id = %worker_id, "Released worker is dead, removing");
        }
        let retired = workers.remove(workspace_key);
        drop(workers);
        if let Some(retired) = retired {
            spawn_shutdowns(retired.session.into_iter().collect());
        }
    }

    /// Remove Idle slots idle longer than `idle_timeout`, leaving their shutdown to the caller.
    fn take_expired(&self) -> Vec<(String, WorkerSlot)> {
        let now = Instant::now();
        let mut workers = lock(&self.workers);
        let keys: Vec<String> = workers
            .iter()
            .filter(|(_, slot)| {
                slot.state == WorkerState::Idle
                    && now.duration_since(slot.last_activity) > self.config.idle_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();
        let expired: Vec<(String, WorkerSlot)> = keys
            .into_iter()
            .filter_map(|key| workers.remove(&key).map(|slot| (key, slot)))
            .collect();
        drop(workers);

        for (key, slot) in &expired {
            tracing::info!(
                workspace = %key,
                worker_id = %slot.id,
                idle_ms = as_millis_u64(now.duration_since(slot.last_activity)),
                "Evicting idle worker"
            );
        }
        expired
    }

    /// Terminate Idle workers that have been idle longer than `idle_timeout`.
    pub async fn evict_idle(&self) -> usize {
        let evicted = self.take_expired();
        if evicted.is_empty() {
            return 0;
        }

        let count = evicted.len();
        join_all(
            evicted
                .into_iter()
                .filter_map(|(_, slot)| slot.session)
                .map(|session| async move { session.shutdown().await }),
        )
        .await;
        count
    }

    /// Run `evict_idle` every `eviction_interval` until the pool shuts down.
    pub fn spawn_eviction_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.eviction_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "Eviction pass finished");
                        }
                    }
                }
            }
            tracing::debug!("Eviction loop stopped");
        })
    }

    /// Stop the eviction loop and terminate every worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<WorkerSlot> = lock(&self.workers).drain().map(|(_, slot)| slot).collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(workers = drained.len(), "Shutting down worker pool");
        join_all(
            drained
                .into_iter()
                .filter_map(|slot| slot.session)
                .map(|session| async move { session.shutdown().await }),
        )
        .await;
    }

    pub fn stats(&self) -> PoolStats {
        let workers = lock(&self.workers);
        let count = |state| workers.values().filter(|slot| slot.state == state).count();
        PoolStats {
            total: workers.len(),
            active: count(WorkerState::Busy),
            idle: count(WorkerState::Idle),
            starting: count(WorkerState::Starting),
            max_workers: self.config.max_workers,
        }
    }

    pub fn info(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        let mut infos: Vec<WorkerInfo> = lock(&self.workers)
            .iter()
            .map(|(key, slot)| WorkerInfo {
                workspace_key: key.clone(),
                worker_id: slot.id.to_string(),
                state: slot.state,
                is_active: slot.state == WorkerState::Busy,
                queries_processed: slot.queries_processed,
                age_ms: as_millis_u64(now.duration_since(slot.created_at)),
                idle_ms: as_millis_u64(now.duration_since(slot.last_activity)),
            })
            .collect();
        infos.sort_by(|a, b| a.workspace_key.cmp(&b.workspace_key));
        infos
    }
}

fn is_reusable(session: &dyn WorkerSession) -> bool {
    session.is_alive() && session.is_idle()
}

/// Shut sessions down in the background. Callable from sync code.
fn spawn_shutdowns(sessions: Vec<Arc<dyn WorkerSession>>) {
    if sessions.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            for session in sessions {
                handle.spawn(async move { session.shutdown().await });
            }
        }
        Err(_) => {
            tracing::warn!(count = sessions.len(), "No runtime to shut down retired workers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionEvent, RunRequest, ScriptStep, ScriptedEngine};
    use std::path::Path;
    use std::time::Duration;

    fn engine() -> ScriptedEngine {
        ScriptedEngine::new(vec![ScriptStep::new(ExecutionEvent::Message {
            content: "ok".to_string(),
        })])
    }

    fn pool_with(engine: &ScriptedEngine, config: PoolConfig) -> Arc<WorkerPool> {
        WorkerPool::new(Arc::new(engine.clone()), config)
    }

    fn ws(name: &str) -> Workspace {
        Workspace::resolve(Path::new("/tmp/pool-tests"), name).unwrap()
    }

    #[tokio::test]
    async fn release_then_acquire_reuses_the_warm_worker() {
        let engine = engine();
        let pool = pool_with(&engine, PoolConfig::default());

        let first = pool.acquire(&ws("a")).await.unwrap();
        let first_id = first.worker_id();
        assert_eq!(pool.stats().active, 1);
        pool.release(&first);
        drop(first);

        let second = pool.acquire(&ws("a")).await.unwrap();
        assert_eq!(second.worker_id(), first_id);
        assert_eq!(engine.workers_spawned(), 1);
        assert_eq!(pool.info()[0].queries_processed, 1);
        assert!(pool.info()[0].is_active);
    }

    #[tokio::test]
    async fn busy_worker_is_not_handed_out_twice() {
        let engine = engine();
        let pool = pool_with(&engine, PoolConfig::default());

        let _held = pool.acquire(&ws("a")).await.unwrap();
        let err = pool.acquire(&ws("a")).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerBusy(key) if key == "a"));
        assert_eq!(engine.workers_spawned(), 1);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_runs_on_drop() {
        let pool = pool_with(&engine(), PoolConfig::default());

        let lease = pool.acquire(&ws("a")).await.unwrap();
        lease.release();
        lease.release();
        drop(lease);
        assert_eq!(pool.info()[0].queries_processed, 1);
        assert_eq!(pool.stats().idle, 1);

        {
            let _lease = pool.acquire(&ws("a")).await.unwrap();
        }
        assert_eq!(pool.info()[0].queries_processed, 2);
        assert_eq!(pool.info()[0].state, WorkerState::Idle);
    }

    #[tokio::test]
    async fn dead_worker_is_dropped_and_respawned() {
        let engine = engine();
        let pool = pool_with(&engine, PoolConfig::default());

        let lease = pool.acquire(&ws("a")).await.unwrap();
        engine.kill_workers();
        drop(lease);
        assert_eq!(pool.stats().total, 0);

        let lease = pool.acquire(&ws("a")).await.unwrap();
        assert!(lease.session().is_alive());
        assert_eq!(engine.workers_spawned(), 2);
    }

    async fn wait_for_shutdowns(engine: &ScriptedEngine, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.shutdowns() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retired worker should be shut down");
    }

    #[tokio::test]
    async fn worker_still_draining_on_release_is_retired() {
        let engine = ScriptedEngine::new(vec![ScriptStep::after(
            Duration::from_secs(30),
            ExecutionEvent::Message {
                content: "late".to_string(),
            },
        )])
        .with_cancel_delay(Duration::from_secs(60));
        let pool = pool_with(&engine, PoolConfig::default());

        let lease = pool.acquire(&ws("a")).await.unwrap();
        let cancel = CancellationToken::new();
        let request = RunRequest {
            request_id: "r1".to_string(),
            prompt: "p".to_string(),
            workspace: ws("a"),
            model: None,
        };
        let (_rx, handle) = lease.session().query(request, cancel.clone()).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();
        assert!(!lease.session().is_idle());

        lease.release();
        assert_eq!(pool.stats().total, 0);
        wait_for_shutdowns(&engine, 1).await;

        let next = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&ws("a")))
            .await
            .expect("a fresh worker should be spawned without waiting")
            .unwrap();
        assert!(next.session().is_idle());
        assert_eq!(engine.workers_spawned(), 2);
    }

    #[tokio::test]
    async fn acquire_does_not_wait_for_expired_workers_to_exit() {
        let engine = engine().with_shutdown_delay(Duration::from_secs(30));
        let pool = pool_with(
            &engine,
            PoolConfig {
                idle_timeout: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        );

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lease = tokio::time::timeout(Duration::from_millis(500), pool.acquire(&ws("b")))
            .await
            .expect("acquire should not wait for the evicted worker")
            .unwrap();
        assert_eq!(lease.workspace_key(), "b");
        let keys: Vec<String> = pool.info().into_iter().map(|i| i.workspace_key).collect();
        assert_eq!(keys, vec!["b".to_string()]);
        wait_for_shutdowns(&engine, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_past_the_threshold_are_evicted() {
        let engine = engine();
        let pool = pool_with(
            &engine,
            PoolConfig {
                idle_timeout: Duration::from_secs(60),
                ..PoolConfig::default()
            },
        );

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(pool.acquire(&ws("b")).await.unwrap());
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.evict_idle().await, 1);
        let info = pool.info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].workspace_key, "b");
        assert_eq!(engine.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_loop_runs_on_its_interval() {
        let engine = engine();
        let pool = pool_with(
            &engine,
            PoolConfig {
                idle_timeout: Duration::from_secs(10),
                eviction_interval: Duration::from_secs(5),
                ..PoolConfig::default()
            },
        );
        let handle = pool.spawn_eviction_loop();

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(pool.stats().total, 0);

        pool.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn age_is_kept_across_reuse() {
        let pool = pool_with(&engine(), PoolConfig::default());

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.info()[0].age_ms, 1000);
        assert_eq!(pool.info()[0].idle_ms, 1000);

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        let info = &pool.info()[0];
        assert_eq!(info.age_ms, 3000);
        assert_eq!(info.idle_ms, 2000);
        assert_eq!(info.queries_processed, 2);
    }

    #[tokio::test]
    async fn full_pool_evicts_least_recently_used_idle_worker() {
        let engine = engine();
        let pool = pool_with(
            &engine,
            PoolConfig {
                max_workers: 2,
                ..PoolConfig::default()
            },
        );

        drop(pool.acquire(&ws("a")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.acquire(&ws("b")).await.unwrap());
        let _c = pool.acquire(&ws("c")).await.unwrap();

        let keys: Vec<String> = pool.info().into_iter().map(|i| i.workspace_key).collect();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn full_pool_of_busy_workers_is_exhausted() {
        let pool = pool_with(
            &engine(),
            PoolConfig {
                max_workers: 1,
                ..PoolConfig::default()
            },
        );

        let _a = pool.acquire(&ws("a")).await.unwrap();
        let err = pool.acquire(&ws("b")).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(1)));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_slot_behind() {
        let engine = engine().failing_spawns();
        let pool = pool_with(&engine, PoolConfig::default());

        let err = pool.acquire(&ws("a")).await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_spawn_times_out() {
        let engine = engine().with_spawn_delay(Duration::from_secs(60));
        let pool = pool_with(
            &engine,
            PoolConfig {
                ready_timeout: Duration::from_secs(1),
                ..PoolConfig::default()
            },
        );

        let err = pool.acquire(&ws("a")).await.unwrap_err();
        assert!(matches!(err, PoolError::ReadyTimeout(..)));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_worker_is_not_assignable() {
        let engine = engine().with_spawn_delay(Duration::from_secs(1));
        let pool = pool_with(&engine, PoolConfig::default());

        let starting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&ws("a")).await.map(|l| l.worker_id()) })
        };
        while pool.stats().starting == 0 {
            tokio::task::yield_now().await;
        }
        let err = pool.acquire(&ws("a")).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerStarting(_)));

        starting.await.unwrap().unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn disabled_and_shut_down_pools_refuse() {
        let engine = engine();
        let disabled = pool_with(
            &engine,
            PoolConfig {
                enabled: false,
                ..PoolConfig::default()
            },
        );
        assert!(matches!(disabled.acquire(&ws("a")).await, Err(PoolError::Disabled)));

        let pool = pool_with(&engine, PoolConfig::default());
        drop(pool.acquire(&ws("a")).await.unwrap());
        pool.shutdown().await;
        assert_eq!(engine.shutdowns(), 1);
        assert_eq!(pool.stats().total, 0);
        assert!(matches!(pool.acquire(&ws("a")).await, Err(PoolError::ShuttingDown)));
    }
}
