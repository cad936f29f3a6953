//! Dispatcher - moves tasks from the store into the worker pool.
//!
//! # Flow
//! 1. `start`: recover stuck tasks, start the pool, spawn poll and GC loops
//! 2. each poll tick: `claim_batch` -> `mark_processing` -> `submit`
//! 3. each job: handler -> `mark_completed` / `mark_failed`
//! 4. `stop`: stop the loops, then drain the pool

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::gc_loop::GcLoop;
use super::status::QueueCounts;
use crate::domain::{
    Failure, HandlerError, JobError, PoolError, StoreError, TaskId, TaskRecord, TaskType,
};
use crate::pool::{PoolState, WorkerPool};
use crate::ports::TaskStore;
use crate::typed::{HandlerRegistry, Task, TaskHandler};

/// `last_error` of a task marked Processing that the pool refused.
const SUBMIT_ABORTED: &str = "dispatcher shut down";

/// Tunables for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum concurrent handler executions.
    pub pool_size: usize,
    /// Jobs buffered between the poll loop and the workers.
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    /// Processing rows untouched for this long are presumed abandoned.
    pub stuck_threshold: Duration,
    pub retention_days: u32,
    /// Tasks claimed per poll tick.
    pub claim_batch_size: usize,
    /// Used by [`Dispatcher::enqueue`].
    pub default_max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            queue_capacity: crate::pool::DEFAULT_CAPACITY,
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60 * 60),
            stuck_threshold: Duration::from_secs(30 * 60),
            retention_days: 7,
            claim_batch_size: 1,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Owns the poll loop, the GC loop and the worker pool.
///
/// Built by [`DispatcherBuilder`](super::DispatcherBuilder).
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    loops: Mutex<LoopState>,
}

enum LoopState {
    Idle,
    Running(RunningLoops),
    Stopped,
}

struct RunningLoops {
    shutdown: watch::Sender<bool>,
    poll: JoinHandle<()>,
    gc: JoinHandle<()>,
}

struct DispatcherInner {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    pool: WorkerPool,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, PoolError> {
        let pool = WorkerPool::new(config.pool_size, config.queue_capacity)?;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                store,
                registry,
                pool,
                config,
            }),
            loops: Mutex::new(LoopState::Idle),
        })
    }

    /// Recover stuck tasks, start the pool, and spawn the background loops.
    ///
    /// A failed recovery is logged and startup continues; the rows remain
    /// Processing until the next start.
    pub async fn start(&self) -> Result<(), DispatchError> {
        if !matches!(*self.loop_state(), LoopState::Idle) {
            return Err(DispatchError::AlreadyStarted);
        }

        match self.inner.store.recover_stuck(self.inner.config.stuck_threshold).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "recovered stuck tasks"),
            Err(e) => error!(error = %e, "stuck task recovery failed"),
        }

        let mut state = self.loop_state();
        if !matches!(*state, LoopState::Idle) {
            return Err(DispatchError::AlreadyStarted);
        }
        self.inner.pool.start()?;

        let (shutdown, rx) = watch::channel(false);
        let poll = tokio::spawn(poll_loop(self.inner.clone(), rx.clone()));
        let gc = GcLoop::new(
            self.inner.store.clone(),
            self.inner.config.cleanup_interval,
            self.inner.config.retention_days,
        );
        let gc = tokio::spawn(gc.run(rx));
        *state = LoopState::Running(RunningLoops { shutdown, poll, gc });

        info!(
            workers = self.inner.config.pool_size,
            poll_interval = ?self.inner.config.poll_interval,
            handlers = self.inner.registry.len(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Run one poll cycle now. Returns the number of tasks submitted.
    ///
    /// The poll loop calls this on every tick; it is public so callers can
    /// drive the dispatcher without waiting for the interval.
    pub async fn tick(&self) -> Result<usize, DispatchError> {
        self.inner.tick().await
    }

    /// Stop polling, then wait for every buffered and in-flight job.
    ///
    /// Idempotent. A dispatcher cannot be restarted.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.loop_state(), LoopState::Stopped);
        if let LoopState::Running(loops) = previous {
            // Receivers may already be gone if a loop exited on its own.
            let _ = loops.shutdown.send(true);
            for (name, handle) in [("poll", loops.poll), ("gc", loops.gc)] {
                if let Err(e) = handle.await {
                    error!(loop_name = name, error = %e, "background loop ended abnormally");
                }
            }
        }
        self.inner.pool.stop().await;
        info!("dispatcher stopped");
    }

    /// Enqueue with the configured default attempt budget.
    pub async fn enqueue(
        &self,
        task_type: impl Into<TaskType>,
        payload: &[u8],
    ) -> Result<TaskId, StoreError> {
        let max_attempts = self.inner.config.default_max_attempts;
        self.enqueue_with(task_type, payload, max_attempts).await
    }

    pub async fn enqueue_with(
        &self,
        task_type: impl Into<TaskType>,
        payload: &[u8],
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        let task_type = task_type.into();
        let id = self.inner.store.enqueue(&task_type, payload, max_attempts).await?;
        debug!(task_id = %id, task_type = %task_type, max_attempts, "task enqueued");
        Ok(id)
    }

    /// Serialize `task` as JSON and enqueue it under `T::TYPE`.
    pub async fn enqueue_typed<T: Task>(&self, task: &T) -> Result<TaskId, StoreError> {
        let payload = serde_json::to_vec(task)?;
        self.enqueue(T::TYPE, &payload).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.inner.store.counts_by_status().await
    }

    /// Workers currently executing a handler. Informational only.
    pub fn active_workers(&self) -> usize {
        self.inner.pool.active_workers()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    fn loop_state(&self) -> MutexGuard<'_, LoopState> {
        self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DispatcherInner {
    async fn tick(&self) -> Result<usize, DispatchError> {
        match self.pool.state() {
            PoolState::Running => {}
            PoolState::Idle => return Err(PoolError::NotStarted.into()),
            PoolState::Stopped => return Err(PoolError::ShutDown.into()),
        }

        let batch = self.store.claim_batch(self.config.claim_batch_size).await?;
        let mut submitted = 0;
        for record in batch {
            if !self.store.mark_processing(record.id).await? {
                debug!(task_id = %record.id, "task claimed elsewhere; skipping");
                continue;
            }
            let id = record.id;
            let handler = self.registry.get(&record.task_type);
            let job = TaskJob::new(record, self.store.clone(), handler);
            if let Err(e) = self.pool.submit(job.run()).await {
                warn!(task_id = %id, error = %e, "could not submit claimed task");
                // Release the row now rather than waiting for stuck recovery.
                if let Err(store_err) = self
                    .store
                    .mark_failed(id, Failure::retryable(SUBMIT_ABORTED))
                    .await
                {
                    error!(task_id = %id, error = %store_err, "could not release claimed task");
                }
                return Err(e.into());
            }
            submitted += 1;
        }
        Ok(submitted)
    }
}

async fn poll_loop(inner: Arc<DispatcherInner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.poll_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match inner.tick().await {
                    Ok(0) => {}
                    Ok(submitted) => debug!(submitted, "poll tick"),
                    Err(e) => error!(error = %e, "poll tick failed"),
                }
            }
        }
    }
    debug!("poll loop stopped");
}

/// Everything one attempt needs, captured at claim time.
struct TaskJob {
    store: Arc<dyn TaskStore>,
    handler: Option<Arc<dyn TaskHandler>>,
    id: TaskId,
    task_type: TaskType,
    payload: Vec<u8>,
    attempt: u32,
    max_attempts: u32,
}

impl TaskJob {
    fn new(
        record: TaskRecord,
        store: Arc<dyn TaskStore>,
        handler: Option<Arc<dyn TaskHandler>>,
    ) -> Self {
        let TaskRecord {
            id,
            task_type,
            payload,
            attempts,
            max_attempts,
            ..
        } = record;
        Self {
            store,
            handler,
            id,
            task_type,
            payload,
            attempt: attempts + 1,
            max_attempts,
        }
    }

    async fn run(self) -> Result<(), JobError> {
        debug!(
            task_id = %self.id,
            task_type = %self.task_type,
            attempt = self.attempt,
            "task started"
        );

        match self.execute().await {
            Ok(()) => {
                self.store.mark_completed(self.id).await?;
                info!(
                    task_id = %self.id,
                    task_type = %self.task_type,
                    attempt = self.attempt,
                    "task completed"
                );
                Ok(())
            }
            Err(err) => {
                let failure = if err.is_retryable() {
                    Failure::retryable(err.to_string())
                } else {
                    Failure::terminal(err.to_string())
                };
                let exhausted = failure.terminal || self.attempt >= self.max_attempts;
                self.store.mark_failed(self.id, failure).await?;
                if exhausted {
                    error!(
                        task_id = %self.id,
                        task_type = %self.task_type,
                        attempt = self.attempt,
                        error = %err,
                        "task failed permanently"
                    );
                } else {
                    warn!(
                        task_id = %self.id,
                        task_type = %self.task_type,
                        attempt = self.attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "task failed; will retry"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Run the handler in its own task so a panic becomes a retryable failure.
    async fn execute(&self) -> Result<(), HandlerError> {
        let Some(handler) = self.handler.clone() else {
            return Err(HandlerError::NotFound(self.task_type.clone()));
        };
        let payload = self.payload.clone();
        match tokio::spawn(async move { handler.handle(&payload).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Failed("handler panicked".to_string())),
            Err(e) => Err(HandlerError::Failed(format!("handler aborted: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::DispatcherBuilder;
    use crate::domain::TaskStatus;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use crate::typed::handler_fn;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn manual_config() -> DispatcherConfig {
        DispatcherConfig {
            pool_size: 2,
            poll_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        }
    }

    fn ok_handler() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_payload: Vec<u8>| async { Ok::<(), HandlerError>(()) }))
    }

    /// Fails the first `failures` calls, then succeeds.
    fn flaky_handler(failures: u32) -> (Arc<dyn TaskHandler>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_payload: Vec<u8>| {
            let calls = counter.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(HandlerError::new("provider rejected upload"))
                } else {
                    Ok(())
                }
            }
        });
        (Arc::new(handler), calls)
    }

    async fn wait_for(
        store: &Arc<dyn TaskStore>,
        id: TaskId,
        done: impl Fn(&TaskRecord) -> bool,
    ) -> TaskRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(task) = store.get(id).await.unwrap() {
                    if done(&task) {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not reach the expected state")
    }

    async fn started(store: Arc<dyn TaskStore>, handler: Arc<dyn TaskHandler>) -> Dispatcher {
        let dispatcher = DispatcherBuilder::new(store)
            .config(manual_config())
            .register("upload-movie", handler)
            .unwrap()
            .build()
            .unwrap();
        dispatcher.start().await.unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn test_tick_runs_task_to_completion() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = started(store.clone(), ok_handler()).await;

        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();
        assert_eq!(dispatcher.tick().await.unwrap(), 1);

        let task = wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.attempts, 1);
        assert!(task.processed_at.is_some());
        assert_eq!(dispatcher.tick().await.unwrap(), 0);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_tick_before_start_claims_nothing() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = DispatcherBuilder::new(store.clone())
            .config(manual_config())
            .build()
            .unwrap();
        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();

        let err = dispatcher.tick().await.unwrap_err();
        assert!(matches!(err, DispatchError::Pool(PoolError::NotStarted)));
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = started(store, ok_handler()).await;
        assert!(matches!(
            dispatcher.start().await,
            Err(DispatchError::AlreadyStarted)
        ));
        dispatcher.stop().await;
        assert!(matches!(
            dispatcher.start().await,
            Err(DispatchError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_without_retry() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = started(store.clone(), ok_handler()).await;

        let id = dispatcher.enqueue("upload-show", b"{}").await.unwrap();
        dispatcher.tick().await.unwrap();

        let task = wait_for(&store, id, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(task.attempts, 1);
        assert!(task.is_exhausted());
        assert!(task.last_error.unwrap().contains("upload-show"));
        assert_eq!(dispatcher.tick().await.unwrap(), 0);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (handler, calls) = flaky_handler(2);
        let dispatcher = started(store.clone(), handler).await;
        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();

        for attempt in 1..=2 {
            assert_eq!(dispatcher.tick().await.unwrap(), 1);
            let task = wait_for(&store, id, |t| {
                t.status == TaskStatus::Failed && t.attempts == attempt
            })
            .await;
            assert_eq!(task.last_error.as_deref(), Some("provider rejected upload"));
        }

        assert_eq!(dispatcher.tick().await.unwrap(), 1);
        let task = wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (handler, calls) = flaky_handler(u32::MAX);
        let dispatcher = started(store.clone(), handler).await;
        let id = dispatcher.enqueue_with("upload-movie", b"{}", 2).await.unwrap();

        for attempt in 1..=2 {
            dispatcher.tick().await.unwrap();
            wait_for(&store, id, |t| {
                t.status == TaskStatus::Failed && t.attempts == attempt
            })
            .await;
        }

        assert_eq!(dispatcher.tick().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let counts = dispatcher.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
        dispatcher.stop().await;
        assert_eq!(dispatcher.pool().failed_jobs(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let panicked = Arc::new(AtomicBool::new(false));
        let flag = panicked.clone();
        let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn(move |_payload: Vec<u8>| {
            let first = !flag.swap(true, Ordering::SeqCst);
            async move {
                if first {
                    panic!("decoder blew up");
                }
                Ok::<(), HandlerError>(())
            }
        }));
        let dispatcher = started(store.clone(), handler).await;
        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();

        dispatcher.tick().await.unwrap();
        let task = wait_for(&store, id, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(task.last_error.as_deref(), Some("handler panicked"));
        assert!(task.is_claimable());

        dispatcher.tick().await.unwrap();
        wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_batch_claims_up_to_batch_size() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = DispatcherBuilder::new(store.clone())
            .config(DispatcherConfig {
                claim_batch_size: 3,
                ..manual_config()
            })
            .register("upload-movie", ok_handler())
            .unwrap()
            .build()
            .unwrap();
        dispatcher.start().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(dispatcher.enqueue("upload-movie", b"{}").await.unwrap());
        }
        assert_eq!(dispatcher.tick().await.unwrap(), 3);
        assert_eq!(dispatcher.tick().await.unwrap(), 2);
        for id in ids {
            wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        }
        dispatcher.stop().await;
    }

    #[derive(Serialize, Deserialize)]
    struct Publish {
        slug: String,
    }

    impl Task for Publish {
        const TYPE: &'static str = "publish-cms";
    }

    struct PublishHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl crate::typed::Handler<Publish> for PublishHandler {
        async fn handle(&self, task: Publish) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(task.slug);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_typed_enqueue_reaches_typed_handler() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = DispatcherBuilder::new(store.clone())
            .config(manual_config())
            .register_typed::<Publish, _>(PublishHandler { seen: seen.clone() })
            .unwrap()
            .build()
            .unwrap();
        dispatcher.start().await.unwrap();

        let good = dispatcher
            .enqueue_typed(&Publish {
                slug: "dune-part-two".to_string(),
            })
            .await
            .unwrap();
        let bad = dispatcher.enqueue(Publish::TYPE, b"not json").await.unwrap();
        dispatcher.tick().await.unwrap();
        dispatcher.tick().await.unwrap();

        wait_for(&store, good, |t| t.status == TaskStatus::Completed).await;
        let rejected = wait_for(&store, bad, |t| t.status == TaskStatus::Failed).await;
        assert!(rejected.is_exhausted());
        assert_eq!(*seen.lock().unwrap(), vec!["dune-part-two".to_string()]);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_recovers_stuck_tasks() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let id = store.enqueue(&TaskType::new("upload-movie"), b"{}", 3).await.unwrap();
        assert!(store.mark_processing(id).await.unwrap());
        clock.advance(chrono::Duration::minutes(31));

        let dispatcher = started(store.clone(), ok_handler()).await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);

        dispatcher.tick().await.unwrap();
        let task = wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.attempts, 2);
        dispatcher.stop().await;
    }

    /// Lets a test hold `tick` between `mark_processing` and `submit`.
    #[derive(Default)]
    struct MarkGate {
        marked: Notify,
        resume: Notify,
    }

    /// Delegates to an in-memory store, optionally failing the first
    /// `claim_batch` or pausing after each successful `mark_processing`.
    struct FlakyStore {
        inner: InMemoryTaskStore,
        fail_next_claim: AtomicBool,
        mark_gate: Option<Arc<MarkGate>>,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn enqueue(
            &self,
            task_type: &TaskType,
            payload: &[u8],
            max_attempts: u32,
        ) -> Result<TaskId, StoreError> {
            self.inner.enqueue(task_type, payload, max_attempts).await
        }

        async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
            if self.fail_next_claim.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.claim_batch(limit).await
        }

        async fn mark_processing(&self, id: TaskId) -> Result<bool, StoreError> {
            let won = self.inner.mark_processing(id).await?;
            if let (true, Some(gate)) = (won, &self.mark_gate) {
                gate.marked.notify_one();
                gate.resume.notified().await;
            }
            Ok(won)
        }

        async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(&self, id: TaskId, failure: Failure) -> Result<(), StoreError> {
            self.inner.mark_failed(id, failure).await
        }

        async fn recover_stuck(&self, threshold: Duration) -> Result<u64, StoreError> {
            self.inner.recover_stuck(threshold).await
        }

        async fn cleanup(&self, retention_days: u32) -> Result<u64, StoreError> {
            self.inner.cleanup(retention_days).await
        }

        async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
            self.inner.list_unfinished().await
        }

        async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts_by_status().await
        }
    }

    #[tokio::test]
    async fn test_store_error_fails_only_that_tick() {
        let store: Arc<dyn TaskStore> = Arc::new(FlakyStore {
            inner: InMemoryTaskStore::new(),
            fail_next_claim: AtomicBool::new(true),
            mark_gate: None,
        });
        let dispatcher = started(store.clone(), ok_handler()).await;
        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();

        assert!(matches!(
            dispatcher.tick().await,
            Err(DispatchError::Store(StoreError::Database(_)))
        ));
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Pending);

        assert_eq!(dispatcher.tick().await.unwrap(), 1);
        wait_for(&store, id, |t| t.status == TaskStatus::Completed).await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_task_refused_by_stopped_pool_stays_claimable() {
        let gate = Arc::new(MarkGate::default());
        let store: Arc<dyn TaskStore> = Arc::new(FlakyStore {
            inner: InMemoryTaskStore::new(),
            fail_next_claim: AtomicBool::new(false),
            mark_gate: Some(gate.clone()),
        });
        let dispatcher = Arc::new(started(store.clone(), ok_handler()).await);
        let id = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();

        let ticking = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.tick().await }
        });
        gate.marked.notified().await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Processing);

        dispatcher.stop().await;
        gate.resume.notify_one();
        let result = ticking.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Pool(PoolError::ShutDown))));

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some(SUBMIT_ABORTED));
        assert_eq!(task.attempts, 1);
        assert!(task.is_claimable());
    }

    #[tokio::test]
    async fn test_poll_loop_drives_tasks_until_stop() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = DispatcherBuilder::new(store.clone())
            .config(DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                ..manual_config()
            })
            .register("upload-movie", ok_handler())
            .unwrap()
            .build()
            .unwrap();
        dispatcher.start().await.unwrap();

        let first = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();
        let second = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();
        wait_for(&store, first, |t| t.status == TaskStatus::Completed).await;
        wait_for(&store, second, |t| t.status == TaskStatus::Completed).await;

        dispatcher.stop().await;
        dispatcher.stop().await;
        assert_eq!(dispatcher.pool().state(), PoolState::Stopped);

        let late = dispatcher.enqueue("upload-movie", b"{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get(late).await.unwrap().unwrap().status, TaskStatus::Pending);
    }
}
