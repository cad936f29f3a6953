//! Bounded worker pool.
//!
//! `size` long-lived executors pull jobs from one bounded channel, so at most
//! `size` jobs run at once and at most `capacity` wait in the buffer. When the
//! buffer is full, `submit` waits: that is the pool's backpressure.
//!
//! The pool does not retry. A job's result is logged and counted, nothing
//! more; retry policy belongs to whoever builds the jobs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{JobError, PoolError};

/// Default job buffer size.
pub const DEFAULT_CAPACITY: usize = 100;

/// A unit of work: an inert future that does nothing until a worker polls it.
pub type Job = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'static>>;

/// Pool lifecycle: Idle -> Running -> Stopped. A stopped pool stays stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Stopped,
}

#[derive(Default)]
struct PoolStats {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Lifecycle {
    state: PoolState,
    sender: Option<mpsc::Sender<Job>>,
    joins: Vec<JoinHandle<()>>,
}

/// Worker pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    capacity: usize,
    lifecycle: Arc<Mutex<Lifecycle>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(size: usize, capacity: usize) -> Result<Self, PoolError> {
        if size == 0 || capacity == 0 {
            return Err(PoolError::InvalidSize { size, capacity });
        }
        Ok(Self {
            size,
            capacity,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: PoolState::Idle,
                sender: None,
                joins: Vec::new(),
            })),
            stats: Arc::new(PoolStats::default()),
        })
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn exactly `size` workers. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != PoolState::Idle {
            return Err(PoolError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel::<Job>(self.capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        lifecycle.joins = (0..self.size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let stats = Arc::clone(&self.stats);
                let size = self.size;
                tokio::spawn(async move { worker_loop(worker_id, size, rx, stats).await })
            })
            .collect();
        lifecycle.sender = Some(tx);
        lifecycle.state = PoolState::Running;

        info!(workers = self.size, capacity = self.capacity, "worker pool started");
        Ok(())
    }

    /// Queue a job, waiting while the buffer is full.
    ///
    /// Callers must tolerate the wait. Fails fast with `NotStarted` /
    /// `ShutDown` outside the Running state.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let sender = {
            let lifecycle = self.lifecycle();
            match lifecycle.state {
                PoolState::Idle => return Err(PoolError::NotStarted),
                PoolState::Stopped => return Err(PoolError::ShutDown),
                PoolState::Running => lifecycle.sender.clone().ok_or(PoolError::ShutDown)?,
            }
        };
        // A send already waiting when `stop` runs keeps the channel open until
        // it lands, so the job is drained rather than dropped.
        sender
            .send(Box::pin(job))
            .await
            .map_err(|_| PoolError::ShutDown)
    }

    /// Close the channel and wait until every buffered and in-flight job has
    /// finished. Idempotent; only the first call waits for the drain.
    pub async fn stop(&self) {
        let joins = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == PoolState::Stopped {
                return;
            }
            lifecycle.state = PoolState::Stopped;
            lifecycle.sender = None;
            std::mem::take(&mut lifecycle.joins)
        };

        for join in joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!(
            completed = self.completed_jobs(),
            failed = self.failed_jobs(),
            "worker pool stopped"
        );
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle().state
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently executing a job. Informational only.
    pub fn active_workers(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn completed_jobs(&self) -> u64 {
        self.stats.completed.load(Ordering::SeqCst)
    }

    /// Jobs that returned an error or panicked.
    pub fn failed_jobs(&self) -> u64 {
        self.stats.failed.load(Ordering::SeqCst)
    }
}

async fn worker_loop(
    worker_id: usize,
    size: usize,
    jobs: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    stats: Arc<PoolStats>,
) {
    debug!(worker_id, "worker started");

    loop {
        // The receiver lock is released before the job runs.
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(worker_id, active, size, "job started");

        // Own task per job: a panic comes back as a JoinError instead of
        // taking the worker down with it.
        match tokio::spawn(job).await {
            Ok(Ok(())) => {
                stats.completed.fetch_add(1, Ordering::SeqCst);
                debug!(worker_id, "job finished");
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker_id, error = %e, "job failed");
            }
            Err(e) if e.is_panic() => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                error!(worker_id, "job panicked");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker_id, error = %e, "job cancelled");
            }
        }

        stats.active.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
        reported_peak: AtomicUsize,
    }

    impl Probe {
        fn enter(&self) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        /// Record what the pool itself reports as active.
        fn sample(&self, pool: &WorkerPool) {
            self.reported_peak.fetch_max(pool.active_workers(), Ordering::SeqCst);
        }

        fn exit(&self) {
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_zero_size_is_rejected() {
        assert_eq!(
            WorkerPool::new(0, 10).err(),
            Some(PoolError::InvalidSize { size: 0, capacity: 10 })
        );
        assert!(WorkerPool::new(1, 0).is_err());
    }

    #[tokio::test]
    async fn test_submit_before_start_fails() {
        let pool = WorkerPool::new(2, 4).unwrap();
        let err = pool.submit(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, PoolError::NotStarted);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pool = WorkerPool::new(1, 1).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));
        pool.stop().await;
        assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails_fast() {
        let pool = WorkerPool::new(2, 4).unwrap();
        pool.start().unwrap();
        pool.stop().await;
        assert_eq!(pool.state(), PoolState::Stopped);
        let err = pool.submit(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, PoolError::ShutDown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_runs_more_than_size_jobs() {
        let pool = WorkerPool::new(3, 100).unwrap();
        pool.start().unwrap();
        let probe = Arc::new(Probe::default());

        for _ in 0..20 {
            let probe = Arc::clone(&probe);
            let observed = pool.clone();
            pool.submit(async move {
                probe.enter();
                probe.sample(&observed);
                tokio::time::sleep(Duration::from_millis(10)).await;
                probe.sample(&observed);
                probe.exit();
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.stop().await;

        assert_eq!(probe.finished.load(Ordering::SeqCst), 20);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        let reported = probe.reported_peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&reported), "active_workers peaked at {reported}");
        assert_eq!(pool.completed_jobs(), 20);
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_drains_buffered_and_in_flight_jobs() {
        let size = 2;
        let buffered = 5;
        let pool = WorkerPool::new(size, 10).unwrap();
        pool.start().unwrap();

        let release = Arc::new(Notify::new());
        let probe = Arc::new(Probe::default());

        // `size` jobs block in flight, `buffered` wait behind them.
        for _ in 0..(size + buffered) {
            let probe = Arc::clone(&probe);
            let release = Arc::clone(&release);
            pool.submit(async move {
                probe.enter();
                release.notified().await;
                probe.exit();
                Ok(())
            })
            .await
            .unwrap();
        }

        while pool.active_workers() < size {
            tokio::task::yield_now().await;
        }

        let stopper = tokio::spawn({
            let pool = pool.clone();
            async move { pool.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopper.is_finished(), "stop returned before the drain");

        // Keep releasing until everything has run.
        while probe.finished.load(Ordering::SeqCst) < size + buffered {
            release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stopper.await.unwrap();

        assert_eq!(probe.finished.load(Ordering::SeqCst), size + buffered);
        assert_eq!(pool.completed_jobs(), (size + buffered) as u64);
    }

    async fn explode() -> Result<(), JobError> {
        panic!("upload client exploded")
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 4).unwrap();
        pool.start().unwrap();
        let probe = Arc::new(Probe::default());

        pool.submit(explode()).await.unwrap();
        pool.submit(async { Err(JobError::new("provider rejected file")) })
            .await
            .unwrap();
        {
            let probe = Arc::clone(&probe);
            pool.submit(async move {
                probe.enter();
                probe.exit();
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.stop().await;

        assert_eq!(probe.finished.load(Ordering::SeqCst), 1);
        assert_eq!(pool.failed_jobs(), 2);
        assert_eq!(pool.completed_jobs(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_buffer_blocks_submit() {
        let pool = WorkerPool::new(1, 1).unwrap();
        pool.start().unwrap();
        let release = Arc::new(Notify::new());

        let blocker = |release: Arc<Notify>| async move {
            release.notified().await;
            Ok(())
        };
        pool.submit(blocker(Arc::clone(&release))).await.unwrap();
        while pool.active_workers() < 1 {
            tokio::task::yield_now().await;
        }
        // Fills the single buffer slot.
        pool.submit(blocker(Arc::clone(&release))).await.unwrap();

        let third = pool.submit(async { Ok(()) });
        let blocked = tokio::time::timeout(Duration::from_millis(50), third).await;
        assert!(blocked.is_err(), "submit should wait while the buffer is full");

        let pool_for_stop = pool.clone();
        let stopper = tokio::spawn(async move { pool_for_stop.stop().await });
        while pool.completed_jobs() < 2 {
            release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stopper.await.unwrap();
    }
}
