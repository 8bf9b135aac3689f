// crates/resilience/src/pool.rs
//! Elastic worker pool for deadline-bounded operations
//!
//! Deadline-bounded work never runs on the caller's thread, so the caller
//! can stop waiting the moment its deadline passes. Workers are spawned on
//! demand when every idle worker is already spoken for, and retire after
//! sitting idle for `keep_alive`.

use crate::error::{ResilienceError, ResilienceResult};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

static SHARED_POOL: Lazy<WorkerPool> = Lazy::new(WorkerPool::new);

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on live workers
    max_workers: usize,
    /// How long an idle worker waits for a job before exiting
    keep_alive: Duration,
    /// Thread name prefix
    thread_name: String,
    /// Worker stack size, platform default when unset
    stack_size: Option<usize>,
}

impl WorkerPoolConfig {
    /// Creates a configuration for an unbounded, elastic pool
    pub fn new() -> Self {
        Self {
            max_workers: usize::MAX,
            keep_alive: Duration::from_secs(60),
            thread_name: "holdfast-worker".to_string(),
            stack_size: None,
        }
    }

    /// Caps the number of live workers
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Sets how long idle workers are kept
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets the stack size of worker threads
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct PoolInner {
    config: WorkerPoolConfig,
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    live: AtomicUsize,
    idle: AtomicUsize,
    /// Jobs submitted but not yet taken by a worker
    queued: AtomicUsize,
    spawned: AtomicUsize,
}

impl PoolInner {
    fn reserve_worker(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.config.max_workers).then_some(live + 1)
            })
            .is_ok()
    }
}

/// Handle to an elastic pool of worker threads
///
/// Clones share the same workers.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the default configuration
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    /// Creates a pool with a custom configuration
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        let (job_tx, job_rx) = unbounded();
        Self {
            inner: Arc::new(PoolInner {
                config,
                job_tx,
                job_rx,
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide pool used when none is injected
    pub fn shared() -> Self {
        SHARED_POOL.clone()
    }

    /// Hands a job to an idle worker, or to a freshly spawned one
    ///
    /// Jobs only wait behind other jobs once the pool is at `max_workers`.
    /// On error the job has been dropped without running.
    pub fn execute<F>(&self, job: F) -> ResilienceResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);

        // Count the job before reading the idle workers; a retiring worker
        // leaves the idle count before reading this counter
        let queued = self.inner.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if queued > self.inner.idle.load(Ordering::SeqCst) && self.inner.reserve_worker() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            return self.spawn_worker(job);
        }

        self.inner.job_tx.send(job).map_err(|_| {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            ResilienceError::WorkerLost
        })
    }

    /// Number of live worker threads
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of workers waiting for a job
    pub fn idle_workers(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self, first_job: Job) -> ResilienceResult<()> {
        let id = self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}", self.inner.config.thread_name, id);
        let inner = Arc::clone(&self.inner);

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(bytes) = self.inner.config.stack_size {
            builder = builder.stack_size(bytes);
        }
        let spawned = builder.spawn(move || worker_loop(inner, first_job));

        match spawned {
            Ok(_) => {
                log::debug!("Spawned worker {}", name);
                Ok(())
            }
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::SeqCst);
                Err(ResilienceError::WorkerSpawn(e))
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::warn!("Job panicked on worker thread");
    }
}

fn worker_loop(inner: Arc<PoolInner>, first_job: Job) {
    run_job(first_job);

    loop {
        inner.idle.fetch_add(1, Ordering::SeqCst);

        match inner.job_rx.recv_timeout(inner.config.keep_alive) {
            Ok(job) => {
                // Leave the idle count before the queued count
                inner.idle.fetch_sub(1, Ordering::SeqCst);
                inner.queued.fetch_sub(1, Ordering::SeqCst);
                run_job(job);
            }
            Err(RecvTimeoutError::Timeout) => {
                inner.idle.fetch_sub(1, Ordering::SeqCst);
                inner.live.fetch_sub(1, Ordering::SeqCst);

                if inner.queued.load(Ordering::SeqCst) == 0 {
                    log::debug!("Retiring idle worker");
                    return;
                }

                // A job was counted while retiring; at capacity the other
                // live workers take it
                if !inner.reserve_worker() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.idle.fetch_sub(1, Ordering::SeqCst);
                inner.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_runs_job_off_caller_thread() {
        let pool = WorkerPool::new();
        let (tx, rx) = bounded(1);
        let caller = thread::current().id();

        pool.execute(move || {
            let _ = tx.send(thread::current().id());
        })
        .expect("job should be queued");

        let worker = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("job should run");
        assert_ne!(worker, caller);
    }

    #[test]
    fn test_names_worker_threads() {
        let pool = WorkerPool::with_config(WorkerPoolConfig::new().with_thread_name("fetcher"));
        let (tx, rx) = bounded(1);

        pool.execute(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .expect("job should be queued");

        let name = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("job should run");
        assert!(name.is_some_and(|n| n.starts_with("fetcher-")));
    }

    #[test]
    fn test_grows_to_demand() {
        let pool = WorkerPool::new();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded(3);

        for _ in 0..3 {
            let release_rx = release_rx.clone();
            let started_tx = started_tx.clone();
            pool.execute(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            })
            .expect("job should be queued");
        }

        for _ in 0..3 {
            started_rx
                .recv_timeout(Duration::from_secs(1))
                .expect("all jobs should run concurrently");
        }
        assert!(pool.live_workers() >= 3);
        drop(release_tx);
    }

    fn wait_for_idle(pool: &WorkerPool, idle: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while pool.idle_workers() < idle {
            assert!(std::time::Instant::now() < deadline, "workers never went idle");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_back_to_back_jobs_do_not_share_idle_worker() {
        let pool = WorkerPool::new();
        let (warm_tx, warm_rx) = bounded(1);
        pool.execute(move || {
            let _ = warm_tx.send(());
        })
        .expect("job should be queued");
        warm_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("warm-up job should run");
        wait_for_idle(&pool, 1);

        for _ in 0..20 {
            let (release_tx, release_rx) = bounded::<()>(0);
            let (done_tx, done_rx) = bounded(1);

            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_millis(300));
            })
            .expect("long job should be queued");
            pool.execute(move || {
                let _ = done_tx.send(());
            })
            .expect("short job should be queued");

            assert!(
                done_rx.recv_timeout(Duration::from_millis(100)).is_ok(),
                "short job waited behind the long one"
            );
            drop(release_tx);
        }
    }

    #[test]
    fn test_single_worker_runs_jobs_in_order() {
        let pool = WorkerPool::with_config(WorkerPoolConfig::new().with_max_workers(1));
        let (tx, rx) = unbounded();

        for i in 0..5 {
            let tx = tx.clone();
            pool.execute(move || {
                let _ = tx.send(i);
            })
            .expect("job should be queued");
        }

        let order: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).expect("job should run"))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.live_workers(), 1);
    }

    #[test]
    fn test_idle_workers_are_reclaimed() {
        let pool = WorkerPool::with_config(
            WorkerPoolConfig::new().with_keep_alive(Duration::from_millis(20)),
        );
        let (tx, rx) = bounded(1);

        pool.execute(move || {
            let _ = tx.send(());
        })
        .expect("job should be queued");
        rx.recv_timeout(Duration::from_secs(1))
            .expect("job should run");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.idle_workers(), 0);
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let pool = WorkerPool::with_config(WorkerPoolConfig::new().with_max_workers(1));
        pool.execute(|| panic!("boom")).expect("job should be queued");

        let (tx, rx) = bounded(1);
        pool.execute(move || {
            let _ = tx.send(7);
        })
        .expect("job should be queued");

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).ok(), Some(7));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_failed_spawn_drops_job() {
        let pool = WorkerPool::with_config(WorkerPoolConfig::new().with_stack_size(1 << 62));
        let (tx, rx) = bounded::<()>(1);

        let result = pool.execute(move || {
            let _ = tx.send(());
        });

        assert!(matches!(result, Err(ResilienceError::WorkerSpawn(_))));
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.inner.queued.load(Ordering::SeqCst), 0);
        // The job was dropped rather than left behind in the queue
        assert!(pool.inner.job_rx.is_empty());
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_shared_pool_is_shared() {
        let a = WorkerPool::shared();
        let b = WorkerPool::shared();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
