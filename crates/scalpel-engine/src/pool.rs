//! Worker pool running independent dissection jobs

use crate::engine::{panic_message, CancellationToken, DissectionEngine};
use crate::node::DissectionNode;
use scalpel_core::JobError;
use scalpel_pipeline::Container;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of one job
pub type JobResult = Result<DissectionNode, JobError>;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Jobs dissected concurrently
    pub workers: usize,
    /// Per-job wall clock limit
    pub job_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            job_timeout: None,
        }
    }
}

/// Handle to a submitted job
pub struct JobHandle {
    id: Uuid,
    name: String,
    cancel: CancellationToken,
    receiver: oneshot::Receiver<JobResult>,
    result: Option<JobResult>,
}

impl JobHandle {
    fn resolved(name: String, result: JobResult) -> Self {
        let (_, receiver) = oneshot::channel();
        Self {
            id: Uuid::new_v4(),
            name,
            cancel: CancellationToken::new(),
            receiver,
            result: Some(result),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the job's root container
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative cancellation; takes effect before the next node
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Poll for the result without blocking
    pub fn try_result(&mut self) -> Option<&JobResult> {
        if self.result.is_none() {
            match self.receiver.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => self.result = Some(Err(JobError::PoolClosed)),
            }
        }
        self.result.as_ref()
    }

    /// Block until the job finishes
    ///
    /// Must not be called from inside an async runtime; use
    /// [`result`](Self::result) there.
    pub fn wait(self) -> JobResult {
        if let Some(result) = self.result {
            return result;
        }
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(JobError::PoolClosed))
    }

    /// Await the job's result
    pub async fn result(self) -> JobResult {
        if let Some(result) = self.result {
            return result;
        }
        self.receiver.await.unwrap_or(Err(JobError::PoolClosed))
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.result.is_some())
            .finish()
    }
}

/// Fixed-size pool of dissection workers
///
/// Owns its own runtime, so it is created, used and dropped from
/// synchronous code. Dropping the pool waits for running dissections and
/// closes the engine's database.
pub struct WorkerPool {
    runtime: Runtime,
    engine: Arc<DissectionEngine>,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool around an engine
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be started.
    pub fn new(engine: DissectionEngine, config: PoolConfig) -> std::io::Result<Self> {
        let workers = config.workers.max(1);
        info!(workers, timeout = ?config.job_timeout, "Starting worker pool");

        // Dissections run on blocking threads, one per permit; the async
        // workers only schedule and time them.
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("scalpel-worker")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(workers)),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            config: PoolConfig { workers, ..config },
            closed: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &DissectionEngine {
        &self.engine
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Submit one root container
    pub fn submit(&self, root: Container) -> JobHandle {
        let id = Uuid::new_v4();
        let name = root.name().to_string();
        let cancel = CancellationToken::new();
        let (sender, receiver) = oneshot::channel();

        debug!(job = %id, container = %name, "Submitting job");
        self.pending.fetch_add(1, Ordering::SeqCst);

        let job = Job {
            id,
            root,
            engine: self.engine.clone(),
            permits: self.permits.clone(),
            cancel: cancel.clone(),
            timeout: self.config.job_timeout,
        };
        let pending = self.pending.clone();
        let idle = self.idle.clone();

        self.runtime.spawn(async move {
            job.run(sender).await;
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });

        JobHandle {
            id,
            name,
            cancel,
            receiver,
            result: None,
        }
    }

    /// Open a file and submit it; open failures resolve as [`JobError::Open`]
    pub fn submit_path(&self, path: impl AsRef<Path>) -> JobHandle {
        let path = path.as_ref();
        match Container::open(path) {
            Ok(root) => self.submit(root),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "Failed to open input");
                JobHandle::resolved(
                    path.display().to_string(),
                    Err(JobError::Open {
                        path: path.to_path_buf(),
                        source,
                    }),
                )
            }
        }
    }

    /// Submit several root containers
    pub fn submit_batch<I>(&self, roots: I) -> Vec<JobHandle>
    where
        I: IntoIterator<Item = Container>,
    {
        roots.into_iter().map(|root| self.submit(root)).collect()
    }

    /// Jobs submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait for every submitted job, then close the database
    ///
    /// A job that timed out still counts until its dissection has actually
    /// stopped, so no record is written after the database is closed.
    pub fn shutdown(self) {
        info!(pending = self.pending(), "Shutting down worker pool");
        self.wait_idle();
        self.close_database();
    }

    fn wait_idle(&self) {
        let pending = self.pending.clone();
        let idle = self.idle.clone();
        self.runtime.block_on(async move {
            loop {
                let notified = idle.notified();
                if pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        });
    }

    fn close_database(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(database) = self.engine.database() {
            match database.close() {
                Ok(()) => info!(ledger = database.identify(), "Ledger closed"),
                Err(e) => warn!(ledger = database.identify(), error = %e, "Failed to close ledger"),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            // Cannot block here; the database is released with the last job.
            warn!(pending = self.pending(), "Worker pool dropped inside an async runtime");
            return;
        }
        self.wait_idle();
        self.close_database();
    }
}

struct Job {
    id: Uuid,
    root: Container,
    engine: Arc<DissectionEngine>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl Job {
    /// Run to completion, answering `sender` as soon as the outcome is known
    async fn run(self, sender: oneshot::Sender<JobResult>) {
        let Job {
            id,
            root,
            engine,
            permits,
            cancel,
            timeout,
        } = self;

        // The caller may have dropped its handle, so send results are ignored.
        let Ok(permit) = permits.acquire_owned().await else {
            let _ = sender.send(Err(JobError::PoolClosed));
            return;
        };
        if cancel.is_cancelled() {
            debug!(job = %id, "Job cancelled before start");
            let _ = sender.send(Err(JobError::Cancelled));
            return;
        }

        info!(job = %id, container = %root.name(), "Job started");
        let worker_cancel = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            // Held until the dissection actually stops, even after a timeout.
            let _permit = permit;
            engine.dissect_with(&root, &worker_cancel)
        });

        let Some(limit) = timeout else {
            let _ = sender.send(finish(id, task.await));
            return;
        };
        match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => {
                let _ = sender.send(finish(id, joined));
            }
            Err(_) => {
                cancel.cancel();
                warn!(job = %id, limit = ?limit, "Job timed out");
                let _ = sender.send(Err(JobError::TimedOut(limit)));
                // Stay pending until the dissection reaches a cancellation check.
                let _ = task.await;
                debug!(job = %id, "Timed-out dissection stopped");
            }
        }
    }
}

fn finish(id: Uuid, joined: Result<JobResult, JoinError>) -> JobResult {
    match joined {
        Ok(result) => {
            if let Ok(node) = &result {
                info!(job = %id, outcome = %node.outcome, nodes = node.count(), "Job finished");
            }
            result
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic().as_ref());
            error!(job = %id, panic = %message, "Job panicked");
            Err(JobError::Panicked(message))
        }
        Err(_) => Err(JobError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::{Confidence, DissectionOutput, Dissector, DissectorInfo};
    use crate::engine::EngineConfig;
    use crate::registry::DissectorRegistry;
    use scalpel_core::{
        DissectError, DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, Outcome,
        PersistenceError,
    };
    use std::io::Write;
    use std::time::Instant;
    use tempfile::NamedTempFile;

    struct Sleepy {
        info: DissectorInfo,
        delay: Duration,
    }

    impl Dissector for Sleepy {
        fn info(&self) -> &DissectorInfo {
            &self.info
        }

        fn matches(&self, container: &Container) -> Confidence {
            (container.len() > 0).into()
        }

        fn dissect(&self, container: &Container) -> Result<DissectionOutput, DissectError> {
            if container.read(0, 1)?[0] == 0xFF {
                panic!("poisoned input");
            }
            std::thread::sleep(self.delay);
            Ok(DissectionOutput::new())
        }
    }

    #[derive(Default)]
    struct Closable {
        closes: AtomicUsize,
        closed: AtomicBool,
        stores: AtomicUsize,
        stores_after_close: AtomicUsize,
    }

    impl DissectionDatabase for Closable {
        fn identify(&self) -> &str {
            "closable"
        }

        fn lookup_hash(&self, _: &Fingerprint) -> Result<Option<HashRecord>, PersistenceError> {
            Ok(None)
        }

        fn lookup_dissection(
            &self,
            _: &Fingerprint,
        ) -> Result<Option<DissectionRecord>, PersistenceError> {
            Ok(None)
        }

        fn store(&self, _: &Fingerprint, _: &DissectionRecord) -> Result<(), PersistenceError> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                self.stores_after_close.fetch_add(1, Ordering::SeqCst);
                return Err(PersistenceError::Closed);
            }
            Ok(())
        }

        fn store_hash(&self, _: &HashRecord) -> Result<(), PersistenceError> {
            Ok(())
        }

        fn close(&self) -> Result<(), PersistenceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(delay: Duration, config: PoolConfig) -> WorkerPool {
        let registry = DissectorRegistry::builder()
            .register(Sleepy {
                info: DissectorInfo::new("sleepy", "sleeps, then accepts"),
                delay,
            })
            .unwrap()
            .build();
        let engine = DissectionEngine::new(Arc::new(registry), EngineConfig::default());
        WorkerPool::new(engine, config).unwrap()
    }

    fn blob(tag: u8) -> Container {
        Container::from_bytes(format!("blob{tag}"), vec![tag; 16])
    }

    #[test]
    fn test_batch_completes() {
        let pool = pool(Duration::from_millis(5), PoolConfig { workers: 2, job_timeout: None });
        let handles = pool.submit_batch((1..=4).map(blob));

        let mut ids: Vec<Uuid> = handles.iter().map(JobHandle::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        for handle in handles {
            let node = handle.wait().unwrap();
            assert_eq!(node.outcome, Outcome::Ok);
        }
        pool.shutdown();
    }

    #[test]
    fn test_dissector_panic_does_not_fail_job() {
        let pool = pool(Duration::ZERO, PoolConfig::default());
        let panicking = pool.submit(blob(0xFF));
        let healthy = pool.submit(blob(1));

        let node = panicking.wait().unwrap();
        assert_eq!(node.outcome, Outcome::Failed);
        assert!(node.errors[0].contains("poisoned input"));
        assert_eq!(healthy.wait().unwrap().outcome, Outcome::Ok);
    }

    #[test]
    fn test_timeout_is_reported() {
        let config = PoolConfig {
            workers: 1,
            job_timeout: Some(Duration::from_millis(20)),
        };
        let pool = pool(Duration::from_millis(300), config);
        let result = pool.submit(blob(1)).wait();
        assert!(matches!(result, Err(JobError::TimedOut(_))));
    }

    #[test]
    fn test_shutdown_after_timeout_waits_for_running_dissection() {
        let database = Arc::new(Closable::default());
        let registry = DissectorRegistry::builder()
            .register(Sleepy {
                info: DissectorInfo::new("sleepy", "sleeps, then accepts"),
                delay: Duration::from_millis(200),
            })
            .unwrap()
            .build();
        let engine = DissectionEngine::new(Arc::new(registry), EngineConfig::default())
            .with_database(database.clone());
        let config = PoolConfig {
            workers: 1,
            job_timeout: Some(Duration::from_millis(20)),
        };
        let pool = WorkerPool::new(engine, config).unwrap();

        let result = pool.submit(blob(1)).wait();
        assert!(matches!(result, Err(JobError::TimedOut(_))));
        assert_eq!(pool.pending(), 1);
        assert_eq!(database.stores.load(Ordering::SeqCst), 0);

        pool.shutdown();
        assert_eq!(database.stores.load(Ordering::SeqCst), 1);
        assert_eq!(database.stores_after_close.load(Ordering::SeqCst), 0);
        assert_eq!(database.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runtime_threads_follow_workers() {
        let pool = pool(Duration::ZERO, PoolConfig { workers: 3, job_timeout: None });
        assert_eq!(pool.runtime.metrics().num_workers(), 3);
        assert_eq!(pool.config().workers, 3);
    }

    #[test]
    fn test_cancel_queued_job() {
        let pool = pool(Duration::from_millis(200), PoolConfig { workers: 1, job_timeout: None });
        let running = pool.submit(blob(1));
        // Let the first job take the only permit.
        std::thread::sleep(Duration::from_millis(50));
        let queued = pool.submit(blob(2));
        queued.cancel();

        assert!(matches!(queued.wait(), Err(JobError::Cancelled)));
        assert!(running.wait().is_ok());
    }

    #[test]
    fn test_try_result_polls() {
        let pool = pool(Duration::from_millis(20), PoolConfig::default());
        let mut handle = pool.submit(blob(3));

        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.try_result().is_none() {
            assert!(Instant::now() < deadline, "job never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(handle.try_result(), Some(Ok(_))));
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn test_async_result() {
        let pool = pool(Duration::ZERO, PoolConfig::default());
        let handle = pool.submit(blob(4));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let node = runtime.block_on(handle.result()).unwrap();
        assert_eq!(node.name, "blob4");
    }

    #[test]
    fn test_submit_path() {
        let pool = pool(Duration::ZERO, PoolConfig::default());

        let missing = pool.submit_path("/nonexistent/scalpel/input.img");
        assert!(matches!(missing.wait(), Err(JobError::Open { .. })));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 64]).unwrap();
        file.flush().unwrap();
        let node = pool.submit_path(file.path()).wait().unwrap();
        assert_eq!(node.length, 64);
    }

    #[test]
    fn test_shutdown_waits_and_closes_database_once() {
        let database = Arc::new(Closable::default());
        let registry = DissectorRegistry::builder()
            .register(Sleepy {
                info: DissectorInfo::new("sleepy", "sleeps, then accepts"),
                delay: Duration::from_millis(50),
            })
            .unwrap()
            .build();
        let engine = DissectionEngine::new(Arc::new(registry), EngineConfig::default())
            .with_database(database.clone());
        let pool = WorkerPool::new(engine, PoolConfig { workers: 2, job_timeout: None }).unwrap();

        let mut handles = pool.submit_batch((1..=3).map(blob));
        pool.shutdown();

        for handle in &mut handles {
            assert!(matches!(handle.try_result(), Some(Ok(_))));
        }
        assert_eq!(database.closes.load(Ordering::SeqCst), 1);
    }
}
