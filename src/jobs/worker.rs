//! Worker pools executing the jobs delivered by the broker poll loops.
//!
//! One pool serves one worker type. The pool owns nothing but its slots:
//! the feed channel is created and written to by the broker, and the
//! execution engine behind [`JobExecutor`] is a black box with its own
//! failure semantics. Retry policy belongs to that engine, not here.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::job::Job;
use super::limiter;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was started twice.
    #[error("pool is already running")]
    AlreadyRunning,

    /// The worker type name cannot form valid queue keys.
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    /// A slot task panicked.
    #[error("worker slot panicked: {0}")]
    SlotPanicked(String),

    /// The shutdown deadline expired before all slots stopped.
    #[error("shutdown deadline expired before all slots stopped")]
    ShutdownTimeout,
}

/// Error returned by a job execution, opaque to the broker.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecError {
    message: String,
}

impl ExecError {
    /// Wraps an execution failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Black-box execution engine for one worker type.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Executes one job to completion.
    async fn execute(&self, job: Job) -> Result<(), ExecError>;
}

/// Configuration of one worker type.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Name of the worker type; unique within a workers list.
    pub worker_type: String,
    /// Number of execution slots in this process. Zero registers the type
    /// name with the broker without polling or executing here.
    pub concurrency: usize,
    /// Execution engine for jobs of this type.
    pub executor: Arc<dyn JobExecutor>,
}

impl WorkerConfig {
    /// Creates a worker type configuration.
    pub fn new(
        worker_type: impl Into<String>,
        concurrency: usize,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            worker_type: worker_type.into(),
            concurrency,
            executor,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker_type", &self.worker_type)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// List of worker types served by one broker instance.
pub type WorkersList = Vec<WorkerConfig>;

/// Counters shared by the slots of one pool.
#[derive(Default)]
struct SharedStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a pool's execution counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Jobs executed to completion.
    pub completed: u64,
    /// Jobs whose execution returned an error.
    pub failed: u64,
}

impl PoolStats {
    /// Total number of jobs handed to the executor.
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Pool of execution slots for one worker type.
///
/// The pool reads jobs from the feed channel handed to [`WorkerPool::start`]
/// and never writes to it or closes it; the broker owns the channel.
pub struct WorkerPool {
    worker_type: String,
    concurrency: usize,
    executor: Arc<dyn JobExecutor>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl WorkerPool {
    /// Creates a stopped pool for a worker type configuration.
    pub fn new(conf: &WorkerConfig) -> Self {
        // Buffer size of 1 is sufficient since we only send once.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            worker_type: conf.worker_type.clone(),
            concurrency: conf.concurrency,
            executor: Arc::clone(&conf.executor),
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedStats::default()),
        }
    }

    /// Name of the worker type this pool serves.
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Snapshot of the execution counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
        }
    }

    /// Launches the execution slots on the feed channel.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool was started before,
    /// and `PoolError::InvalidConfig` if the worker type name cannot form
    /// valid queue keys.
    pub fn start(&mut self, feed: mpsc::Receiver<Job>) -> Result<(), PoolError> {
        if !self.handles.is_empty() {
            return Err(PoolError::AlreadyRunning);
        }
        // The type name is embedded in the queue keys: an empty name has
        // no key of its own, and a '/' collides with the lane layout
        // (a type named "x/p0" would shadow the manual lane of "x").
        if self.worker_type.is_empty() || self.worker_type.contains('/') {
            return Err(PoolError::InvalidConfig(format!(
                "worker type '{}' cannot form queue keys",
                self.worker_type
            )));
        }

        let feed = Arc::new(Mutex::new(feed));
        for slot in 0..self.concurrency {
            let worker_id = format!("{}-{}", self.worker_type, slot);
            let feed = Arc::clone(&feed);
            let executor = Arc::clone(&self.executor);
            let stats = Arc::clone(&self.stats);
            let shutdown_rx = self.shutdown_tx.subscribe();

            self.handles.push(tokio::spawn(slot_loop(
                worker_id,
                feed,
                executor,
                stats,
                shutdown_rx,
            )));
        }

        debug!(
            worker_type = %self.worker_type,
            slots = self.concurrency,
            "worker pool started"
        );
        Ok(())
    }

    /// Stops all slots cooperatively, bounded by the deadline.
    ///
    /// A slot busy with a job finishes it before exiting, and a job
    /// already buffered in the feed is still executed. Past the
    /// deadline the remaining slots are left to wind down on their own and
    /// `PoolError::ShutdownTimeout` is returned.
    pub async fn shutdown(&mut self, deadline: Instant) -> Result<(), PoolError> {
        // Send errors mean every slot already exited; nothing to signal.
        let _ = self.shutdown_tx.send(());

        let mut first_panic = None;
        for handle in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    if first_panic.is_none() {
                        first_panic = Some(PoolError::SlotPanicked(join_err.to_string()));
                    }
                }
                Err(_) => return Err(PoolError::ShutdownTimeout),
            }
        }

        debug!(worker_type = %self.worker_type, "worker pool stopped");
        match first_panic {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One execution slot: receives jobs from the shared feed until the feed
/// closes or a shutdown signal arrives, finishing the in-flight job and
/// any job already buffered in the feed first.
async fn slot_loop(
    worker_id: String,
    feed: Arc<Mutex<mpsc::Receiver<Job>>>,
    executor: Arc<dyn JobExecutor>,
    stats: Arc<SharedStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            // Biased so a job already buffered in the feed is drained
            // before a concurrent shutdown signal is honored.
            biased;
            job = recv_next(&feed) => match job {
                Some(job) => job,
                // The broker dropped the feed channel; nothing more will come.
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        };

        // Holds a slot of the process-wide cap, when one is installed,
        // for the duration of this execution.
        let _permit = limiter::acquire().await;

        debug!(
            worker = %worker_id,
            job_id = %job.job_id,
            domain = %job.domain,
            "executing job"
        );

        match executor.execute(job).await {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker = %worker_id, error = %err, "job execution failed");
            }
        }
    }
}

async fn recv_next(feed: &Arc<Mutex<mpsc::Receiver<Job>>>) -> Option<Job> {
    feed.lock().await.recv().await
}
