//! Redis-backed job broker.
//!
//! One broker instance runs in every cooperating process. `push_job`
//! persists a job through the store facade and pushes its
//! `<domain>/<job_id>` reference onto the per-type shared list, so any
//! process may execute it. `start_workers` spawns, per worker type with
//! local slots, a worker pool and a poll loop feeding it from the two
//! lanes of that type.
//!
//! # Lifecycle
//!
//! A broker is created idle, moves to running in `start_workers` and to
//! closed in `shutdown_workers`. The transitions are one-way: a closed
//! broker cannot be restarted, and enqueueing on a non-running broker
//! fails with [`BrokerError::Closed`].
//!
//! # Shutdown
//!
//! Shutdown is two-phase. Flipping the state to closed makes every poll
//! loop exit at its next iteration; phase one counts the loops out through
//! the closed-signal channel, bounded by the deadline. Only then does
//! phase two drain the pools, so no job can be delivered to a pool that is
//! shutting down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, ShutdownErrors};

use super::job::{Job, JobRequest, JobStore};
use super::limiter;
use super::queue::{self, QueueStore, RedisQueue, DEFAULT_POLL_TIMEOUT};
use super::worker::{WorkerPool, WorkersList};

/// Broker has not been started yet.
const IDLE: u8 = 0;
/// Broker is polling and accepting jobs.
const RUNNING: u8 = 1;
/// Broker was shut down and cannot be restarted.
const CLOSED: u8 = 2;

/// Pause after a failed or empty pop, damping tight loops against an
/// unreachable or misbehaving store.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between the facade and its poll loops.
struct Shared {
    queue: Arc<dyn QueueStore>,
    store: Arc<dyn JobStore>,
    state: AtomicU8,
}

/// Distributed job broker over shared Redis lists.
pub struct RedisBroker {
    shared: Arc<Shared>,
    /// Pools actually running in this process (concurrency > 0 only).
    pools: Vec<WorkerPool>,
    /// Every declared worker-type name, including concurrency-0 entries;
    /// governs enqueue validation.
    worker_types: Vec<String>,
    /// Receives one token per poll loop on its exit.
    closed_rx: Option<mpsc::Receiver<()>>,
    poll_timeout: Duration,
    poll_seed: Option<u64>,
    nb_slots: Option<usize>,
}

impl RedisBroker {
    /// Creates an idle broker over the given queue store and job store.
    pub fn new(queue: Arc<dyn QueueStore>, store: Arc<dyn JobStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                store,
                state: AtomicU8::new(IDLE),
            }),
            pools: Vec::new(),
            worker_types: Vec::new(),
            closed_rx: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_seed: None,
            nb_slots: None,
        }
    }

    /// Connects to the configured queue store and creates an idle broker.
    pub async fn from_config(
        config: &BrokerConfig,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, BrokerError> {
        let queue = RedisQueue::connect(&config.redis_url).await?;
        let mut broker =
            Self::new(Arc::new(queue), store).with_poll_timeout(config.poll_timeout);
        if let Some(slots) = config.nb_workers {
            broker = broker.with_nb_slots(slots);
        }
        Ok(broker)
    }

    /// Overrides the blocking-pop timeout of the poll loops.
    ///
    /// A poll loop re-checks the broker state only between pops, so
    /// shutdown latency is bounded by this value. The default of 10
    /// seconds suits production; tests shorten it.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Seeds the lane-swap RNG of the poll loops, for deterministic tests.
    ///
    /// Each loop derives its own stream by offsetting the seed, so worker
    /// types do not swap lanes in lockstep.
    pub fn with_poll_seed(mut self, seed: u64) -> Self {
        self.poll_seed = Some(seed);
        self
    }

    /// Caps total concurrent executions across all pools.
    ///
    /// Deprecated knob kept for old configurations; prefer per-type
    /// concurrency.
    pub fn with_nb_slots(mut self, slots: usize) -> Self {
        self.nb_slots = Some(slots);
        self
    }

    /// Starts the worker pools and their poll loops.
    ///
    /// Every worker type in the list is registered for enqueue validation.
    /// Types with concurrency > 0 additionally get a pool and a poll loop
    /// in this process.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` unless the broker is idle: a broker
    /// cannot be started twice nor restarted after shutdown. On a pool
    /// start-up error the pools started before it are left running and the
    /// error is returned; the caller is expected to shut down.
    pub async fn start_workers(&mut self, ws: WorkersList) -> Result<(), BrokerError> {
        if self
            .shared
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::Closed);
        }

        let active = ws.iter().filter(|conf| conf.concurrency > 0).count();
        // Buffered to the pool count so a loop exiting after an expired
        // shutdown deadline cannot wedge on its final send.
        let (closed_tx, closed_rx) = mpsc::channel(active.max(1));
        self.closed_rx = Some(closed_rx);

        for conf in ws {
            self.worker_types.push(conf.worker_type.clone());
            if conf.concurrency == 0 {
                continue;
            }

            let (feed_tx, feed_rx) = mpsc::channel(1);
            let mut pool = WorkerPool::new(&conf);
            pool.start(feed_rx).map_err(BrokerError::PoolStart)?;

            let poller = Poller {
                shared: Arc::clone(&self.shared),
                key: queue::queue_key(&conf.worker_type),
                feed: feed_tx,
                closed: closed_tx.clone(),
                timeout: self.poll_timeout,
                seed: self
                    .poll_seed
                    .map(|seed| seed.wrapping_add(self.pools.len() as u64)),
            };
            tokio::spawn(poller.run());
            self.pools.push(pool);
        }

        if !self.pools.is_empty() {
            info!("Started redis broker for {} workers type", self.pools.len());
        }

        // Retro-compat: the old configurations cap total workers globally.
        if let Some(slots) = self.nb_slots {
            if !self.pools.is_empty() && slots > 0 {
                limiter::set_nb_slots(slots);
            }
        }

        Ok(())
    }

    /// Persists a new job and enqueues its reference on the proper lane.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` when the broker is not running and
    /// `BrokerError::UnknownWorker` when the worker type was never
    /// registered. Store and queue failures are surfaced as-is.
    pub async fn push_job(&self, req: JobRequest) -> Result<Job, BrokerError> {
        if self.shared.state.load(Ordering::SeqCst) != RUNNING {
            return Err(BrokerError::Closed);
        }
        if !self.worker_types.iter().any(|t| t == &req.worker_type) {
            return Err(BrokerError::UnknownWorker(req.worker_type));
        }

        let job = self.shared.store.create(&req).await?;

        // Manual jobs go to the prioritized lane.
        let key = if job.manual {
            queue::manual_queue_key(&job.worker_type)
        } else {
            queue::queue_key(&job.worker_type)
        };
        self.shared.queue.lpush(&key, &job.queue_payload()).await?;

        Ok(job)
    }

    /// Returns the number of queued jobs for a worker type, both lanes
    /// summed. Types without queues report 0.
    pub async fn worker_queue_len(&self, worker_type: &str) -> Result<usize, BrokerError> {
        let normal = self
            .shared
            .queue
            .llen(&queue::queue_key(worker_type))
            .await?;
        let manual = self
            .shared
            .queue
            .llen(&queue::manual_queue_key(worker_type))
            .await?;
        Ok(normal + manual)
    }

    /// Registered worker-type names, including types with no local slots.
    pub fn worker_types(&self) -> &[String] {
        &self.worker_types
    }

    /// Whether the broker currently accepts jobs.
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Stops polling, then drains the worker pools, bounded by `timeout`.
    ///
    /// Phase one waits for every poll loop to observe the closed state and
    /// signal its exit; if the deadline fires first,
    /// `BrokerError::ShutdownTimeout` is returned and pool drain is not
    /// attempted. Phase two shuts the pools down concurrently and
    /// aggregates their errors. The queue store is closed on every path
    /// out of this method.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Closed` when the broker is not running.
    pub async fn shutdown_workers(&mut self, timeout: Duration) -> Result<(), BrokerError> {
        if self
            .shared
            .state
            .compare_exchange(RUNNING, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::Closed);
        }
        if self.pools.is_empty() {
            return Ok(());
        }

        info!("shutting down redis broker");
        let deadline = Instant::now() + timeout;
        let result = self.drain(deadline, timeout).await;

        if let Err(err) = self.shared.queue.close().await {
            warn!(error = %err, "closing the queue store failed");
        }

        match &result {
            Ok(()) => info!("redis broker shutdown complete"),
            Err(err) => warn!(error = %err, "redis broker shutdown failed"),
        }
        result
    }

    /// Phase one counts every poll loop out; phase two drains the pools.
    async fn drain(&mut self, deadline: Instant, timeout: Duration) -> Result<(), BrokerError> {
        let Some(mut closed_rx) = self.closed_rx.take() else {
            return Ok(());
        };
        for _ in 0..self.pools.len() {
            if tokio::time::timeout_at(deadline, closed_rx.recv())
                .await
                .is_err()
            {
                return Err(BrokerError::ShutdownTimeout(timeout));
            }
        }

        let mut errors = ShutdownErrors::new();
        let shutdowns = self.pools.iter_mut().map(|pool| pool.shutdown(deadline));
        for result in futures::future::join_all(shutdowns).await {
            if let Err(err) = result {
                errors.push(err);
            }
        }
        errors.into_result()
    }
}

/// One poll loop: feeds the pool of one worker type from its two lanes.
struct Poller {
    shared: Arc<Shared>,
    /// Normal-lane key; the manual lane is derived from it.
    key: String,
    feed: mpsc::Sender<Job>,
    closed: mpsc::Sender<()>,
    timeout: Duration,
    seed: Option<u64>,
}

impl Poller {
    /// Polls until the broker leaves the running state, then signals exit.
    ///
    /// BRPOP serves the first listed key that has elements, so always
    /// listing the manual lane first would starve the normal lane under
    /// sustained manual load. One iteration in three lists the normal
    /// lane first instead, which bounds starvation while keeping manual
    /// jobs ahead in the common case.
    async fn run(self) {
        let mut rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let manual_key = format!("{}{}", self.key, queue::HIGH_PRIORITY_SUFFIX);

        loop {
            if self.shared.state.load(Ordering::SeqCst) != RUNNING {
                break;
            }

            let (first, second) = if rng.random_range(0..3) == 0 {
                (self.key.as_str(), manual_key.as_str())
            } else {
                (manual_key.as_str(), self.key.as_str())
            };

            let (matched_key, value) =
                match self.shared.queue.brpop(self.timeout, &[first, second]).await {
                    Ok(Some(popped)) => popped,
                    Ok(None) | Err(_) => {
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

            if matched_key.len() < queue::QUEUE_PREFIX.len() {
                warn!("Invalid key {matched_key}");
                continue;
            }

            let Some((domain, job_id)) = value.split_once('/') else {
                warn!("Invalid val {value}");
                continue;
            };

            let job = match self.shared.store.get(domain, job_id).await {
                Ok(job) => job,
                Err(err) => {
                    // Dropped on purpose: re-queueing an unresolvable
                    // payload would loop forever.
                    warn!("Cannot find job {job_id} on domain {domain}: {err}");
                    continue;
                }
            };

            // Blocking send: backpressure when every slot is busy.
            if self.feed.send(job).await.is_err() {
                // The pool dropped its receiver; nothing left to feed.
                break;
            }
        }

        let _ = self.closed.send(()).await;
    }
}
