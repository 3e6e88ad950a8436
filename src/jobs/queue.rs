//! Queue store capability and its Redis implementation.
//!
//! The queue store is the only state shared between cooperating processes.
//! The broker needs four operations from it: a blocking right-pop across an
//! ordered pair of keys, a left-push, a list length, and close. Everything
//! else about the store is out of scope.
//!
//! # Key layout
//!
//! - `j/<worker_type>`: normal lane
//! - `j/<worker_type>/p0`: manual (high-priority) lane
//!
//! Values are plain UTF-8 text, opaque to the store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Prefix shared by all job queue keys.
pub const QUEUE_PREFIX: &str = "j/";

/// Suffix of the high-priority lane of a worker type.
pub const HIGH_PRIORITY_SUFFIX: &str = "/p0";

/// Default timeout of one blocking pop attempt.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns the normal-lane key for a worker type.
pub fn queue_key(worker_type: &str) -> String {
    format!("{QUEUE_PREFIX}{worker_type}")
}

/// Returns the high-priority-lane key for a worker type.
pub fn manual_queue_key(worker_type: &str) -> String {
    format!("{QUEUE_PREFIX}{worker_type}{HIGH_PRIORITY_SUFFIX}")
}

/// Errors that can occur during queue store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Narrow capability over the shared queue store.
///
/// `brpop` distinguishes an empty return (timeout, nothing popped) from an
/// error; the poll loops damp both with a short back-off but must never
/// treat a hiccup as data.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Blocking right-pop over the listed keys.
    ///
    /// Returns when any key has a value or after `timeout`. On the store
    /// side the keys are serviced in listed order: the matched key is the
    /// first one that was non-empty at some moment during the wait.
    async fn brpop(
        &self,
        timeout: Duration,
        keys: &[&str],
    ) -> Result<Option<(String, String)>, QueueError>;

    /// Pushes a value at the left end of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Returns the length of a list. A missing key counts as 0.
    async fn llen(&self, key: &str) -> Result<usize, QueueError>;

    /// Releases the underlying connection. Called exactly once, during
    /// broker shutdown.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue store.
pub struct RedisQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisQueue {
    /// Connects to Redis and creates a new queue store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a queue store from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl QueueStore for RedisQueue {
    async fn brpop(
        &self,
        timeout: Duration,
        keys: &[&str],
    ) -> Result<Option<(String, String)>, QueueError> {
        let mut conn = self.redis.clone();

        // BRPOP takes its timeout in whole seconds, last argument.
        let mut cmd = redis::cmd("BRPOP");
        for key in keys {
            cmd.arg(*key);
        }
        cmd.arg(timeout.as_secs().max(1) as usize);

        let result: Option<(String, String)> = cmd.query_async(&mut conn).await?;
        Ok(result)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn close(&self) -> Result<(), QueueError> {
        // The connection manager has no explicit close; dropping the last
        // clone tears the connection down.
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory queue fakes shared by the broker scenario tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::{QueueError, QueueStore};

    /// Ordered multi-key blocking list store mirroring the Redis contract.
    #[derive(Default)]
    pub(crate) struct MemoryQueue {
        lists: Mutex<HashMap<String, VecDeque<String>>>,
        pushed: Notify,
        close_calls: AtomicUsize,
    }

    impl MemoryQueue {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Number of times `close` was invoked.
        pub(crate) fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }

        fn try_pop(&self, keys: &[&str]) -> Option<(String, String)> {
            let mut lists = self.lists.lock().unwrap();
            for key in keys {
                if let Some(list) = lists.get_mut(*key) {
                    if let Some(value) = list.pop_back() {
                        return Some(((*key).to_string(), value));
                    }
                }
            }
            None
        }
    }

    #[async_trait]
    impl QueueStore for MemoryQueue {
        async fn brpop(
            &self,
            timeout: Duration,
            keys: &[&str],
        ) -> Result<Option<(String, String)>, QueueError> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                // Register interest before checking so a concurrent push
                // cannot slip between the check and the wait.
                let pushed = self.pushed.notified();
                if let Some(hit) = self.try_pop(keys) {
                    return Ok(Some(hit));
                }
                if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                    return Ok(None);
                }
            }
        }

        async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
            self.lists
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
            self.pushed.notify_waiters();
            Ok(())
        }

        async fn llen(&self, key: &str) -> Result<usize, QueueError> {
            Ok(self.lists.lock().unwrap().get(key).map_or(0, |l| l.len()))
        }

        async fn close(&self) -> Result<(), QueueError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Queue whose blocking pop never returns, for shutdown-deadline tests.
    pub(crate) struct StuckQueue;

    #[async_trait]
    impl QueueStore for StuckQueue {
        async fn brpop(
            &self,
            _timeout: Duration,
            _keys: &[&str],
        ) -> Result<Option<(String, String)>, QueueError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn lpush(&self, _key: &str, _value: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn llen(&self, _key: &str) -> Result<usize, QueueError> {
            Ok(0)
        }

        async fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryQueue;
    use super::*;

    #[test]
    fn test_queue_keys() {
        assert_eq!(queue_key("thumbnails"), "j/thumbnails");
        assert_eq!(manual_queue_key("thumbnails"), "j/thumbnails/p0");
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_memory_queue_fifo_within_one_key() {
        let queue = MemoryQueue::new();
        queue.lpush("j/t", "a/1").await.unwrap();
        queue.lpush("j/t", "a/2").await.unwrap();

        let timeout = Duration::from_millis(50);
        let first = queue.brpop(timeout, &["j/t"]).await.unwrap();
        let second = queue.brpop(timeout, &["j/t"]).await.unwrap();

        assert_eq!(first, Some(("j/t".to_string(), "a/1".to_string())));
        assert_eq!(second, Some(("j/t".to_string(), "a/2".to_string())));
    }

    #[tokio::test]
    async fn test_memory_queue_prefers_first_listed_key() {
        let queue = MemoryQueue::new();
        queue.lpush("j/t", "a/normal").await.unwrap();
        queue.lpush("j/t/p0", "a/manual").await.unwrap();

        let hit = queue
            .brpop(Duration::from_millis(50), &["j/t/p0", "j/t"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.0, "j/t/p0");
        assert_eq!(hit.1, "a/manual");
    }

    #[tokio::test]
    async fn test_memory_queue_timeout_returns_empty() {
        let queue = MemoryQueue::new();
        let hit = queue.brpop(Duration::from_millis(20), &["j/t"]).await.unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_wakes_blocked_pop_on_push() {
        use std::sync::Arc;

        let queue = Arc::new(MemoryQueue::new());
        let popper = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            popper.brpop(Duration::from_secs(5), &["j/t"]).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.lpush("j/t", "a/1").await.unwrap();

        let hit = handle.await.unwrap().unwrap();
        assert_eq!(hit, Some(("j/t".to_string(), "a/1".to_string())));
    }

    #[tokio::test]
    async fn test_memory_queue_llen_missing_key_is_zero() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.llen("j/absent").await.unwrap(), 0);

        queue.lpush("j/t", "a/1").await.unwrap();
        assert_eq!(queue.llen("j/t").await.unwrap(), 1);
    }
}
