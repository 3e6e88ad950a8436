//! Error types for the broker facade.
//!
//! Each subsystem defines its own error enum next to its code
//! (`QueueError`, `StoreError`, `PoolError`, `ConfigError`); this module
//! defines the taxonomy surfaced by the broker itself and the aggregation
//! of shutdown failures into a single reportable value.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::job::StoreError;
use crate::jobs::queue::QueueError;
use crate::jobs::worker::PoolError;

/// Errors surfaced by the broker facade.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker is not in the running state for this operation: it was
    /// started twice, shut down already, or never started at all.
    #[error("broker is closed")]
    Closed,

    /// A job was pushed for a worker type that is not registered.
    #[error("unknown worker type '{0}'")]
    UnknownWorker(String),

    /// The queue store rejected an operation.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The job store rejected an operation.
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// A worker pool failed to start. Pools started before the failure are
    /// left running; the caller is expected to shut down.
    #[error("worker pool failed to start: {0}")]
    PoolStart(PoolError),

    /// The shutdown deadline expired before every poll loop exited.
    /// Pool drain was not attempted.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// One or more worker pools failed to drain during shutdown.
    #[error("worker pool shutdown failed: {0}")]
    PoolShutdown(ShutdownErrors),
}

/// Collects the errors of concurrent pool shutdowns into one value.
///
/// Shutdown drains every pool even when some of them fail, so the caller
/// sees all failures at once instead of just the first.
#[derive(Debug, Default)]
pub struct ShutdownErrors {
    errors: Vec<PoolError>,
}

impl ShutdownErrors {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one pool shutdown failure.
    pub fn push(&mut self, err: PoolError) {
        self.errors.push(err);
    }

    /// Returns the collected errors.
    pub fn errors(&self) -> &[PoolError] {
        &self.errors
    }

    /// Returns whether any error was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Consumes the collector: `Ok(())` when no error was recorded,
    /// the aggregate otherwise.
    pub fn into_result(self) -> Result<(), BrokerError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::PoolShutdown(self))
        }
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pool(s) failed to shut down: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Closed;
        assert!(err.to_string().contains("closed"));

        let err = BrokerError::UnknownWorker("thumbnails".to_string());
        assert!(err.to_string().contains("thumbnails"));

        let err = BrokerError::ShutdownTimeout(Duration::from_millis(50));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_shutdown_errors_aggregation() {
        let mut errors = ShutdownErrors::new();
        assert!(errors.is_empty());

        errors.push(PoolError::AlreadyRunning);
        errors.push(PoolError::ShutdownTimeout);
        assert_eq!(errors.errors().len(), 2);

        let rendered = errors.to_string();
        assert!(rendered.contains("2 pool(s)"));
        assert!(rendered.contains("; "));
    }

    #[test]
    fn test_shutdown_errors_into_result() {
        assert!(ShutdownErrors::new().into_result().is_ok());

        let mut errors = ShutdownErrors::new();
        errors.push(PoolError::ShutdownTimeout);
        let err = errors.into_result().expect_err("should aggregate");
        assert!(matches!(err, BrokerError::PoolShutdown(_)));
    }
}
