//! jobforge: distributed job broker over shared Redis queues.
//!
//! A broker instance runs in every cooperating process. Producers hand it
//! job requests; it persists them through a job store facade and pushes a
//! small `<domain>/<job_id>` reference onto the per-worker-type Redis list,
//! so any process in the fleet may pick the job up and execute it in its
//! local worker pool. See the [`jobs`] module for the architecture.

pub mod config;
pub mod error;
pub mod jobs;

// Re-export commonly used error types
pub use error::{BrokerError, ShutdownErrors};
