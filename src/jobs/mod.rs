//! Distributed job brokering over shared Redis queues.
//!
//! This module provides the pieces of the broker:
//!
//! - **RedisBroker**: lifecycle facade, enqueue surface and poll loops
//! - **QueueStore**: narrow capability over the shared queue store
//! - **JobStore**: facade over job persistence
//! - **WorkerPool**: per-type execution slots fed by a poll loop
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────────┐                      ┌──────────────┐
//!    │  Producer    │                      │  Producer    │
//!    │ (process A)  │                      │ (process B)  │
//!    └──────┬───────┘                      └──────┬───────┘
//!           │ push_job                            │
//!           ▼                                     ▼
//!    ┌─────────────────────────────────────────────────────┐
//!    │                  Redis lists                        │
//!    │     j/<type>  (normal)    j/<type>/p0  (manual)     │
//!    └──────┬──────────────────────────────────────┬───────┘
//!           │ BRPOP                                │ BRPOP
//!           ▼                                      ▼
//!      ┌─────────┐                            ┌─────────┐
//!      │poll loop│──feed──▶ pool slots        │poll loop│──feed──▶ ...
//!      └─────────┘                            └─────────┘
//! ```
//!
//! Each worker type has two lanes. Manual (high-priority) jobs are pushed
//! to the `/p0` lane, which the poll loop prefers two times out of three;
//! the third pop prefers the normal lane so neither lane can starve.
//!
//! # Delivery semantics
//!
//! Pops are destructive and unacknowledged: a process crash between pop
//! and execution loses the job. Malformed or unresolvable queue payloads
//! are logged and dropped, never re-queued.

pub mod broker;
pub mod job;
pub mod limiter;
pub mod queue;
pub mod worker;

// Re-export main types for convenience
pub use broker::RedisBroker;
pub use job::{Job, JobRequest, JobStore, MemoryJobStore, StoreError};
pub use limiter::SlotLimiter;
pub use queue::{QueueError, QueueStore, RedisQueue};
pub use worker::{
    ExecError, JobExecutor, PoolError, PoolStats, WorkerConfig, WorkerPool, WorkersList,
};
