//! Optional process-wide cap on concurrent job executions.
//!
//! Kept for configurations that still set the old total-workers knob. The
//! broker installs the limiter at start when the knob is present; worker
//! slots hold a permit for the duration of one execution. Without the knob
//! nothing is installed and executions are bounded per worker type only.

use std::sync::{Arc, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Semaphore bounding concurrent executions across all pools.
#[derive(Clone)]
pub struct SlotLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl SlotLimiter {
    /// Creates a limiter with the given number of execution slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free slot and returns its permit.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        // The semaphore is never closed; ok() avoids a panic path anyway.
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }
}

static GLOBAL_SLOTS: OnceLock<SlotLimiter> = OnceLock::new();

/// Installs the process-wide limiter. The first installation wins.
pub(crate) fn set_nb_slots(capacity: usize) {
    warn!("Limiting the number of total concurrent workers to {capacity}");
    warn!("Please update your configuration file to avoid a hard limit");
    let _ = GLOBAL_SLOTS.set(SlotLimiter::new(capacity));
}

/// Acquires a permit from the process-wide limiter, if one is installed.
pub(crate) async fn acquire() -> Option<OwnedSemaphorePermit> {
    match GLOBAL_SLOTS.get() {
        Some(limiter) => limiter.acquire().await,
        None => None,
    }
}
