//! Bounded-permit admission control.
//!
//! A fair semaphore caps the number of in-flight requests regardless of
//! per-origin pacing. Permits are RAII: dropping one on any exit path,
//! including cancellation, returns it to the pool. Waiters queue FIFO and a
//! request whose deadline passes while queued fails without touching the
//! network.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::deadline::Deadline;

/// Default permit ceiling.
pub const DEFAULT_PERMITS: usize = 1_000;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no permit became available before the deadline")]
    Busy,
}

/// Admission token for one in-flight request.
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

/// Shared bounded permit pool. Clone the `Arc` to share one gate across
/// sessions; give each session its own for per-session ceilings.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self, deadline: Deadline) -> Result<Permit, GateError> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(deadline.remaining(), acquire).await {
            Ok(Ok(permit)) => Ok(Permit { _inner: permit }),
            // A closed semaphore cannot happen while the gate is alive, but
            // it maps to the same caller-visible outcome.
            Ok(Err(_)) | Err(_) => Err(GateError::Busy),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_PERMITS)
    }
}
