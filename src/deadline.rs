//! Deadline bookkeeping shared by every suspension point in the pipeline.

use std::time::Duration;

use tokio::time::Instant;

/// Absolute point in time after which a request must not make progress.
///
/// Every blocking operation (permit, ticket, transport, challenge sleep)
/// derives its own timeout from the remaining budget so the request as a
/// whole resolves within the caller's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    /// Remaining budget, saturating at zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn instant(&self) -> Instant {
        self.at
    }
}
