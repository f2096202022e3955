//! Per-origin adaptive rate pacing.
//!
//! Token bucket per (host, port): tokens refill continuously at the current
//! rate, capped at the burst size. Waiting is cooperative; a caller that
//! cannot get a token sleeps exactly the deficit, never spins. The effective
//! rate halves when the origin pushes back (429, or 503 with Retry-After)
//! and creeps back up 10% at a time after 64 consecutive clean responses,
//! never exceeding the configured rate.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::deadline::Deadline;

/// Floor under multiplicative decrease.
pub const MIN_RATE: f64 = 0.1;
/// Clean responses required before a recovery step.
pub const RECOVERY_STREAK: u32 = 64;
/// Recovery multiplier.
const RECOVERY_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub rate_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("deadline exceeded while waiting for a rate token")]
    DeadlineExceeded,
}

/// Held for the lifetime of one paced request. The token was consumed at
/// acquisition; dropping the ticket on response receipt is the implicit
/// release.
#[derive(Debug)]
pub struct Ticket {
    origin: String,
}

impl Ticket {
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    clean_streak: u32,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            rate: config.rate_per_second,
            clean_streak: 0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(burst);
        self.last_refill = now;
    }
}

/// Shared pacing state for all origins a session talks to.
pub struct OriginRateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl OriginRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `origin`, sleeping until one is available or the
    /// deadline passes.
    pub async fn acquire(&self, origin: &str, deadline: Deadline) -> Result<Ticket, LimiterError> {
        loop {
            let wait = {
                let mut guard = self.buckets.lock().await;
                let bucket = guard
                    .entry(origin.to_string())
                    .or_insert_with(|| Bucket::new(&self.config));
                bucket.refill(self.config.burst as f64);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(Ticket {
                        origin: origin.to_string(),
                    });
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };

            if wait >= deadline.remaining() {
                return Err(LimiterError::DeadlineExceeded);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Feed one response outcome back. Returns the new effective rate when
    /// an adjustment happened.
    pub async fn note_response(
        &self,
        origin: &str,
        status: u16,
        has_retry_after: bool,
    ) -> Option<f64> {
        let mut guard = self.buckets.lock().await;
        let bucket = guard
            .entry(origin.to_string())
            .or_insert_with(|| Bucket::new(&self.config));

        let pushback = status == 429 || (status == 503 && has_retry_after);
        if pushback {
            bucket.clean_streak = 0;
            let reduced = (bucket.rate * 0.5).max(MIN_RATE);
            if (reduced - bucket.rate).abs() > f64::EPSILON {
                bucket.rate = reduced;
                return Some(reduced);
            }
            return None;
        }

        bucket.clean_streak = bucket.clean_streak.saturating_add(1);
        if bucket.clean_streak >= RECOVERY_STREAK && bucket.rate < self.config.rate_per_second {
            bucket.clean_streak = 0;
            let recovered = (bucket.rate * RECOVERY_FACTOR).min(self.config.rate_per_second);
            bucket.rate = recovered;
            return Some(recovered);
        }
        None
    }

    /// Current effective rate for an origin (the configured rate when the
    /// origin has not been seen yet).
    pub async fn current_rate(&self, origin: &str) -> f64 {
        let guard = self.buckets.lock().await;
        guard
            .get(origin)
            .map(|bucket| bucket.rate)
            .unwrap_or(self.config.rate_per_second)
    }

    /// Effective rates per origin, for session snapshots.
    pub async fn rates(&self) -> Vec<(String, f64)> {
        let guard = self.buckets.lock().await;
        guard
            .iter()
            .map(|(origin, bucket)| (origin.clone(), bucket.rate))
            .collect()
    }
}
