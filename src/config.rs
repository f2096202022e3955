//! Session configuration.
//!
//! A closed record: every knob the core understands is a field here, values
//! are validated when the session is built, and anything out of range is a
//! configuration error rather than a silent default.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

use crate::gate::DEFAULT_PERMITS;
use crate::sandbox::{DEFAULT_MEMORY_LIMIT, DEFAULT_WALL_TIME};

/// How the session reacts to detected challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMode {
    /// Solve what the solver can solve, fail on interactive.
    Auto,
    /// Detect and report, never solve.
    Off,
    /// Like `Auto`, but interactive challenges are delegated to the
    /// configured resolver callback.
    ExternalInteractive,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fingerprint profile name; must exist in the catalog.
    pub profile: String,
    /// Permit ceiling of the session-owned gate.
    pub max_concurrency: usize,
    /// Per-origin pacing rate in tokens per second.
    pub rate_per_second: f64,
    /// Token bucket burst size.
    pub rate_burst: u32,
    /// Deadline applied to requests that carry none of their own.
    pub default_deadline: Duration,
    /// When set, requests to hosts outside this set fail before any
    /// network activity.
    pub origin_whitelist: Option<HashSet<String>>,
    pub challenge_solve: ChallengeMode,
    /// Maximum solver attempts per challenge.
    pub max_challenge_attempts: u32,
    /// Redirect hops followed per request.
    pub follow_redirects: u32,
    /// Idle pooled connections are dropped after this long.
    pub idle_connection_timeout: Duration,
    pub sandbox_memory_limit: usize,
    pub sandbox_wall_time: Duration,
    /// Record aggregate metrics and expose them in snapshots.
    pub enable_metrics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: "chrome-124".to_string(),
            max_concurrency: DEFAULT_PERMITS,
            rate_per_second: 5.0,
            rate_burst: 10,
            default_deadline: Duration::from_secs(30),
            origin_whitelist: None,
            challenge_solve: ChallengeMode::Auto,
            max_challenge_attempts: 3,
            follow_redirects: 10,
            idle_connection_timeout: Duration::from_secs(90),
            sandbox_memory_limit: DEFAULT_MEMORY_LIMIT,
            sandbox_wall_time: DEFAULT_WALL_TIME,
            enable_metrics: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if crate::fingerprint::profile(&self.profile).is_none() {
            return Err(ConfigError::UnknownProfile(self.profile.clone()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be positive"));
        }
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(ConfigError::invalid(
                "rate_per_second",
                "must be a positive finite number",
            ));
        }
        if self.rate_burst == 0 {
            return Err(ConfigError::invalid("rate_burst", "must be positive"));
        }
        if self.default_deadline.is_zero() {
            return Err(ConfigError::invalid("default_deadline", "must be non-zero"));
        }
        if self.max_challenge_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_challenge_attempts",
                "must be positive",
            ));
        }
        if self.sandbox_memory_limit == 0 {
            return Err(ConfigError::invalid(
                "sandbox_memory_limit",
                "must be positive",
            ));
        }
        if self.sandbox_wall_time.is_zero() {
            return Err(ConfigError::invalid("sandbox_wall_time", "must be non-zero"));
        }
        if let Some(whitelist) = &self.origin_whitelist
            && whitelist.is_empty()
        {
            return Err(ConfigError::invalid(
                "origin_whitelist",
                "an empty whitelist would reject every request",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown fingerprint profile '{0}'")]
    UnknownProfile(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("challenge_solve is external-interactive but no resolver is installed")]
    MissingResolver,
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::InvalidValue { field, reason }
    }
}
