//! Challenge engine: detection, extraction, sandboxed evaluation, and the
//! solver state machine that drives resubmission.

pub mod detector;
pub mod extract;
pub mod solver;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

pub use detector::{Detection, DetectionEvidence, classify};
pub use extract::{ChallengeForm, ExtractError, Extraction};
pub use solver::{SolveError, Solver};

/// The challenge taxonomy the detector can emit. Closed by design: every
/// solver transition is a total match over these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ChallengeKind {
    JsInterstitial,
    Interactive,
    ManagedWait,
    RateLimited,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChallengeKind::JsInterstitial => "js-interstitial",
            ChallengeKind::Interactive => "interactive",
            ChallengeKind::ManagedWait => "managed-wait",
            ChallengeKind::RateLimited => "rate-limited",
        };
        f.write_str(label)
    }
}

/// Terminal failure causes of the solver state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SolveFailure {
    Interactive,
    Extract,
    Sandbox,
    Verify,
    MaxAttempts,
    RateLimited,
}

impl fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolveFailure::Interactive => "interactive challenge requires an external resolver",
            SolveFailure::Extract => "challenge extraction failed",
            SolveFailure::Sandbox => "sandboxed evaluation failed",
            SolveFailure::Verify => "solution was not accepted",
            SolveFailure::MaxAttempts => "attempt budget exhausted",
            SolveFailure::RateLimited => "rate limited past the attempt budget",
        };
        f.write_str(label)
    }
}

/// Immutable account of one challenge negotiation. Built once by the solver
/// when it reaches a terminal state; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub kind: ChallengeKind,
    pub detected_at: DateTime<Utc>,
    /// Form fields extracted from the interstitial, when there were any.
    pub form_fields: Vec<(String, String)>,
    /// The opaque value submitted back to the edge.
    pub solution: Option<String>,
    pub solve_duration: Duration,
    pub attempts: u32,
    pub success: bool,
    pub failure: Option<SolveFailure>,
}

#[derive(Debug, Error)]
#[error("interactive resolver failed: {0}")]
pub struct ResolverError(pub String);

/// External supplier of interactive (Turnstile-style) tokens. The core never
/// solves these itself; a session configured for external resolution hands
/// the site key and challenge URL to this callback.
#[async_trait]
pub trait InteractiveResolver: Send + Sync {
    async fn resolve(&self, site_key: &str, challenge_url: &Url) -> Result<String, ResolverError>;
}
