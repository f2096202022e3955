//! # cloudflare-research
//!
//! A programmable HTTP client whose wire appearance matches a real Chrome
//! build and which transparently negotiates Cloudflare-style interstitial
//! challenges. Built for security researchers exercising infrastructure they
//! own: load generation, protection validation, measurement.
//!
//! ## What it does
//!
//! - Fingerprint-preserving transport: ClientHello, ALPN, HTTP/2 SETTINGS,
//!   header order and casing all come from an immutable per-profile catalog
//! - Challenge engine: detection, extraction, sandboxed JavaScript
//!   evaluation, and clearance-cookie continuity
//! - Concurrency substrate: bounded admission, per-origin token-bucket
//!   pacing with adaptive backoff, deadlines on every suspension point
//! - Session-scoped cookie jar with edge cookies as first-class state
//!
//! ## Example
//!
//! ```no_run
//! use cloudflare_research::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::builder().with_profile("chrome-124").build()?;
//!     let response = session.get("https://test-target.example/healthz").await?;
//!     println!("{} {}", response.status(), response.text());
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod cookies;
pub mod deadline;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod limiter;
pub mod metrics;
pub mod sandbox;
pub mod transport;

mod pipeline;
mod session;

pub use crate::challenge::{
    ChallengeKind,
    ChallengeRecord,
    Detection,
    DetectionEvidence,
    InteractiveResolver,
    ResolverError,
    SolveFailure,
};

pub use crate::config::{ChallengeMode, ConfigError, SessionConfig};

pub use crate::cookies::{CookieJar, EdgeCookie, StoredCookie};

pub use crate::error::{ClientError, PartialResponse};

pub use crate::events::{
    ChannelSubscriber,
    Event,
    EventBus,
    EventSubscriber,
    LogSubscriber,
    SessionId,
};

pub use crate::fingerprint::{
    FingerprintProfile,
    HeaderSequence,
    compose_request_headers,
    profile,
    profile_names,
};

pub use crate::gate::{ConcurrencyGate, Permit};

pub use crate::limiter::{OriginRateLimiter, RateLimiterConfig, Ticket};

pub use crate::metrics::{MetricsRecorder, MetricsSnapshot};

pub use crate::sandbox::{Sandbox, SandboxError, SandboxLimits, ShimState};

pub use crate::session::{Request, Response, Session, SessionBuilder, SessionState};

pub use crate::transport::{
    RawResponse,
    ReqwestTransport,
    Timing,
    Transport,
    TransportCall,
    TransportError,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
