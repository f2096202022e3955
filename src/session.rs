//! Session orchestration.
//!
//! A session binds one fingerprint profile, one cookie jar, one rate-limiter
//! configuration, and the challenge solver for a series of correlated
//! requests. Sessions are cheap to build (no I/O) and independent of each
//! other; the only state they can share is an explicit `Arc` gate.
//!
//! The request path is a flat sequence of suspending operations with scoped
//! acquisition: permit, then whitelist, then per-origin ticket, then the
//! exchange itself. Dropping the future at any point releases everything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::Method;
use url::Url;

use crate::challenge::solver::{SolveError, Solver};
use crate::challenge::{ChallengeRecord, InteractiveResolver, classify};
use crate::config::{ChallengeMode, SessionConfig};
use crate::cookies::CookieJar;
use crate::deadline::Deadline;
use crate::error::{ClientError, PartialResponse};
use crate::events::{Event, EventBus, EventSubscriber, LogSubscriber, SessionId};
use crate::fingerprint::{FingerprintProfile, HeaderSequence};
use crate::gate::ConcurrencyGate;
use crate::limiter::{OriginRateLimiter, RateLimiterConfig};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::pipeline::{Exchange, PreparedRequest, origin_of};
use crate::sandbox::SandboxLimits;
use crate::transport::{ReqwestTransport, Timing, Transport};

/// One request as the caller describes it.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Header overrides, merged over the profile template in order.
    pub headers: HeaderSequence,
    pub body: Option<Bytes>,
    /// Overrides the session default deadline when set.
    pub deadline: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderSequence::new(),
            body: None,
            deadline: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body.into());
        request
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Final response handed back to the caller. Owns its body; carries the
/// session id as an opaque correlation token, never a session reference.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderSequence,
    body: Bytes,
    url: Url,
    timing: Timing,
    challenge: Option<ChallengeRecord>,
    session: SessionId,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderSequence {
        &self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Present when a challenge was negotiated during this logical request.
    pub fn challenge_record(&self) -> Option<&ChallengeRecord> {
        self.challenge.as_ref()
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

/// Debug/export view of a session. No persistence guarantees.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionState {
    pub id: SessionId,
    pub profile: &'static str,
    pub requests_issued: u64,
    pub challenges_seen: u64,
    pub challenges_solved: u64,
    pub cookies: usize,
    pub origin_rates: Vec<(String, f64)>,
    pub metrics: Option<MetricsSnapshot>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    challenges_seen: AtomicU64,
    challenges_solved: AtomicU64,
}

struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    profile: &'static FingerprintProfile,
    jar: Arc<CookieJar>,
    gate: Arc<ConcurrencyGate>,
    limiter: Arc<OriginRateLimiter>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    metrics: Option<MetricsRecorder>,
    resolver: Option<Arc<dyn InteractiveResolver>>,
    counters: Counters,
    closed: AtomicBool,
}

/// Handle to one session. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Build a session with default configuration.
    pub fn new() -> Result<Self, ClientError> {
        SessionBuilder::new().build()
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The session's cookie jar, e.g. for seeding or inspection.
    pub fn cookie_jar(&self) -> &CookieJar {
        &self.inner.jar
    }

    /// The admission gate this session draws permits from.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    /// Convenience GET.
    pub async fn get(&self, url: &str) -> Result<Response, ClientError> {
        let url = Url::parse(url)
            .map_err(|err| ClientError::Protocol(format!("invalid url: {err}")))?;
        self.request(Request::get(url)).await
    }

    /// Issue one request through the full pipeline: admission, whitelist,
    /// pacing, transport, cookie absorption, detection, and - when needed -
    /// the challenge solver.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let deadline = Deadline::after(
            request.deadline.unwrap_or(inner.config.default_deadline),
        );

        // Permit first: global concurrency bounds independently of pacing.
        let _permit = inner
            .gate
            .acquire(deadline)
            .await
            .map_err(|_| ClientError::GateBusy)?;

        let host = request.url.host_str().unwrap_or_default().to_string();
        if let Some(whitelist) = &inner.config.origin_whitelist
            && !whitelist.contains(&host)
        {
            return Err(ClientError::OriginDenied { host });
        }

        let origin = origin_of(&request.url);
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        inner.events.dispatch(Event::RequestStarted {
            session: inner.id,
            method: request.method.clone(),
            origin: origin.clone(),
            timestamp: Utc::now(),
        });

        let prepared = PreparedRequest {
            method: request.method,
            url: request.url,
            overrides: request.headers,
            body: request.body,
        };
        let exchange = self.exchange();

        let raw = exchange.fetch(&prepared, deadline).await?;
        let detection = classify(&raw);

        let (raw, challenge) = match detection.kind {
            None => (raw, None),
            Some(kind) => {
                inner.counters.challenges_seen.fetch_add(1, Ordering::Relaxed);
                inner.events.dispatch(Event::ChallengeDetected {
                    session: inner.id,
                    kind,
                    origin: origin.clone(),
                    timestamp: Utc::now(),
                });

                if inner.config.challenge_solve == ChallengeMode::Off {
                    (raw, None)
                } else {
                    let solver = Solver {
                        max_attempts: inner.config.max_challenge_attempts,
                        sandbox_limits: SandboxLimits {
                            memory_bytes: inner.config.sandbox_memory_limit,
                            wall_time: inner.config.sandbox_wall_time,
                        },
                        resolver: match inner.config.challenge_solve {
                            ChallengeMode::ExternalInteractive => inner.resolver.clone(),
                            _ => None,
                        },
                    };

                    match solver
                        .solve(&exchange, &prepared, raw, kind, detection.evidence, deadline)
                        .await
                    {
                        Ok((solved, record)) => {
                            inner
                                .counters
                                .challenges_solved
                                .fetch_add(1, Ordering::Relaxed);
                            inner.events.dispatch(Event::ChallengeSolved {
                                session: inner.id,
                                kind,
                                duration: record.solve_duration,
                                timestamp: Utc::now(),
                            });
                            (solved, Some(record))
                        }
                        Err(SolveError::Deadline) => return Err(ClientError::DeadlineExceeded),
                        Err(SolveError::Unsolvable {
                            reason,
                            record,
                            status,
                            headers,
                        }) => {
                            inner.events.dispatch(Event::ChallengeFailed {
                                session: inner.id,
                                cause: reason,
                                timestamp: Utc::now(),
                            });
                            return Err(ClientError::ChallengeUnsolvable {
                                reason,
                                record,
                                partial: Some(PartialResponse { status, headers }),
                            });
                        }
                    }
                }
            }
        };

        inner.events.dispatch(Event::RequestCompleted {
            session: inner.id,
            status: raw.status,
            timing: raw.timing,
            timestamp: Utc::now(),
        });

        Ok(Response {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            url: raw.url,
            timing: raw.timing,
            challenge,
            session: inner.id,
        })
    }

    /// Execute a set of requests concurrently, subject to the gate and the
    /// rate limiter, returning results in input order.
    pub async fn batch(&self, requests: Vec<Request>) -> Vec<Result<Response, ClientError>> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let session = self.clone();
                tokio::spawn(async move { session.request(request).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    Err(ClientError::Protocol(format!("batch task failed: {join_error}")))
                }
            });
        }
        results
    }

    /// Close the session: further requests fail fast and pooled connections
    /// are released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.transport.close().await;
    }

    /// Point-in-time view of session state for debugging or export.
    pub async fn snapshot(&self) -> SessionState {
        let inner = &self.inner;
        SessionState {
            id: inner.id,
            profile: inner.profile.name(),
            requests_issued: inner.counters.requests.load(Ordering::Relaxed),
            challenges_seen: inner.counters.challenges_seen.load(Ordering::Relaxed),
            challenges_solved: inner.counters.challenges_solved.load(Ordering::Relaxed),
            cookies: inner.jar.len(),
            origin_rates: inner.limiter.rates().await,
            metrics: inner.metrics.as_ref().map(MetricsRecorder::snapshot),
        }
    }

    fn exchange(&self) -> Exchange {
        let inner = &self.inner;
        Exchange {
            profile: inner.profile,
            transport: Arc::clone(&inner.transport),
            jar: Arc::clone(&inner.jar),
            limiter: Arc::clone(&inner.limiter),
            events: Arc::clone(&inner.events),
            session: inner.id,
            follow_redirects: inner.config.follow_redirects,
        }
    }
}

/// Fluent constructor for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    gate: Option<Arc<ConcurrencyGate>>,
    resolver: Option<Arc<dyn InteractiveResolver>>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            transport: None,
            gate: None,
            resolver: None,
            subscribers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.config.profile = profile.into();
        self
    }

    /// Substitute the transport; tests use this to script responses.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an admission gate across sessions instead of owning one.
    pub fn with_shared_gate(mut self, gate: Arc<ConcurrencyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_interactive_resolver(mut self, resolver: Arc<dyn InteractiveResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn subscribe(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn build(self) -> Result<Session, ClientError> {
        self.config.validate()?;
        if self.config.challenge_solve == ChallengeMode::ExternalInteractive
            && self.resolver.is_none()
        {
            return Err(crate::config::ConfigError::MissingResolver.into());
        }

        let profile = crate::fingerprint::profile(&self.config.profile).ok_or_else(|| {
            crate::config::ConfigError::UnknownProfile(self.config.profile.clone())
        })?;

        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(ConcurrencyGate::new(self.config.max_concurrency)));
        let limiter = Arc::new(OriginRateLimiter::new(RateLimiterConfig {
            rate_per_second: self.config.rate_per_second,
            burst: self.config.rate_burst,
        }));
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(ReqwestTransport::new(self.config.idle_connection_timeout))
        });

        let metrics = self.config.enable_metrics.then(MetricsRecorder::new);
        let mut events = EventBus::new();
        events.register(Arc::new(LogSubscriber));
        if let Some(recorder) = &metrics {
            events.register(Arc::new(recorder.clone()));
        }
        for subscriber in self.subscribers {
            events.register(subscriber);
        }

        Ok(Session {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                profile,
                jar: Arc::new(CookieJar::new()),
                gate,
                limiter,
                transport,
                events: Arc::new(events),
                metrics,
                resolver: self.resolver,
                counters: Counters::default(),
                closed: AtomicBool::new(false),
                config: self.config,
            }),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
