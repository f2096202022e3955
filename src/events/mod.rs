//! Typed event stream published by the core.
//!
//! Consumers (logging, metrics exporters) subscribe at session construction.
//! Events carry structural data only: origins, kinds, durations, status
//! codes. Subscribers must not block; the provided channel subscriber moves
//! consumption onto the consumer's own task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;
use tokio::sync::mpsc;

use crate::challenge::{ChallengeKind, SolveFailure};
use crate::transport::Timing;

/// Opaque session correlation token. Responses and events carry this instead
/// of a reference back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    RequestStarted {
        session: SessionId,
        method: Method,
        origin: String,
        timestamp: DateTime<Utc>,
    },
    ChallengeDetected {
        session: SessionId,
        kind: ChallengeKind,
        origin: String,
        timestamp: DateTime<Utc>,
    },
    ChallengeSolved {
        session: SessionId,
        kind: ChallengeKind,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },
    ChallengeFailed {
        session: SessionId,
        cause: SolveFailure,
        timestamp: DateTime<Utc>,
    },
    RateLimitAdjusted {
        session: SessionId,
        origin: String,
        new_rate: f64,
        timestamp: DateTime<Utc>,
    },
    RequestCompleted {
        session: SessionId,
        status: u16,
        timing: Timing,
        timestamp: DateTime<Utc>,
    },
}

/// Trait implemented by event consumers. Implementations must return
/// quickly; hand the event to a channel or queue if processing is slow.
pub trait EventSubscriber: Send + Sync {
    fn publish(&self, event: &Event);
}

/// Broadcasts events to the subscribers registered at session build time.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn dispatch(&self, event: Event) {
        for subscriber in &self.subscribers {
            subscriber.publish(&event);
        }
    }
}

/// Logs events through the `log` facade.
#[derive(Debug)]
pub struct LogSubscriber;

impl EventSubscriber for LogSubscriber {
    fn publish(&self, event: &Event) {
        match event {
            Event::RequestStarted {
                session,
                method,
                origin,
                ..
            } => {
                log::debug!("{session} -> {method} {origin}");
            }
            Event::ChallengeDetected {
                session,
                kind,
                origin,
                ..
            } => {
                log::info!("{session} challenge {kind} at {origin}");
            }
            Event::ChallengeSolved {
                session,
                kind,
                duration,
                ..
            } => {
                log::info!(
                    "{session} solved {kind} in {:.2}s",
                    duration.as_secs_f64()
                );
            }
            Event::ChallengeFailed { session, cause, .. } => {
                log::warn!("{session} challenge failed: {cause}");
            }
            Event::RateLimitAdjusted {
                session,
                origin,
                new_rate,
                ..
            } => {
                log::info!("{session} rate for {origin} now {new_rate:.3}/s");
            }
            Event::RequestCompleted {
                session,
                status,
                timing,
                ..
            } => {
                log::debug!(
                    "{session} <- {status} ({:.0}ms)",
                    timing.total.as_secs_f64() * 1000.0
                );
            }
        }
    }
}

/// Forwards events into an unbounded channel so the consumer drains them on
/// its own task. A full or closed receiver never blocks the pipeline.
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelSubscriber {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn publish(&self, event: &Event) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.sender.send(event.clone());
    }
}
