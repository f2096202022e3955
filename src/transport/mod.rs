//! Transport abstraction.
//!
//! A [`Transport`] performs exactly one HTTP exchange: no redirects, no
//! cookie handling, no challenge logic. Everything stateful lives above it in
//! the session pipeline, which is also what lets tests substitute a scripted
//! transport for the real network.

pub mod reqwest_backend;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use thiserror::Error;
use url::Url;

use crate::deadline::Deadline;
use crate::fingerprint::{FingerprintProfile, HeaderSequence};

pub use reqwest_backend::ReqwestTransport;

/// One request as handed to a transport: fully composed headers, resolved
/// deadline, nothing left to decide.
pub struct TransportCall<'a> {
    pub profile: &'a FingerprintProfile,
    pub method: Method,
    pub url: &'a Url,
    pub headers: &'a HeaderSequence,
    pub body: Option<Bytes>,
    pub deadline: Deadline,
}

/// Per-phase timing for one exchange. Phases a backend cannot observe stay
/// `None`; `total` is always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
    pub first_byte: Option<Duration>,
    pub total: Duration,
}

/// Raw outcome of one exchange, body materialized up to the backend's cap.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderSequence,
    pub body: Bytes,
    pub url: Url,
    pub timing: Timing,
    /// True when the body was cut off at the buffer cap; detection evidence
    /// downstream is marked incomplete.
    pub truncated: bool,
}

impl RawResponse {
    pub fn set_cookies(&self) -> impl Iterator<Item = &str> {
        self.headers.get_all("set-cookie")
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("location")
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failures below the HTTP layer. 4xx/5xx responses are not errors; they come
/// back as [`RawResponse`] and the caller decides.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("i/o failed mid-exchange: {0}")]
    Io(String),
    #[error("deadline exceeded during exchange")]
    DeadlineExceeded,
    #[error("peer violated the protocol: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Transient failures that an idempotent request may retry.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            TransportError::Dns(_) | TransportError::Connect(_) | TransportError::Io(_)
        )
    }
}

/// A single-exchange HTTP executor bound to a fingerprint profile.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, call: TransportCall<'_>) -> Result<RawResponse, TransportError>;

    /// Release pooled connections. Default: nothing to release.
    async fn close(&self) {}
}
