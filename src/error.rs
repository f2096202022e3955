//! Error taxonomy surfaced by the session.
//!
//! Every variant carries a short stable code for metrics labels. Where the
//! failure happened at or after the first response byte, the partial
//! response (status + headers) rides along for diagnostics.

use thiserror::Error;

use crate::challenge::{ChallengeRecord, SolveFailure};
use crate::config::ConfigError;
use crate::fingerprint::HeaderSequence;
use crate::transport::TransportError;

/// Status and headers of a response that was received but not returned.
#[derive(Debug, Clone)]
pub struct PartialResponse {
    pub status: u16,
    pub headers: HeaderSequence,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: TransportError,
        retriable: bool,
    },
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("redirect limit of {limit} exceeded")]
    TooManyRedirects { limit: u32 },
    #[error("no permit became available before the deadline")]
    GateBusy,
    #[error("origin '{host}' is not in the session whitelist")]
    OriginDenied { host: String },
    #[error("challenge could not be solved: {reason}")]
    ChallengeUnsolvable {
        reason: SolveFailure,
        record: Box<ChallengeRecord>,
        partial: Option<PartialResponse>,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Short stable identifier, suitable as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Transport { .. } => "transport",
            ClientError::DeadlineExceeded => "deadline",
            ClientError::TooManyRedirects { .. } => "redirects",
            ClientError::GateBusy => "gate_busy",
            ClientError::OriginDenied { .. } => "origin_denied",
            ClientError::ChallengeUnsolvable { .. } => "challenge",
            ClientError::Protocol(_) => "protocol",
            ClientError::Closed => "closed",
            ClientError::Config(_) => "config",
        }
    }

    pub fn retriable(&self) -> bool {
        matches!(self, ClientError::Transport { retriable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ClientError::DeadlineExceeded.code(), "deadline");
        assert_eq!(ClientError::GateBusy.code(), "gate_busy");
        assert_eq!(
            ClientError::OriginDenied {
                host: "b.example.test".into()
            }
            .code(),
            "origin_denied"
        );
    }

    #[test]
    fn only_transient_transport_failures_are_retriable() {
        let retriable = ClientError::Transport {
            source: TransportError::Connect("refused".into()),
            retriable: true,
        };
        assert!(retriable.retriable());
        assert!(!ClientError::DeadlineExceeded.retriable());
    }
}
