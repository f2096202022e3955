//! Per-request plumbing beneath the session facade.
//!
//! [`Exchange`] bundles the pieces one paced HTTP hop needs: profile, jar,
//! transport, limiter, event bus. `issue` performs exactly one hop (ticket,
//! header composition, cookie attachment, execution, cookie absorption, rate
//! feedback); `fetch` layers redirect following and the idempotent retry
//! policy on top. The solver drives its sub-conversation through the same
//! exchange, so every hop pays the same pacing and feeds the same jar.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::Method;
use url::Url;

use crate::cookies::CookieJar;
use crate::deadline::Deadline;
use crate::error::ClientError;
use crate::events::{Event, EventBus, SessionId};
use crate::fingerprint::{FingerprintProfile, HeaderSequence, compose_request_headers};
use crate::limiter::OriginRateLimiter;
use crate::transport::{RawResponse, Transport, TransportCall, TransportError};

/// Backoff schedule for retriable transport failures on idempotent requests.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

/// A request after the session resolved method, target, overrides, and body.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub overrides: HeaderSequence,
    pub body: Option<Bytes>,
}

pub(crate) struct Exchange {
    pub profile: &'static FingerprintProfile,
    pub transport: Arc<dyn Transport>,
    pub jar: Arc<CookieJar>,
    pub limiter: Arc<OriginRateLimiter>,
    pub events: Arc<EventBus>,
    pub session: SessionId,
    pub follow_redirects: u32,
}

/// Pacing key: host plus effective port.
pub(crate) fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

impl Exchange {
    /// One paced hop. The rate ticket is held until the response arrives;
    /// Set-Cookie is absorbed and the limiter hears about the status before
    /// anything is returned.
    pub async fn issue(
        &self,
        method: &Method,
        url: &Url,
        overrides: &HeaderSequence,
        body: Option<Bytes>,
        deadline: Deadline,
    ) -> Result<RawResponse, ClientError> {
        let origin = origin_of(url);
        let _ticket = self
            .limiter
            .acquire(&origin, deadline)
            .await
            .map_err(|_| ClientError::DeadlineExceeded)?;

        let mut headers = compose_request_headers(
            self.profile,
            url,
            method,
            body.as_ref().map(Bytes::len),
            overrides,
        );
        if let Some(cookie_header) = self.jar.attach_to_request(url) {
            headers.set("Cookie", cookie_header);
        }

        let call = TransportCall {
            profile: self.profile,
            method: method.clone(),
            url,
            headers: &headers,
            body,
            deadline,
        };

        let raw = match tokio::time::timeout(deadline.remaining(), self.transport.execute(call))
            .await
        {
            Err(_) => return Err(ClientError::DeadlineExceeded),
            Ok(Err(TransportError::DeadlineExceeded)) => return Err(ClientError::DeadlineExceeded),
            Ok(Err(source)) => {
                let retriable = source.retriable();
                return Err(ClientError::Transport { source, retriable });
            }
            Ok(Ok(raw)) => raw,
        };

        self.jar
            .absorb_response(url, raw.set_cookies())
            .map_err(|err| ClientError::Protocol(err.to_string()))?;

        let has_retry_after = raw.headers.contains("retry-after");
        if let Some(new_rate) = self
            .limiter
            .note_response(&origin, raw.status, has_retry_after)
            .await
        {
            self.events.dispatch(Event::RateLimitAdjusted {
                session: self.session,
                origin,
                new_rate,
                timestamp: Utc::now(),
            });
        }

        Ok(raw)
    }

    /// `issue` plus redirect following and the retry policy. Each redirect
    /// re-enters the jar, so Set-Cookie from intermediate hops is kept and
    /// cookies for the new target are attached.
    pub async fn fetch(
        &self,
        request: &PreparedRequest,
        deadline: Deadline,
    ) -> Result<RawResponse, ClientError> {
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut body = request.body.clone();
        let mut redirects = 0u32;

        loop {
            let raw = self
                .issue_with_retry(&method, &url, &request.overrides, body.clone(), deadline)
                .await?;

            if !raw.is_redirect() {
                return Ok(raw);
            }
            if redirects >= self.follow_redirects {
                return Err(ClientError::TooManyRedirects {
                    limit: self.follow_redirects,
                });
            }
            redirects += 1;

            let location = raw
                .location()
                .ok_or_else(|| ClientError::Protocol("redirect without Location".into()))?;
            url = url
                .join(location)
                .map_err(|err| ClientError::Protocol(format!("bad redirect target: {err}")))?;

            // Browsers rewrite the method on 303, and on 301/302 for POST.
            if raw.status == 303 || (matches!(raw.status, 301 | 302) && method == Method::POST) {
                method = Method::GET;
                body = None;
            }
        }
    }

    /// Retry transient transport failures, but only when the request is
    /// idempotent and no body was sent; a POST that died after transmitting
    /// its body is never re-sent.
    async fn issue_with_retry(
        &self,
        method: &Method,
        url: &Url,
        overrides: &HeaderSequence,
        body: Option<Bytes>,
        deadline: Deadline,
    ) -> Result<RawResponse, ClientError> {
        let may_retry =
            (*method == Method::GET || *method == Method::HEAD) && body.is_none();
        let mut backoff = RETRY_BACKOFF.iter();

        loop {
            match self.issue(method, url, overrides, body.clone(), deadline).await {
                Err(ClientError::Transport {
                    source,
                    retriable: true,
                }) if may_retry => match backoff.next() {
                    Some(wait) if *wait < deadline.remaining() => {
                        log::debug!("retrying {method} {url} after {source}");
                        tokio::time::sleep(*wait).await;
                    }
                    _ => {
                        return Err(ClientError::Transport {
                            source,
                            retriable: true,
                        });
                    }
                },
                other => return other,
            }
        }
    }
}
