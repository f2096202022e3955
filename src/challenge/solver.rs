//! Challenge solver state machine.
//!
//! Drives detect → extract → evaluate → resubmit → verify as a loop over a
//! closed state set. Every transition is a total match on the detected
//! challenge kind; attempt accounting, deadline checks, and the managed-wait
//! clamp all live here. Sub-requests go through the same [`Exchange`] as
//! ordinary traffic, so they are paced per origin and feed the session jar.

use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

use super::detector::{Detection, DetectionEvidence, classify};
use super::extract::{Extraction, extract_interstitial};
use super::{ChallengeKind, ChallengeRecord, InteractiveResolver, SolveFailure};
use crate::deadline::Deadline;
use crate::error::ClientError;
use crate::fingerprint::HeaderSequence;
use crate::pipeline::{Exchange, PreparedRequest};
use crate::sandbox::{Sandbox, SandboxLimits, ShimState};
use crate::transport::RawResponse;

/// Managed-wait interval bounds and fallback.
const WAIT_MIN: Duration = Duration::from_secs(1);
const WAIT_MAX: Duration = Duration::from_secs(30);
const WAIT_DEFAULT: Duration = Duration::from_secs(5);

static SITE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-sitekey=["']([^"']+)["']"#).expect("site key regex"));

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("deadline exceeded during challenge handling")]
    Deadline,
    #[error("challenge could not be solved: {reason}")]
    Unsolvable {
        reason: SolveFailure,
        record: Box<ChallengeRecord>,
        status: u16,
        headers: HeaderSequence,
    },
}

pub struct Solver {
    pub max_attempts: u32,
    pub sandbox_limits: SandboxLimits,
    pub resolver: Option<Arc<dyn InteractiveResolver>>,
}

/// Mutable solve bookkeeping, folded into the immutable record at the end.
struct Progress {
    kind: ChallengeKind,
    detected_at: DateTime<Utc>,
    started: Instant,
    attempts: u32,
    form_fields: Vec<(String, String)>,
    solution: Option<String>,
}

impl Progress {
    fn record(&self, success: bool, failure: Option<SolveFailure>) -> ChallengeRecord {
        ChallengeRecord {
            kind: self.kind,
            detected_at: self.detected_at,
            form_fields: self.form_fields.clone(),
            solution: self.solution.clone(),
            solve_duration: self.started.elapsed(),
            attempts: self.attempts,
            success,
            failure,
        }
    }
}

impl Solver {
    /// Run the state machine to completion. On success the returned response
    /// is the one that cleared verification; the record is immutable from
    /// here on.
    pub async fn solve(
        &self,
        exchange: &Exchange,
        original: &PreparedRequest,
        first_response: RawResponse,
        first_kind: ChallengeKind,
        first_evidence: DetectionEvidence,
        deadline: Deadline,
    ) -> Result<(RawResponse, ChallengeRecord), SolveError> {
        let mut progress = Progress {
            kind: first_kind,
            detected_at: Utc::now(),
            started: Instant::now(),
            attempts: 0,
            form_fields: Vec::new(),
            solution: None,
        };
        let mut response = first_response;
        let mut detection = Detection {
            kind: Some(first_kind),
            evidence: first_evidence,
        };

        loop {
            let Some(kind) = detection.kind else {
                return Ok((response, progress.record(true, None)));
            };

            match kind {
                ChallengeKind::RateLimited => {
                    progress.attempts += 1;
                    if progress.attempts > self.max_attempts {
                        return Err(self.fail(SolveFailure::RateLimited, &progress, &response));
                    }
                    let wait = clamp_wait(retry_after(&response.headers));
                    self.sleep_within(wait, deadline).await?;
                    response = self.reissue(exchange, original, deadline, &progress, &response).await?;
                    detection = classify(&response);
                }
                ChallengeKind::ManagedWait => {
                    progress.attempts += 1;
                    if progress.attempts > self.max_attempts {
                        return Err(self.fail(SolveFailure::MaxAttempts, &progress, &response));
                    }
                    let wait = clamp_wait(retry_after(&response.headers).or_else(|| {
                        refresh_interval(&response.headers)
                    }));
                    self.sleep_within(wait, deadline).await?;
                    response = self.reissue(exchange, original, deadline, &progress, &response).await?;
                    detection = classify(&response);
                }
                ChallengeKind::Interactive => {
                    let Some(resolver) = &self.resolver else {
                        return Err(self.fail(SolveFailure::Interactive, &progress, &response));
                    };
                    let body = response.body_text();
                    let Some(site_key) = site_key(&body) else {
                        return Err(self.fail(SolveFailure::Extract, &progress, &response));
                    };
                    let token = match resolver.resolve(&site_key, &response.url).await {
                        Ok(token) => token,
                        Err(err) => {
                            log::warn!("interactive resolver failed: {err}");
                            return Err(self.fail(SolveFailure::Interactive, &progress, &response));
                        }
                    };
                    progress.solution = Some(token.clone());

                    response = match extract_interstitial(&body, response.truncated) {
                        Ok(extraction) => {
                            progress.form_fields = extraction.form.fields.clone();
                            self.resubmit(
                                exchange,
                                original,
                                &response,
                                &extraction,
                                vec![("cf-turnstile-response".to_string(), token)],
                                deadline,
                                &progress,
                            )
                            .await?
                        }
                        // No form on the page: the token travels with a
                        // plain re-issue and the edge pairs it server-side.
                        Err(_) => {
                            self.reissue(exchange, original, deadline, &progress, &response)
                                .await?
                        }
                    };

                    progress.attempts += 1;
                    match self.verdict(exchange, original, &response) {
                        Verdict::Cleared => {
                            return Ok((response, progress.record(true, None)));
                        }
                        Verdict::StillChallenged(next) => {
                            if progress.attempts > self.max_attempts {
                                return Err(self.fail(
                                    SolveFailure::Verify,
                                    &progress,
                                    &response,
                                ));
                            }
                            detection = next;
                        }
                    }
                }
                ChallengeKind::JsInterstitial => {
                    let body = response.body_text();
                    let truncated = response.truncated || detection.evidence.truncated;
                    let extraction = match extract_interstitial(&body, truncated) {
                        Ok(extraction) => extraction,
                        Err(err) if err.transient() && progress.attempts < self.max_attempts => {
                            progress.attempts += 1;
                            response = self
                                .reissue(exchange, original, deadline, &progress, &response)
                                .await?;
                            detection = classify(&response);
                            continue;
                        }
                        Err(err) => {
                            log::debug!("challenge extraction failed: {err}");
                            return Err(self.fail(SolveFailure::Extract, &progress, &response));
                        }
                    };
                    progress.form_fields = extraction.form.fields.clone();

                    let sandbox = Sandbox::new(self.sandbox_limits);
                    let shim = ShimState {
                        host: original.url.host_str().unwrap_or_default().to_string(),
                        user_agent: exchange.profile.user_agent().to_string(),
                    };
                    let value = match sandbox.evaluate(extraction.script.clone(), shim).await {
                        Ok(value) => value,
                        Err(err) => {
                            log::debug!("sandbox evaluation failed: {err}");
                            return Err(self.fail(SolveFailure::Sandbox, &progress, &response));
                        }
                    };
                    let answer = answer_string(&value);
                    progress.solution = Some(answer.clone());

                    response = self
                        .resubmit(
                            exchange,
                            original,
                            &response,
                            &extraction,
                            vec![("jschl_answer".to_string(), answer)],
                            deadline,
                            &progress,
                        )
                        .await?;

                    progress.attempts += 1;
                    match self.verdict(exchange, original, &response) {
                        Verdict::Cleared => {
                            return Ok((response, progress.record(true, None)));
                        }
                        Verdict::StillChallenged(_) => {
                            if progress.attempts > self.max_attempts {
                                return Err(self.fail(SolveFailure::Verify, &progress, &response));
                            }
                            response = self
                                .reissue(exchange, original, deadline, &progress, &response)
                                .await?;
                            detection = classify(&response);
                        }
                    }
                }
            }
        }
    }

    /// Resubmission: wait the page-mandated delay, POST the form with the
    /// computed payload appended, and follow a redirect by re-issuing the
    /// original request so the final body is the protected resource.
    #[allow(clippy::too_many_arguments)]
    async fn resubmit(
        &self,
        exchange: &Exchange,
        original: &PreparedRequest,
        challenge_response: &RawResponse,
        extraction: &Extraction,
        payload: Vec<(String, String)>,
        deadline: Deadline,
        progress: &Progress,
    ) -> Result<RawResponse, SolveError> {
        let submit_url = extraction
            .form
            .submit_url(&challenge_response.url)
            .map_err(|_| self.fail(SolveFailure::Extract, progress, challenge_response))?;

        if !extraction.submit_delay.is_zero() {
            self.sleep_within(extraction.submit_delay, deadline).await?;
        }

        let mut form: Vec<(String, String)> = extraction.form.fields.clone();
        form.extend(payload);
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .finish();

        let mut overrides = HeaderSequence::new();
        overrides.push("Content-Type", "application/x-www-form-urlencoded");
        overrides.push("Referer", challenge_response.url.as_str());
        overrides.push("Origin", origin_header(&challenge_response.url));

        let submitted = exchange
            .issue(
                &http::Method::POST,
                &submit_url,
                &overrides,
                Some(body.into_bytes().into()),
                deadline,
            )
            .await
            .map_err(|err| self.map_client_error(err, progress, challenge_response))?;

        if submitted.is_redirect() {
            // The clearance is in the jar now; fetch the protected resource.
            self.reissue(exchange, original, deadline, progress, &submitted)
                .await
        } else {
            Ok(submitted)
        }
    }

    /// Verification: a tagged clearance cookie, or a 200 that no longer
    /// classifies as a challenge.
    fn verdict(
        &self,
        exchange: &Exchange,
        original: &PreparedRequest,
        response: &RawResponse,
    ) -> Verdict {
        if exchange.jar.has_valid_clearance(&original.url) {
            return Verdict::Cleared;
        }
        let detection = classify(response);
        if response.status == 200 && !detection.is_challenge() {
            return Verdict::Cleared;
        }
        Verdict::StillChallenged(detection)
    }

    async fn reissue(
        &self,
        exchange: &Exchange,
        original: &PreparedRequest,
        deadline: Deadline,
        progress: &Progress,
        last_response: &RawResponse,
    ) -> Result<RawResponse, SolveError> {
        exchange
            .fetch(original, deadline)
            .await
            .map_err(|err| self.map_client_error(err, progress, last_response))
    }

    async fn sleep_within(&self, wait: Duration, deadline: Deadline) -> Result<(), SolveError> {
        if wait >= deadline.remaining() {
            return Err(SolveError::Deadline);
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }

    fn fail(
        &self,
        reason: SolveFailure,
        progress: &Progress,
        response: &RawResponse,
    ) -> SolveError {
        SolveError::Unsolvable {
            reason,
            record: Box::new(progress.record(false, Some(reason))),
            status: response.status,
            headers: response.headers.clone(),
        }
    }

    fn map_client_error(
        &self,
        err: ClientError,
        progress: &Progress,
        response: &RawResponse,
    ) -> SolveError {
        match err {
            ClientError::DeadlineExceeded => SolveError::Deadline,
            other => {
                log::debug!("solver sub-request failed: {other}");
                self.fail(SolveFailure::Verify, progress, response)
            }
        }
    }
}

enum Verdict {
    Cleared,
    StillChallenged(Detection),
}

/// The edge compares answers as strings; numbers travel with ten decimal
/// places, everything else verbatim.
fn answer_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(number) => match number.as_f64() {
            Some(float) => format!("{float:.10}"),
            None => number.to_string(),
        },
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Retry-After: delta-seconds, or an HTTP date.
fn retry_after(headers: &HeaderSequence) -> Option<Duration> {
    let raw = headers.get("retry-after")?.trim();

    if let Ok(seconds) = raw.parse::<f64>()
        && seconds.is_finite()
        && seconds >= 0.0
    {
        return Some(Duration::from_secs_f64(seconds));
    }

    let date = DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()?;
    (date.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

/// `Refresh: 5; url=/...` style intervals on managed waiting pages.
fn refresh_interval(headers: &HeaderSequence) -> Option<Duration> {
    let raw = headers.get("refresh")?;
    let seconds = raw.split(';').next()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

fn clamp_wait(wait: Option<Duration>) -> Duration {
    wait.unwrap_or(WAIT_DEFAULT).clamp(WAIT_MIN, WAIT_MAX)
}

fn site_key(body: &str) -> Option<String> {
    SITE_KEY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|key| key.as_str().to_string())
}

fn origin_header(url: &url::Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}
