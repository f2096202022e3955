//! Challenge classification.
//!
//! One pass over status + headers + body prefix, applying the detection rules
//! in strict precedence order. The body is scanned at most once per marker;
//! a body truncated at the transport's buffer cap marks the evidence
//! incomplete so the solver knows not to treat "marker absent" as proof.

use once_cell::sync::Lazy;
use regex::Regex;

use super::ChallengeKind;
use crate::fingerprint::HeaderSequence;
use crate::transport::RawResponse;

/// Minimum body prefix the detector expects to see.
pub const BODY_SCAN_LIMIT: usize = 16 * 1024;

/// Body markers for the JavaScript interstitial; both must fire.
const MARKER_CHALLENGE_PLATFORM: &str = "/cdn-cgi/challenge-platform/";
const MARKER_CHL_OPT: &str = "window._cf_chl_opt";
/// Turnstile widget marker.
const MARKER_TURNSTILE: &str = "cf-turnstile";
/// Managed-challenge markers; either identifies the waiting page.
const MARKER_CHL_CTX: &str = "window._cf_chl_ctx";
const MARKER_BROWSER_CHECK: &str = "cf-browser-verification";

static RAY_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Ray ID:?\s*(?:</span>\s*)?<?\s*([a-f0-9]{8,16})").expect("ray id regex")
});

/// Which markers fired, and whether the body was complete when we looked.
#[derive(Debug, Clone, Default)]
pub struct DetectionEvidence {
    pub markers: Vec<&'static str>,
    pub truncated: bool,
    pub ray_id: Option<String>,
}

/// Classification outcome: `kind` is `None` for ordinary responses.
#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: Option<ChallengeKind>,
    pub evidence: DetectionEvidence,
}

impl Detection {
    pub fn is_challenge(&self) -> bool {
        self.kind.is_some()
    }
}

/// Classify a response. Precedence, top to bottom: rate limit, JavaScript
/// interstitial, interactive widget, managed wait, none.
pub fn classify(response: &RawResponse) -> Detection {
    classify_parts(
        response.status,
        &response.headers,
        &response.body,
        response.truncated,
    )
}

pub fn classify_parts(
    status: u16,
    headers: &HeaderSequence,
    body: &[u8],
    truncated: bool,
) -> Detection {
    let body = String::from_utf8_lossy(body);
    let mut evidence = DetectionEvidence {
        truncated,
        ray_id: ray_id(headers, &body),
        ..Default::default()
    };

    if status == 429 {
        evidence.markers.push("status-429");
        if header_equals(headers, "cf-mitigated", "challenge") {
            evidence.markers.push("cf-mitigated");
        }
        return Detection {
            kind: Some(ChallengeKind::RateLimited),
            evidence,
        };
    }

    let from_cloudflare = headers
        .get("server")
        .is_some_and(|server| server.to_ascii_lowercase().starts_with("cloudflare"));

    if status == 403
        && from_cloudflare
        && body.contains(MARKER_CHALLENGE_PLATFORM)
        && body.contains(MARKER_CHL_OPT)
    {
        evidence.markers.push(MARKER_CHALLENGE_PLATFORM);
        evidence.markers.push(MARKER_CHL_OPT);
        return Detection {
            kind: Some(ChallengeKind::JsInterstitial),
            evidence,
        };
    }

    if body.contains(MARKER_TURNSTILE) {
        evidence.markers.push(MARKER_TURNSTILE);
        return Detection {
            kind: Some(ChallengeKind::Interactive),
            evidence,
        };
    }

    if status == 503 {
        if body.contains(MARKER_CHL_CTX) {
            evidence.markers.push(MARKER_CHL_CTX);
        }
        if body.contains(MARKER_BROWSER_CHECK) {
            evidence.markers.push(MARKER_BROWSER_CHECK);
        }
        if !evidence.markers.is_empty() {
            return Detection {
                kind: Some(ChallengeKind::ManagedWait),
                evidence,
            };
        }
    }

    Detection {
        kind: None,
        evidence,
    }
}

fn header_equals(headers: &HeaderSequence, name: &str, expected: &str) -> bool {
    headers
        .get(name)
        .is_some_and(|value| value.eq_ignore_ascii_case(expected))
}

fn ray_id(headers: &HeaderSequence, body: &str) -> Option<String> {
    if let Some(ray) = headers.get("cf-ray") {
        return Some(ray.split('-').next().unwrap_or(ray).to_string());
    }
    RAY_ID_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|ray| ray.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderSequence {
        pairs.iter().map(|(n, v)| (*n, *v)).collect()
    }

    fn interstitial_body() -> String {
        format!(
            "<html><script src=\"{MARKER_CHALLENGE_PLATFORM}orchestrate/jsch/v1\"></script>\
             <script>{MARKER_CHL_OPT} = {{cvId: '3'}};</script></html>"
        )
    }

    #[test]
    fn plain_response_is_none() {
        let detection = classify_parts(200, &headers(&[]), b"<html>ok</html>", false);
        assert!(detection.kind.is_none());
        assert!(detection.evidence.markers.is_empty());
    }

    #[test]
    fn status_429_wins_over_everything() {
        let detection = classify_parts(
            429,
            &headers(&[("server", "cloudflare"), ("cf-mitigated", "challenge")]),
            interstitial_body().as_bytes(),
            false,
        );
        assert_eq!(detection.kind, Some(ChallengeKind::RateLimited));
        assert!(detection.evidence.markers.contains(&"cf-mitigated"));
    }

    #[test]
    fn js_interstitial_requires_both_markers_and_server() {
        let hdrs = headers(&[("server", "cloudflare")]);
        let detection = classify_parts(403, &hdrs, interstitial_body().as_bytes(), false);
        assert_eq!(detection.kind, Some(ChallengeKind::JsInterstitial));

        // Missing the opt marker: not an interstitial.
        let partial = format!("<script src=\"{MARKER_CHALLENGE_PLATFORM}x\"></script>");
        let detection = classify_parts(403, &hdrs, partial.as_bytes(), false);
        assert!(detection.kind.is_none());

        // Right body, wrong server header: not an interstitial.
        let detection = classify_parts(
            403,
            &headers(&[("server", "nginx")]),
            interstitial_body().as_bytes(),
            false,
        );
        assert!(detection.kind.is_none());
    }

    #[test]
    fn turnstile_marker_is_interactive() {
        let body = b"<div class=\"cf-turnstile\" data-sitekey=\"k\"></div>";
        let detection = classify_parts(403, &headers(&[("server", "cloudflare")]), body, false);
        assert_eq!(detection.kind, Some(ChallengeKind::Interactive));
    }

    #[test]
    fn managed_wait_on_503_with_token() {
        let body = b"<html>window._cf_chl_ctx = {}; please wait</html>";
        let detection = classify_parts(503, &headers(&[("server", "cloudflare")]), body, false);
        assert_eq!(detection.kind, Some(ChallengeKind::ManagedWait));

        let detection = classify_parts(503, &headers(&[]), b"maintenance window", false);
        assert!(detection.kind.is_none());
    }

    #[test]
    fn truncation_flag_flows_through() {
        let detection = classify_parts(403, &headers(&[("server", "cloudflare")]), b"<htm", true);
        assert!(detection.kind.is_none());
        assert!(detection.evidence.truncated);
    }

    #[test]
    fn ray_id_from_header_or_body() {
        let detection = classify_parts(
            429,
            &headers(&[("cf-ray", "8aabbccdd1234-FRA")]),
            b"",
            false,
        );
        assert_eq!(detection.evidence.ray_id.as_deref(), Some("8aabbccdd1234"));

        let detection = classify_parts(
            503,
            &headers(&[]),
            b"window._cf_chl_ctx = {}; Ray ID: 1a2b3c4d5e6f",
            false,
        );
        assert_eq!(detection.evidence.ray_id.as_deref(), Some("1a2b3c4d5e6f"));
    }
}
