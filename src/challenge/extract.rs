//! Interstitial page parsing.
//!
//! Pulls the three things the solver needs out of challenge HTML: the form
//! action, the hidden fields the edge expects back, and the script body to
//! evaluate. Failures are split into transient (body cut off mid-form, worth
//! re-fetching) and structural (page shape we do not understand).

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use url::Url;

/// Hidden fields the edge requires on resubmission.
const REQUIRED_FIELDS: &[&str] = &["r", "jschl_vc", "pass"];

static FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"(?si)<form[^>]*id=['"]challenge-form['"][^>]*action=['"](?P<action>[^"']*__cf_chl_f_tk=[^"']+)['"][^>]*>(?P<inputs>.*?)</form>"#,
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .expect("challenge form regex")
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?si)<input\s+([^>]+?)/?>"#)
        .build()
        .expect("input regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?si)(?P<name>[^\s=]+)=['"](?P<value>[^'"]*)['"]"#)
        .build()
        .expect("attribute regex")
});

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(?is)<script[^>]*>(?P<body>.*?)</script>")
        .dot_matches_new_line(true)
        .build()
        .expect("script regex")
});

static DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"submit\(\);\r?\n?\s*\},\s*([0-9]+)")
        .case_insensitive(true)
        .build()
        .expect("delay regex")
});

/// The resubmission form as found on the page.
#[derive(Debug, Clone)]
pub struct ChallengeForm {
    /// Relative or absolute action attribute, HTML-entity decoded.
    pub action: String,
    /// Hidden fields in page order.
    pub fields: Vec<(String, String)>,
}

impl ChallengeForm {
    /// Resolve the action against the page URL.
    pub fn submit_url(&self, base: &Url) -> Result<Url, ExtractError> {
        base.join(&self.action).map_err(ExtractError::InvalidAction)
    }
}

/// Everything the solver needs from one interstitial page.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub form: ChallengeForm,
    /// Concatenated inline script bodies, outermost first.
    pub script: String,
    /// Delay the page asks the browser to wait before submitting.
    pub submit_delay: Duration,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("challenge form not found")]
    FormNotFound {
        /// True when the body was truncated, so the form may simply be
        /// missing from the prefix we saw.
        truncated: bool,
    },
    #[error("challenge form is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("challenge form action does not resolve: {0}")]
    InvalidAction(url::ParseError),
    #[error("challenge page contains no executable script")]
    NoScript,
}

impl ExtractError {
    /// Transient failures are worth one re-fetch of the page.
    pub fn transient(&self) -> bool {
        matches!(self, ExtractError::FormNotFound { truncated: true })
    }
}

/// Parse an interstitial page.
pub fn extract_interstitial(body: &str, truncated: bool) -> Result<Extraction, ExtractError> {
    let captures = FORM_RE
        .captures(body)
        .ok_or(ExtractError::FormNotFound { truncated })?;

    let action = captures
        .name("action")
        .map(|m| html_escape::decode_html_entities(m.as_str()).into_owned())
        .ok_or(ExtractError::FormNotFound { truncated })?;

    let inputs = captures.name("inputs").map(|m| m.as_str()).unwrap_or("");
    let fields = hidden_fields(inputs)?;

    let script = inline_scripts(body);
    if script.is_empty() {
        return Err(ExtractError::NoScript);
    }

    Ok(Extraction {
        form: ChallengeForm { action, fields },
        script,
        submit_delay: submit_delay(body),
    })
}

fn hidden_fields(fragment: &str) -> Result<Vec<(String, String)>, ExtractError> {
    let mut fields = Vec::new();

    for caps in INPUT_RE.captures_iter(fragment) {
        let attributes = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut name: Option<String> = None;
        let mut value: Option<String> = None;

        for attr in ATTR_RE.captures_iter(attributes) {
            if let (Some(attr_name), Some(attr_value)) = (attr.name("name"), attr.name("value")) {
                match attr_name.as_str().to_ascii_lowercase().as_str() {
                    "name" => name = Some(attr_value.as_str().to_string()),
                    "value" => value = Some(attr_value.as_str().to_string()),
                    _ => {}
                }
            }
        }

        if let (Some(name), Some(value)) = (name, value)
            && REQUIRED_FIELDS.contains(&name.as_str())
        {
            fields.push((name, value));
        }
    }

    for required in REQUIRED_FIELDS {
        if !fields.iter().any(|(name, _)| name == required) {
            return Err(ExtractError::MissingField(required));
        }
    }

    Ok(fields)
}

/// All inline script bodies joined in document order. External script tags
/// contribute nothing; the sandbox only ever sees what is on the page.
fn inline_scripts(html: &str) -> String {
    SCRIPT_RE
        .captures_iter(html)
        .filter_map(|caps| caps.name("body").map(|m| m.as_str().trim()))
        .filter(|body| !body.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Delay before resubmission, as the page's own setTimeout dictates.
/// Pages without one submit immediately.
fn submit_delay(body: &str) -> Duration {
    DELAY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}
