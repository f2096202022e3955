//! Session-scoped cookie jar.
//!
//! RFC 6265 storage with one enrichment: cookies the edge uses for bot
//! management and clearance are tagged on the way in, so the solver can ask
//! "is a prior solution still valid?" without string-matching every lookup.
//!
//! The jar lives behind a single mutex owned by its session. Critical
//! sections are short (vector scans over at most `capacity` entries); readers
//! get a consistent snapshot, never a partial update.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use url::Url;

/// Known edge cookie names, tagged for fast lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeCookie {
    /// `cf_clearance`: issued after a solved challenge.
    Clearance,
    /// `__cf_bm`: bot-management session cookie.
    BotManagement,
}

impl EdgeCookie {
    pub fn classify(name: &str) -> Option<Self> {
        match name {
            "cf_clearance" => Some(EdgeCookie::Clearance),
            "__cf_bm" => Some(EdgeCookie::BotManagement),
            _ => None,
        }
    }
}

/// One stored cookie plus the bookkeeping the jar needs.
#[derive(Debug, Clone)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub host_only: bool,
    pub path: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub edge_tag: Option<EdgeCookie>,
    /// Monotonic set-order, used for LRU eviction and serialisation order.
    seq: u64,
}

impl StoredCookie {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn domain_matches(&self, host: &str) -> bool {
        if self.host_only {
            return host.eq_ignore_ascii_case(&self.domain);
        }
        let host = host.to_ascii_lowercase();
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if !request_path.starts_with(&self.path) {
            return false;
        }
        self.path.ends_with('/')
            || request_path.as_bytes().get(self.path.len()) == Some(&b'/')
    }
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("malformed Set-Cookie header: {0}")]
    Malformed(String),
}

struct JarState {
    cookies: Vec<StoredCookie>,
    next_seq: u64,
}

/// Per-session cookie jar with bounded capacity.
pub struct CookieJar {
    state: Mutex<JarState>,
    capacity: usize,
    strict: bool,
}

/// Default capacity bound per jar.
pub const DEFAULT_CAPACITY: usize = 1_000;

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(JarState {
                cookies: Vec::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            strict: false,
        }
    }

    /// Strict jars reject malformed Set-Cookie headers instead of skipping
    /// them.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Store every Set-Cookie from a response, replacing on the
    /// (name, domain, path) triple and evicting least-recently-set cookies
    /// over capacity. Cookies whose Domain attribute does not cover the
    /// response host are discarded.
    pub fn absorb_response<'a>(
        &self,
        url: &Url,
        set_cookies: impl Iterator<Item = &'a str>,
    ) -> Result<usize, CookieError> {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return Ok(0),
        };
        let now = Utc::now();
        let mut guard = self.state.lock().expect("cookie jar lock poisoned");
        let mut absorbed = 0usize;

        for raw in set_cookies {
            let parsed = match cookie::Cookie::parse(raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    if self.strict {
                        return Err(CookieError::Malformed(err.to_string()));
                    }
                    log::debug!("discarding malformed Set-Cookie: {err}");
                    continue;
                }
            };

            let (domain, host_only) = match parsed.domain() {
                Some(domain) => {
                    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                    let covers = host == domain || host.ends_with(&format!(".{domain}"));
                    if !covers {
                        log::debug!(
                            "discarding cookie '{}' scoped to foreign domain '{domain}'",
                            parsed.name()
                        );
                        continue;
                    }
                    (domain, false)
                }
                None => (host.clone(), true),
            };

            let expires_at = cookie_expiry(&parsed, now);
            let seq = guard.next_seq;
            guard.next_seq += 1;

            let stored = StoredCookie {
                name: parsed.name().to_string(),
                value: parsed.value().to_string(),
                domain,
                host_only,
                path: parsed
                    .path()
                    .map(str::to_string)
                    .unwrap_or_else(|| default_path(url)),
                expires_at,
                secure: parsed.secure().unwrap_or(false),
                http_only: parsed.http_only().unwrap_or(false),
                same_site: parsed.same_site().map(|s| s.to_string()),
                edge_tag: EdgeCookie::classify(parsed.name()),
                seq,
            };

            guard.cookies.retain(|existing| {
                !(existing.name == stored.name
                    && existing.domain == stored.domain
                    && existing.path == stored.path)
            });
            guard.cookies.push(stored);
            absorbed += 1;
        }

        guard.cookies.retain(|cookie| !cookie.expired(now));
        while guard.cookies.len() > self.capacity {
            if let Some(oldest) = guard
                .cookies
                .iter()
                .enumerate()
                .min_by_key(|(_, cookie)| cookie.seq)
                .map(|(index, _)| index)
            {
                guard.cookies.remove(oldest);
            }
        }

        Ok(absorbed)
    }

    /// Serialise the Cookie header for a request: matching cookies ordered by
    /// longest path first, then by set time. Expired cookies are pruned here,
    /// not on a timer.
    pub fn attach_to_request(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let https = url.scheme() == "https";
        let now = Utc::now();

        let mut guard = self.state.lock().expect("cookie jar lock poisoned");
        guard.cookies.retain(|cookie| !cookie.expired(now));

        let mut matching: Vec<&StoredCookie> = guard
            .cookies
            .iter()
            .filter(|cookie| {
                cookie.domain_matches(&host)
                    && cookie.path_matches(path)
                    && (!cookie.secure || https)
            })
            .collect();

        if matching.is_empty() {
            return None;
        }

        matching.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.seq.cmp(&b.seq))
        });

        Some(
            matching
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// True when a non-expired clearance cookie covers this URL: the signal
    /// that a prior challenge solution is still valid.
    pub fn has_valid_clearance(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let now = Utc::now();
        let guard = self.state.lock().expect("cookie jar lock poisoned");
        guard.cookies.iter().any(|cookie| {
            cookie.edge_tag == Some(EdgeCookie::Clearance)
                && !cookie.expired(now)
                && cookie.domain_matches(host)
        })
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("cookie jar lock poisoned")
            .cookies
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of the jar contents, for snapshots and tests.
    pub fn snapshot(&self) -> Vec<StoredCookie> {
        self.state
            .lock()
            .expect("cookie jar lock poisoned")
            .cookies
            .clone()
    }
}

/// Max-Age wins over Expires, per RFC 6265 §5.3.
fn cookie_expiry(parsed: &cookie::Cookie<'_>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(max_age) = parsed.max_age() {
        return Some(now + ChronoDuration::seconds(max_age.whole_seconds()));
    }
    match parsed.expires() {
        Some(expiration) => expiration
            .datetime()
            .and_then(|at| DateTime::<Utc>::from_timestamp(at.unix_timestamp(), 0)),
        None => None,
    }
}

/// Default-path computation from RFC 6265 §5.1.4.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() || !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> Url {
        Url::parse(input).unwrap()
    }

    #[test]
    fn round_trips_simple_cookies() {
        let jar = CookieJar::new();
        let target = url("https://example.test/app/page");
        jar.absorb_response(&target, ["sid=abc123; Path=/", "theme=dark"].into_iter())
            .unwrap();

        let header = jar.attach_to_request(&target).unwrap();
        assert_eq!(header, "sid=abc123; theme=dark");
    }

    #[test]
    fn replaces_on_name_domain_path() {
        let jar = CookieJar::new();
        let target = url("https://example.test/");
        jar.absorb_response(&target, ["sid=old; Path=/"].into_iter())
            .unwrap();
        jar.absorb_response(&target, ["sid=new; Path=/"].into_iter())
            .unwrap();

        assert_eq!(jar.len(), 1);
        assert_eq!(jar.attach_to_request(&target).unwrap(), "sid=new");
    }

    #[test]
    fn rejects_foreign_domain() {
        let jar = CookieJar::new();
        jar.absorb_response(
            &url("https://a.example.test/"),
            ["evil=1; Domain=other.test"].into_iter(),
        )
        .unwrap();
        assert!(jar.is_empty());
    }

    #[test]
    fn domain_cookie_covers_subdomains() {
        let jar = CookieJar::new();
        jar.absorb_response(
            &url("https://www.example.test/"),
            ["cf_clearance=tok; Domain=example.test; Path=/"].into_iter(),
        )
        .unwrap();

        assert!(jar.has_valid_clearance(&url("https://api.example.test/")));
        assert_eq!(
            jar.attach_to_request(&url("https://api.example.test/x")).unwrap(),
            "cf_clearance=tok"
        );
    }

    #[test]
    fn secure_cookies_skip_plain_http() {
        let jar = CookieJar::new();
        jar.absorb_response(
            &url("https://example.test/"),
            ["sid=s3cret; Secure; Path=/"].into_iter(),
        )
        .unwrap();

        assert!(jar.attach_to_request(&url("http://example.test/")).is_none());
        assert!(jar.attach_to_request(&url("https://example.test/")).is_some());
    }

    #[test]
    fn expired_cookies_prune_on_read() {
        let jar = CookieJar::new();
        let target = url("https://example.test/");
        jar.absorb_response(&target, ["gone=1; Max-Age=0; Path=/"].into_iter())
            .unwrap();

        assert!(jar.attach_to_request(&target).is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_set() {
        let jar = CookieJar::with_capacity(2);
        let target = url("https://example.test/");
        jar.absorb_response(&target, ["a=1; Path=/"].into_iter()).unwrap();
        jar.absorb_response(&target, ["b=2; Path=/"].into_iter()).unwrap();
        jar.absorb_response(&target, ["c=3; Path=/"].into_iter()).unwrap();

        assert_eq!(jar.len(), 2);
        let header = jar.attach_to_request(&target).unwrap();
        assert!(!header.contains("a=1"));
        assert!(header.contains("b=2") && header.contains("c=3"));
    }

    #[test]
    fn tags_edge_cookies() {
        let jar = CookieJar::new();
        let target = url("https://example.test/");
        jar.absorb_response(
            &target,
            ["__cf_bm=bm; Path=/", "cf_clearance=cl; Path=/", "sid=x; Path=/"].into_iter(),
        )
        .unwrap();

        let tags: Vec<Option<EdgeCookie>> =
            jar.snapshot().iter().map(|cookie| cookie.edge_tag).collect();
        assert!(tags.contains(&Some(EdgeCookie::BotManagement)));
        assert!(tags.contains(&Some(EdgeCookie::Clearance)));
        assert!(jar.has_valid_clearance(&target));
    }

    #[test]
    fn longer_paths_serialise_first() {
        let jar = CookieJar::new();
        let target = url("https://example.test/app/deep/page");
        jar.absorb_response(
            &target,
            ["root=1; Path=/", "scoped=2; Path=/app/deep"].into_iter(),
        )
        .unwrap();

        assert_eq!(
            jar.attach_to_request(&target).unwrap(),
            "scoped=2; root=1"
        );
    }

    #[test]
    fn strict_jar_rejects_garbage() {
        let jar = CookieJar::new().strict();
        let result = jar.absorb_response(
            &url("https://example.test/"),
            ["not a cookie at all;;;=="].into_iter(),
        );
        assert!(matches!(result, Err(CookieError::Malformed(_))));
    }
}
