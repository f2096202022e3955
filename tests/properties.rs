//! Property tests for the stateful building blocks: jar bounds and
//! round-trips, header composition, and pacing bounds.

use std::collections::HashMap;
use std::time::Duration;

use cloudflare_research::deadline::Deadline;
use cloudflare_research::fingerprint::{HeaderSequence, compose_request_headers, profile};
use cloudflare_research::{CookieJar, OriginRateLimiter, RateLimiterConfig};
use http::Method;
use proptest::prelude::*;
use url::Url;

fn cookie_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,11}"
}

fn cookie_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{1,16}"
}

proptest! {
    #[test]
    fn jar_never_exceeds_capacity(
        capacity in 1usize..32,
        cookies in prop::collection::vec((cookie_name(), cookie_value()), 0..128),
    ) {
        let jar = CookieJar::with_capacity(capacity);
        let url = Url::parse("https://example.test/").unwrap();
        let headers: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}; Path=/"))
            .collect();
        jar.absorb_response(&url, headers.iter().map(String::as_str)).unwrap();

        prop_assert!(jar.len() <= capacity);
    }

    /// Round-trip: absorbing a Set-Cookie sequence and serialising the jar
    /// yields exactly the surviving (name, value) pairs, with a second
    /// Set-Cookie for the same triple replacing the first.
    #[test]
    fn jar_round_trips_set_cookie_sequences(
        cookies in prop::collection::vec((cookie_name(), cookie_value()), 1..24),
    ) {
        let jar = CookieJar::new();
        let url = Url::parse("https://example.test/").unwrap();
        let headers: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}; Path=/"))
            .collect();
        jar.absorb_response(&url, headers.iter().map(String::as_str)).unwrap();

        let mut expected: HashMap<&str, &str> = HashMap::new();
        for (name, value) in &cookies {
            expected.insert(name.as_str(), value.as_str());
        }

        let header = jar.attach_to_request(&url).unwrap();
        let mut sent: HashMap<&str, &str> = HashMap::new();
        for pair in header.split("; ") {
            let (name, value) = pair.split_once('=').unwrap();
            sent.insert(name, value);
        }
        prop_assert_eq!(sent, expected);
    }

    #[test]
    fn composed_headers_have_unique_positions_for_overrides(
        overrides in prop::collection::vec((cookie_name(), cookie_value()), 0..8),
    ) {
        let profile = profile("chrome-124").unwrap();
        let url = Url::parse("https://example.test/").unwrap();
        let sequence: HeaderSequence = overrides.iter().cloned().collect();

        let headers =
            compose_request_headers(profile, &url, &Method::GET, None, &sequence);

        // Host leads, and no override may occupy two positions.
        prop_assert_eq!(headers.iter().next().unwrap().0, "Host");
        let mut seen = std::collections::HashSet::new();
        for (name, _) in headers.iter() {
            prop_assert!(
                seen.insert(name.to_ascii_lowercase()),
                "duplicate header {}",
                name
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// A fresh bucket yields at most `burst` tokens without waiting.
    #[test]
    fn bucket_burst_is_the_immediate_ceiling(
        rate in 1.0f64..50.0,
        burst in 1u32..32,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let acquired = runtime.block_on(async {
            let limiter = OriginRateLimiter::new(RateLimiterConfig {
                rate_per_second: rate,
                burst,
            });
            let mut count = 0u32;
            loop {
                let deadline = Deadline::after(Duration::from_millis(1));
                match limiter.acquire("origin:443", deadline).await {
                    Ok(_) => count += 1,
                    Err(_) => break,
                }
                if count > burst + 1 {
                    break;
                }
            }
            count
        });

        // Allow one token of refill slack for elapsed wall time.
        prop_assert!(acquired >= burst && acquired <= burst + 1);
    }
}
