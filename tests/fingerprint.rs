//! Wire-fingerprint invariants: golden bytes for the ClientHello and the
//! HTTP/2 SETTINGS frame, header order and casing, JA3 stability.

use cloudflare_research::fingerprint::client_hello::{
    client_hello_with_random, ja3_hash, ja3_string,
};
use cloudflare_research::fingerprint::http2::{pseudo_headers, settings_frame_bytes};
use cloudflare_research::fingerprint::{HeaderSequence, compose_request_headers, profile};
use http::Method;
use url::Url;

/// JA3 of the chrome-124 profile, GREASE stripped. Any profile-data change
/// shows up here first.
const CHROME_124_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-43-45-51-27-21,29-23-24,0";

#[test]
fn client_hello_is_identical_modulo_random() {
    let profile = profile("chrome-124").unwrap();
    let random = [0x42u8; 32];

    let golden = client_hello_with_random(profile, "research.example.test", &random);
    for _ in 0..8 {
        let again = client_hello_with_random(profile, "research.example.test", &random);
        assert_eq!(golden, again);
    }

    // A different random changes entropy-derived fields only; layout and
    // length are stable.
    let other = client_hello_with_random(profile, "research.example.test", &[0x43u8; 32]);
    assert_eq!(golden.len(), other.len());
    assert_ne!(golden, other);
}

#[test]
fn client_hello_cipher_order_matches_profile() {
    let profile = profile("chrome-124").unwrap();
    let hello = client_hello_with_random(profile, "example.test", &[0u8; 32]);

    // Fixed offsets up to the cipher list: record header (5), handshake
    // header (4), version (2), random (32), session id length (1) +
    // session id (32), cipher list length (2).
    let cipher_offset = 5 + 4 + 2 + 32 + 1 + 32 + 2;
    let suites = profile.cipher_suites();
    for (index, suite) in suites.iter().enumerate() {
        let at = cipher_offset + index * 2;
        let on_wire = u16::from_be_bytes([hello[at], hello[at + 1]]);
        assert_eq!(on_wire, *suite, "cipher {index} out of order");
    }
}

#[test]
fn client_hello_extension_order_matches_profile() {
    let profile = profile("chrome-124").unwrap();
    let hello = client_hello_with_random(profile, "example.test", &[0u8; 32]);

    // Walk the extension block and collect ids in wire order.
    let cipher_offset = 5 + 4 + 2 + 32 + 1 + 32;
    let cipher_len =
        u16::from_be_bytes([hello[cipher_offset], hello[cipher_offset + 1]]) as usize;
    let mut cursor = cipher_offset + 2 + cipher_len + 2; // + compression block
    let ext_total = u16::from_be_bytes([hello[cursor], hello[cursor + 1]]) as usize;
    cursor += 2;
    let end = cursor + ext_total;

    let mut seen = Vec::new();
    while cursor < end {
        let id = u16::from_be_bytes([hello[cursor], hello[cursor + 1]]);
        let len = u16::from_be_bytes([hello[cursor + 2], hello[cursor + 3]]) as usize;
        seen.push(id);
        cursor += 4 + len;
    }

    assert_eq!(seen, profile.extensions().to_vec());
}

#[test]
fn ja3_is_stable() {
    let profile = profile("chrome-124").unwrap();
    assert_eq!(ja3_string(profile), CHROME_124_JA3);
    assert_eq!(ja3_hash(profile), ja3_hash(profile));
}

#[test]
fn settings_frame_golden_bytes() {
    let profile = profile("chrome-124").unwrap();
    let frame = settings_frame_bytes(profile.h2_settings());

    #[rustfmt::skip]
    let golden: Vec<u8> = vec![
        // frame header: length 36, type SETTINGS, flags 0, stream 0
        0x00, 0x00, 0x24, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
        // HEADER_TABLE_SIZE = 65536
        0x00, 0x01, 0x00, 0x01, 0x00, 0x00,
        // ENABLE_PUSH = 0
        0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
        // MAX_CONCURRENT_STREAMS = 1000
        0x00, 0x03, 0x00, 0x00, 0x03, 0xe8,
        // INITIAL_WINDOW_SIZE = 6291456
        0x00, 0x04, 0x00, 0x60, 0x00, 0x00,
        // MAX_FRAME_SIZE = 16384
        0x00, 0x05, 0x00, 0x00, 0x40, 0x00,
        // MAX_HEADER_LIST_SIZE = 262144
        0x00, 0x06, 0x00, 0x04, 0x00, 0x00,
    ];
    assert_eq!(frame, golden);
}

#[test]
fn pseudo_header_order_is_chrome() {
    let profile = profile("chrome-124").unwrap();
    let url = Url::parse("https://example.test/account?tab=keys").unwrap();
    let block = pseudo_headers(profile.pseudo_header_order(), &Method::GET, &url);

    let names: Vec<&str> = block.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec![":method", ":authority", ":scheme", ":path"]);
    assert_eq!(block[3].1, "/account?tab=keys");
}

#[test]
fn header_template_order_and_casing_golden() {
    let profile = profile("chrome-124").unwrap();
    let url = Url::parse("https://example.test/").unwrap();
    let headers = compose_request_headers(
        profile,
        &url,
        &Method::GET,
        None,
        &HeaderSequence::new(),
    );

    let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        vec![
            "Host",
            "sec-ch-ua",
            "sec-ch-ua-mobile",
            "sec-ch-ua-platform",
            "Upgrade-Insecure-Requests",
            "User-Agent",
            "Accept",
            "Sec-Fetch-Site",
            "Sec-Fetch-Mode",
            "Sec-Fetch-User",
            "Sec-Fetch-Dest",
            "Accept-Encoding",
            "Accept-Language",
        ]
    );

    // Client hints agree with the User-Agent they describe.
    assert!(headers.get("sec-ch-ua").unwrap().contains("v=\"124\""));
    assert!(headers.get("User-Agent").unwrap().contains("Chrome/124.0.0.0"));
    assert_eq!(headers.get("sec-ch-ua-platform"), Some("\"Windows\""));
}

#[test]
fn alpn_advertises_h2_first() {
    let profile = profile("chrome-124").unwrap();
    assert_eq!(profile.alpn(), &["h2", "http/1.1"]);
}
