//! Browser fingerprint profiles.
//!
//! A profile is pure data plus deterministic assembly rules: given a profile,
//! a target URL, and user overrides it yields the exact header sequence,
//! ClientHello bytes, and HTTP/2 SETTINGS frame a real Chrome build would put
//! on the wire. Profiles are immutable and process-wide; anything that wants
//! a different wire appearance gets a different profile.

pub mod client_hello;
pub mod http2;

use http::Method;
use url::Url;

pub use http2::{Http2Settings, PseudoHeader};

/// Ordered, case-preserving sequence of request or response headers.
///
/// `http::HeaderMap` normalises names to lowercase, which destroys exactly
/// the information edges fingerprint on. This type keeps the bytes as the
/// profile (or the peer) spelled them while still offering case-insensitive
/// lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSequence {
    entries: Vec<(String, String)>,
}

impl HeaderSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace the first header with this name (case-insensitive), keeping
    /// its position; append when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderSequence {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Immutable wire identity of one Chrome build.
#[derive(Debug)]
pub struct FingerprintProfile {
    name: &'static str,
    aliases: &'static [&'static str],
    chrome_major: u16,
    user_agent: &'static str,
    /// Cipher suites in ClientHello order, fixed GREASE value included.
    cipher_suites: &'static [u16],
    /// Extension identifiers in ClientHello order, fixed GREASE included.
    extensions: &'static [u16],
    supported_groups: &'static [u16],
    ec_point_formats: &'static [u8],
    signature_algorithms: &'static [u16],
    alpn: &'static [&'static str],
    key_share_groups: &'static [u16],
    h2_settings: Http2Settings,
    pseudo_header_order: [PseudoHeader; 4],
    /// Default request headers with exact casing, in template order.
    header_template: &'static [(&'static str, &'static str)],
    session_resumption: bool,
}

impl FingerprintProfile {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn chrome_major(&self) -> u16 {
        self.chrome_major
    }

    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }

    pub fn cipher_suites(&self) -> &'static [u16] {
        self.cipher_suites
    }

    pub fn extensions(&self) -> &'static [u16] {
        self.extensions
    }

    pub fn supported_groups(&self) -> &'static [u16] {
        self.supported_groups
    }

    pub fn ec_point_formats(&self) -> &'static [u8] {
        self.ec_point_formats
    }

    pub fn signature_algorithms(&self) -> &'static [u16] {
        self.signature_algorithms
    }

    pub fn alpn(&self) -> &'static [&'static str] {
        self.alpn
    }

    pub fn key_share_groups(&self) -> &'static [u16] {
        self.key_share_groups
    }

    pub fn h2_settings(&self) -> &Http2Settings {
        &self.h2_settings
    }

    pub fn pseudo_header_order(&self) -> &[PseudoHeader; 4] {
        &self.pseudo_header_order
    }

    pub fn header_template(&self) -> &'static [(&'static str, &'static str)] {
        self.header_template
    }

    pub fn session_resumption(&self) -> bool {
        self.session_resumption
    }
}

/// Fixed GREASE values. Chrome randomises these per connection; profiles pin
/// them so the emitted bytes are reproducible.
pub(crate) const GREASE_CIPHER: u16 = 0x0a0a;
pub(crate) const GREASE_EXTENSION: u16 = 0x1a1a;
pub(crate) const GREASE_GROUP: u16 = 0x2a2a;

/// Chrome 124 on desktop Windows, the catalog's canonical profile.
static CHROME_124: FingerprintProfile = FingerprintProfile {
    name: "chrome-124",
    aliases: &["chrome-124-desktop-windows"],
    chrome_major: 124,
    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    cipher_suites: &[
        GREASE_CIPHER,
        0x1301, // TLS_AES_128_GCM_SHA256
        0x1302, // TLS_AES_256_GCM_SHA384
        0x1303, // TLS_CHACHA20_POLY1305_SHA256
        0xc02b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        0xc02f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        0xc02c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        0xc030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
        0xcca9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        0xcca8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        0xc013, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
        0xc014, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
        0x009c, // TLS_RSA_WITH_AES_128_GCM_SHA256
        0x009d, // TLS_RSA_WITH_AES_256_GCM_SHA384
        0x002f, // TLS_RSA_WITH_AES_128_CBC_SHA
        0x0035, // TLS_RSA_WITH_AES_256_CBC_SHA
    ],
    extensions: &[
        GREASE_EXTENSION,
        0x0000, // server_name
        0x0017, // extended_master_secret
        0xff01, // renegotiation_info
        0x000a, // supported_groups
        0x000b, // ec_point_formats
        0x0023, // session_ticket
        0x0010, // application_layer_protocol_negotiation
        0x0005, // status_request
        0x000d, // signature_algorithms
        0x0012, // signed_certificate_timestamp
        0x002b, // supported_versions
        0x002d, // psk_key_exchange_modes
        0x0033, // key_share
        0x001b, // compress_certificate
        0x0015, // padding
    ],
    supported_groups: &[
        GREASE_GROUP,
        0x001d, // x25519
        0x0017, // secp256r1
        0x0018, // secp384r1
    ],
    ec_point_formats: &[0x00],
    signature_algorithms: &[
        0x0403, // ecdsa_secp256r1_sha256
        0x0804, // rsa_pss_rsae_sha256
        0x0401, // rsa_pkcs1_sha256
        0x0503, // ecdsa_secp384r1_sha384
        0x0805, // rsa_pss_rsae_sha384
        0x0501, // rsa_pkcs1_sha384
        0x0806, // rsa_pss_rsae_sha512
        0x0601, // rsa_pkcs1_sha512
    ],
    alpn: &["h2", "http/1.1"],
    key_share_groups: &[0x001d],
    h2_settings: Http2Settings {
        header_table_size: 65_536,
        enable_push: 0,
        max_concurrent_streams: 1_000,
        initial_window_size: 6_291_456,
        max_frame_size: 16_384,
        max_header_list_size: 262_144,
    },
    pseudo_header_order: [
        PseudoHeader::Method,
        PseudoHeader::Authority,
        PseudoHeader::Scheme,
        PseudoHeader::Path,
    ],
    header_template: &[
        (
            "sec-ch-ua",
            "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
        ("Upgrade-Insecure-Requests", "1"),
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,\
             image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
        ("Sec-Fetch-Site", "none"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-User", "?1"),
        ("Sec-Fetch-Dest", "document"),
        ("Accept-Encoding", "gzip, deflate, br, zstd"),
        ("Accept-Language", "en-US,en;q=0.9"),
    ],
    session_resumption: false,
};

static CATALOG: &[&FingerprintProfile] = &[&CHROME_124];

/// Look up a profile by canonical name or alias.
pub fn profile(name: &str) -> Option<&'static FingerprintProfile> {
    CATALOG
        .iter()
        .copied()
        .find(|p| p.name == name || p.aliases.contains(&name))
}

/// Names of every profile the catalog ships.
pub fn profile_names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|p| p.name)
}

/// Assemble the ordered request header sequence for one request.
///
/// Rules, in order: start with the profile template; substitute `Host` from
/// the URL; add `Content-Length` when a body is present and the caller set
/// neither it nor `Transfer-Encoding`; apply user overrides last, keeping the
/// template position of any header already present. Casing is taken verbatim
/// from the template or the override.
pub fn compose_request_headers(
    profile: &FingerprintProfile,
    url: &Url,
    _method: &Method,
    body_len: Option<usize>,
    overrides: &HeaderSequence,
) -> HeaderSequence {
    let mut headers = HeaderSequence::new();
    headers.push("Host", host_header_value(url));
    for (name, value) in profile.header_template {
        headers.push(*name, *value);
    }

    if let Some(len) = body_len
        && !overrides.contains("Content-Length")
        && !overrides.contains("Transfer-Encoding")
    {
        headers.push("Content-Length", len.to_string());
    }

    for (name, value) in overrides.iter() {
        headers.set(name, value);
    }

    headers
}

fn host_header_value(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
