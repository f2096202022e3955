//! HTTP/2 fingerprint surface: SETTINGS frame bytes and pseudo-header order.

use http::Method;
use url::Url;

/// SETTINGS identifiers from RFC 9113 §6.5.2.
const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x01;
const SETTINGS_ENABLE_PUSH: u16 = 0x02;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x03;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x04;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x05;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x06;

/// The six SETTINGS values a profile pins, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: u32,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Http2Settings {
    fn pairs(&self) -> [(u16, u32); 6] {
        [
            (SETTINGS_HEADER_TABLE_SIZE, self.header_table_size),
            (SETTINGS_ENABLE_PUSH, self.enable_push),
            (SETTINGS_MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size),
            (SETTINGS_MAX_FRAME_SIZE, self.max_frame_size),
            (SETTINGS_MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
    }
}

/// Serialize the initial SETTINGS frame exactly as it appears on the wire:
/// 9-byte frame header followed by six id/value pairs in profile order.
pub fn settings_frame_bytes(settings: &Http2Settings) -> Vec<u8> {
    let pairs = settings.pairs();
    let payload_len = pairs.len() * 6;
    let mut frame = Vec::with_capacity(9 + payload_len);

    frame.push((payload_len >> 16) as u8);
    frame.push((payload_len >> 8) as u8);
    frame.push(payload_len as u8);
    frame.push(0x04); // SETTINGS
    frame.push(0x00); // no flags
    frame.extend_from_slice(&[0, 0, 0, 0]); // stream 0

    for (id, value) in pairs {
        frame.push((id >> 8) as u8);
        frame.push(id as u8);
        frame.extend_from_slice(&value.to_be_bytes());
    }

    frame
}

/// HTTP/2 request pseudo-headers in the order a profile emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    Method,
    Authority,
    Scheme,
    Path,
}

impl PseudoHeader {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudoHeader::Method => ":method",
            PseudoHeader::Authority => ":authority",
            PseudoHeader::Scheme => ":scheme",
            PseudoHeader::Path => ":path",
        }
    }
}

/// Materialize the pseudo-header block for one request in profile order.
pub fn pseudo_headers(
    order: &[PseudoHeader; 4],
    method: &Method,
    url: &Url,
) -> Vec<(&'static str, String)> {
    let authority = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    order
        .iter()
        .map(|pseudo| {
            let value = match pseudo {
                PseudoHeader::Method => method.as_str().to_string(),
                PseudoHeader::Authority => authority.clone(),
                PseudoHeader::Scheme => url.scheme().to_string(),
                PseudoHeader::Path => path.clone(),
            };
            (pseudo.as_str(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_frame_layout() {
        let settings = Http2Settings {
            header_table_size: 65_536,
            enable_push: 0,
            max_concurrent_streams: 1_000,
            initial_window_size: 6_291_456,
            max_frame_size: 16_384,
            max_header_list_size: 262_144,
        };
        let frame = settings_frame_bytes(&settings);

        assert_eq!(frame.len(), 9 + 36);
        assert_eq!(&frame[..3], &[0, 0, 36]);
        assert_eq!(frame[3], 0x04);
        assert_eq!(frame[4], 0x00);
        assert_eq!(&frame[5..9], &[0, 0, 0, 0]);
        // First pair: HEADER_TABLE_SIZE = 65536.
        assert_eq!(&frame[9..15], &[0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        // Second pair: ENABLE_PUSH = 0.
        assert_eq!(&frame[15..21], &[0x00, 0x02, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn pseudo_header_order_and_values() {
        let order = [
            PseudoHeader::Method,
            PseudoHeader::Authority,
            PseudoHeader::Scheme,
            PseudoHeader::Path,
        ];
        let url = Url::parse("https://example.test:8443/a/b?q=1").unwrap();
        let block = pseudo_headers(&order, &Method::POST, &url);

        assert_eq!(
            block,
            vec![
                (":method", "POST".to_string()),
                (":authority", "example.test:8443".to_string()),
                (":scheme", "https".to_string()),
                (":path", "/a/b?q=1".to_string()),
            ]
        );
    }
}
