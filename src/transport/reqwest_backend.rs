//! Reqwest-backed transport.
//!
//! One `reqwest::Client` per fingerprint profile, cached for the lifetime of
//! the transport. Redirects are disabled (the session follows them so every
//! hop's Set-Cookie is captured) and the built-in cookie store stays off; the
//! session jar is the single source of cookie truth.
//!
//! `Accept-Encoding` goes out exactly as the profile template spells it.
//! Reqwest's automatic negotiation is not used; compressed bodies are
//! decoded here, after receipt, so the challenge detector sees plaintext
//! without the wire header ever being rewritten.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{RawResponse, Timing, Transport, TransportCall, TransportError};
use crate::fingerprint::HeaderSequence;

/// Default ceiling on buffered response bytes (2 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Headers reqwest derives itself: Host from the URL, Content-Length from
/// the body. Everything else passes through verbatim.
const BACKEND_OWNED: &[&str] = &["host", "content-length"];

pub struct ReqwestTransport {
    idle_timeout: Duration,
    body_limit: usize,
    clients: Mutex<HashMap<&'static str, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            body_limit: DEFAULT_BODY_LIMIT,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit.max(1024);
        self
    }

    async fn client(
        &self,
        call: &TransportCall<'_>,
    ) -> Result<reqwest::Client, TransportError> {
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(call.profile.name()) {
            return Ok(client.clone());
        }

        let settings = call.profile.h2_settings();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(6)
            .http2_initial_stream_window_size(settings.initial_window_size)
            .http2_max_frame_size(settings.max_frame_size)
            .tcp_nodelay(true)
            .build()
            .map_err(|err| TransportError::Io(err.to_string()))?;

        guard.insert(call.profile.name(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, call: TransportCall<'_>) -> Result<RawResponse, TransportError> {
        let budget = call.deadline.remaining();
        if budget.is_zero() {
            return Err(TransportError::DeadlineExceeded);
        }

        let client = self.client(&call).await?;
        let headers = to_header_map(call.headers)?;

        let mut builder = client
            .request(call.method.clone(), call.url.clone())
            .headers(headers)
            .timeout(budget);
        if let Some(body) = call.body.clone() {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(classify_send_error)?;
        let first_byte = started.elapsed();

        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = from_header_map(response.headers());
        let (mut body, mut truncated) = read_body(response, self.body_limit).await?;

        // A body cut off at the cap cannot be decoded; it stays raw with the
        // truncation flag telling the detector its evidence is incomplete.
        if !truncated
            && let Some(encoding) = headers.get("content-encoding")
        {
            (body, truncated) = decode_body(&body, encoding, self.body_limit)?;
        }

        Ok(RawResponse {
            status,
            headers,
            body,
            url,
            timing: Timing {
                dns: None,
                connect: None,
                tls_handshake: None,
                first_byte: Some(first_byte),
                total: started.elapsed(),
            },
            truncated,
        })
    }

    async fn close(&self) {
        self.clients.lock().await.clear();
    }
}

async fn read_body(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<(Bytes, bool), TransportError> {
    let mut buffer = BytesMut::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if buffer.len() + chunk.len() > limit {
                    let room = limit - buffer.len();
                    buffer.extend_from_slice(&chunk[..room]);
                    return Ok((buffer.freeze(), true));
                }
                buffer.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok((buffer.freeze(), false)),
            Err(err) if err.is_timeout() => return Err(TransportError::DeadlineExceeded),
            Err(err) => return Err(TransportError::Io(err.to_string())),
        }
    }
}

/// Decode a Content-Encoding chain, rightmost coding first. The decoded
/// output honours the same buffer cap as the raw read; overflow truncates
/// and flags the body.
fn decode_body(
    body: &[u8],
    encoding: &str,
    limit: usize,
) -> Result<(Bytes, bool), TransportError> {
    let mut data = body.to_vec();
    let mut truncated = false;
    for coding in encoding.split(',').map(str::trim).rev() {
        let (decoded, cut) = decode_once(&data, coding, limit)?;
        data = decoded;
        truncated = truncated || cut;
    }
    Ok((Bytes::from(data), truncated))
}

fn decode_once(bytes: &[u8], coding: &str, limit: usize) -> Result<(Vec<u8>, bool), TransportError> {
    let decoded = match coding.to_ascii_lowercase().as_str() {
        "" | "identity" => return Ok((bytes.to_vec(), false)),
        "gzip" | "x-gzip" => read_capped(flate2::read::GzDecoder::new(bytes), limit),
        "deflate" => read_capped(flate2::read::ZlibDecoder::new(bytes), limit),
        "br" => read_capped(brotli::Decompressor::new(bytes, 4096), limit),
        "zstd" => zstd::stream::Decoder::new(bytes)
            .and_then(|decoder| read_capped(decoder, limit)),
        other => {
            return Err(TransportError::Protocol(format!(
                "unsupported content-encoding '{other}'"
            )));
        }
    };
    decoded.map_err(|err| TransportError::Protocol(format!("invalid {coding} body: {err}")))
}

fn read_capped(reader: impl Read, limit: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        out.truncate(limit);
        return Ok((out, true));
    }
    Ok((out, false))
}

fn classify_send_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::DeadlineExceeded
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() || err.is_request() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

fn to_header_map(headers: &HeaderSequence) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        if BACKEND_OWNED
            .iter()
            .any(|owned| name.eq_ignore_ascii_case(owned))
        {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::Protocol(format!("invalid header name '{name}'")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::Protocol(format!("invalid value for '{name}'")))?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

fn from_header_map(map: &HeaderMap) -> HeaderSequence {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
