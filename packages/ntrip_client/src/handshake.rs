use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use relay_io::{Endpoint, TcpEndpoint};
use tracing::{debug, info};

use crate::error::HandshakeError;

const USER_AGENT: &str = concat!("rtk-relay/", env!("CARGO_PKG_VERSION"));

/// Default response header buffer cap.
const DEFAULT_MAX_HEADER: usize = 64 * 1024;

/// A header this small with no terminator is assumed still incomplete
/// even when the success token is already visible.
const MIN_HEADER_FOR_IMPLICIT_END: usize = 128;

/// RTCM3 sync byte, used to locate payload start in headerless replies.
const RTCM_SYNC: u8 = 0xD3;

/// Resolved caster connection parameters.
#[derive(Clone, Debug)]
pub struct CasterConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Response header buffer cap.
    pub max_header: usize,
}

impl CasterConfig {
    pub fn new(host: &str, port: u16, mountpoint: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            mountpoint: mountpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_header: DEFAULT_MAX_HEADER,
        }
    }
}

/// A connected correction-data session.
pub struct NtripSession {
    pub endpoint: TcpEndpoint,
    /// Payload bytes that arrived bundled with the response header. Must
    /// be delivered downstream exactly once, before the read loop starts.
    pub leading: Vec<u8>,
}

/// Build the NTRIP v2 GET request, sent as one write.
pub fn build_request(host: &str, mountpoint: &str, username: &str, password: &str) -> Vec<u8> {
    let auth = BASE64.encode(format!("{}:{}", username, password));
    let request = format!(
        "GET /{mountpoint} HTTP/1.0\r\n\
         Host: {host}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Authorization: Basic {auth}\r\n\
         Ntrip-Version: Ntrip/2.0\r\n\
         Connection: close\r\n\
         \r\n"
    );
    request.into_bytes()
}

/// Connect to the caster over TCP and perform the handshake.
pub async fn connect(cfg: &CasterConfig) -> Result<NtripSession, HandshakeError> {
    info!(
        "connecting to caster {}:{} mountpoint '{}'",
        cfg.host, cfg.port, cfg.mountpoint
    );
    let mut endpoint = TcpEndpoint::connect(&cfg.host, cfg.port, cfg.connect_timeout).await?;

    match handshake(&mut endpoint, cfg).await {
        Ok(leading) => {
            info!(
                "caster accepted mountpoint '{}' ({} leading payload bytes)",
                cfg.mountpoint,
                leading.len()
            );
            Ok(NtripSession { endpoint, leading })
        }
        Err(e) => {
            endpoint.close().await;
            Err(e)
        }
    }
}

/// Perform the request/response exchange over an already-open endpoint.
///
/// On success returns the leading payload (possibly empty). On failure the
/// endpoint is left to the caller to close.
pub async fn handshake<E: Endpoint>(
    endpoint: &mut E,
    cfg: &CasterConfig,
) -> Result<Vec<u8>, HandshakeError> {
    let request = build_request(&cfg.host, &cfg.mountpoint, &cfg.username, &cfg.password);
    endpoint.write_all(&request).await?;

    let header = read_header(endpoint, cfg.read_timeout, cfg.max_header).await?;
    let (header_part, payload) = split_response(&header);

    let status = status_line(header_part);
    debug!("caster status line: {}", status);
    classify_status(&status)?;

    Ok(payload.to_vec())
}

/// Read the response header incrementally, applying three termination
/// heuristics in priority order: explicit CRLFCRLF; success token with a
/// plausibly complete header; success token already buffered when the
/// read times out (accept truncated).
async fn read_header<E: Endpoint>(
    endpoint: &mut E,
    read_timeout: Duration,
    max_header: usize,
) -> Result<Vec<u8>, HandshakeError> {
    let mut header = Vec::new();
    let mut chunk = [0u8; 1024];

    while header.len() < max_header {
        let n = match tokio::time::timeout(read_timeout, endpoint.read(&mut chunk)).await {
            Err(_) => {
                if contains_success_token(&header) {
                    debug!("header read timed out after success status, accepting truncated");
                    break;
                }
                return Err(HandshakeError::Timeout);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };
        header.extend_from_slice(&chunk[..n]);

        if find(&header, b"\r\n\r\n").is_some() {
            break;
        }
        // Some casters omit the blank line before streaming.
        if contains_success_token(&header) && header.len() > MIN_HEADER_FOR_IMPLICIT_END {
            break;
        }
    }

    Ok(header)
}

/// Split the raw response buffer into header text and binary payload.
///
/// Split point is, in order of preference: past the explicit blank-line
/// marker; at the first RTCM sync byte after the status line; at the first
/// control byte (< 32, excluding tab/CR/LF) within 200 bytes after the
/// status line; or the end of the buffer (header only, no payload).
pub fn split_response(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return raw.split_at(pos + 4);
    }

    let status_end = find(raw, b"\r\n").or_else(|| raw.iter().position(|&b| b == b'\n'));
    if let Some(status_end) = status_end {
        let from = status_end + 2;
        if from < raw.len() {
            if let Some(rel) = raw[from..].iter().position(|&b| b == RTCM_SYNC) {
                return raw.split_at(from + rel);
            }
            let scan_end = raw.len().min(from + 200);
            for i in from..scan_end {
                if raw[i] < 32 && !matches!(raw[i], b'\t' | b'\r' | b'\n') {
                    return raw.split_at(i);
                }
            }
        }
    }

    (raw, &[])
}

fn contains_success_token(buf: &[u8]) -> bool {
    find(buf, b"ICY 200").is_some() || find(buf, b" 200 ").is_some()
}

fn status_line(header: &[u8]) -> String {
    let end = header
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(header.len());
    // ISO-8859-1: every byte maps to the same code point.
    header[..end].iter().map(|&b| b as char).collect()
}

fn classify_status(status: &str) -> Result<(), HandshakeError> {
    if status.contains("ICY 200") || status.contains(" 200 ") {
        return Ok(());
    }
    if status.contains("401") || status.contains("403") {
        return Err(HandshakeError::AuthFailed);
    }
    if status.contains("404") {
        return Err(HandshakeError::MountpointNotFound);
    }
    if status.contains("500") {
        return Err(HandshakeError::ServerError);
    }
    Err(HandshakeError::UnexpectedStatus(status.to_string()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
