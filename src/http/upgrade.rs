//! HTTP/1.1 `Upgrade: h2c` handling (RFC 7540 Section 3.2)
//!
//! Parses the clear-text upgrade request a client sends before switching
//! to HTTP/2, and turns it into the header list of stream 1.

use super::{Error, Headers, Result, CRLF};
use crate::http::h2::headers::HeaderList;
use crate::http::h2::settings::Settings;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine as _};
use bytes::BytesMut;

/// Response sent to accept the upgrade
pub const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";

/// Response sent when the upgrade request is unusable
pub const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Largest request head we buffer while waiting for the blank line
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// HTTP2-Settings is base64url with padding optional
const HTTP2_SETTINGS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Headers that describe the HTTP/1.1 hop and are not carried into HTTP/2
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "upgrade",
    "http2-settings",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
];

/// Methods accepted on an upgrade request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMethod {
    Get,
    Post,
}

impl UpgradeMethod {
    /// Parse a request-line method
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(UpgradeMethod::Get),
            "POST" => Ok(UpgradeMethod::Post),
            other => Err(Error::InvalidMethod(other.to_string())),
        }
    }

    /// Method name
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeMethod::Get => "GET",
            UpgradeMethod::Post => "POST",
        }
    }
}

/// A parsed upgrade request head
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: UpgradeMethod,
    path: String,
    headers: Headers,
    settings: Settings,
    content_length: usize,
}

impl UpgradeRequest {
    /// Parse a request head from the start of `buf`
    ///
    /// Returns `Ok(None)` while the terminating blank line has not arrived,
    /// otherwise the request and the length of its head. The body, if any,
    /// is the `content_length()` bytes that follow.
    pub fn parse(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
        let Some(head_end) = find_head_end(buf) else {
            if buf.len() > MAX_REQUEST_HEAD {
                return Err(Error::Parse(format!(
                    "request head exceeds {} bytes",
                    MAX_REQUEST_HEAD
                )));
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| Error::Parse("request head is not UTF-8".to_string()))?;
        let mut lines = head.split(CRLF);

        let request_line = lines
            .next()
            .ok_or_else(|| Error::Parse("empty request".to_string()))?;
        let (method, path) = parse_request_line(request_line)?;

        let mut headers = Headers::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = Headers::parse_line(line)?;
            headers.append(name, value)?;
        }

        if !headers.has_token("upgrade", "h2c") {
            return Err(Error::InvalidUpgrade("Upgrade: h2c missing".to_string()));
        }
        if !headers.has_token("connection", "upgrade")
            || !headers.has_token("connection", "http2-settings")
        {
            return Err(Error::InvalidUpgrade(
                "Connection must list Upgrade and HTTP2-Settings".to_string(),
            ));
        }
        if headers.count("http2-settings") != 1 {
            return Err(Error::InvalidUpgrade(
                "exactly one HTTP2-Settings header is required".to_string(),
            ));
        }
        let settings = decode_http2_settings(headers.get("http2-settings").unwrap_or_default())?;

        if headers.contains("transfer-encoding") {
            return Err(Error::InvalidUpgrade(
                "Transfer-Encoding bodies cannot be upgraded".to_string(),
            ));
        }
        let content_length = match headers.get("content-length") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| Error::InvalidHeader(format!("bad Content-Length: {}", value)))?,
            None => 0,
        };

        let request = UpgradeRequest {
            method,
            path,
            headers,
            settings,
            content_length,
        };
        Ok(Some((request, head_end + 4)))
    }

    /// Request method
    pub fn method(&self) -> UpgradeMethod {
        self.method
    }

    /// Request target
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP/1.1 headers as received
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Peer settings carried in HTTP2-Settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Body length announced by Content-Length
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Header list of the request as stream 1 sees it
    pub fn to_header_list(&self) -> HeaderList {
        let mut list = HeaderList::new()
            .with(":method", self.method.as_str())
            .with(":scheme", "http")
            .with(":path", &self.path);
        if let Some(host) = self.headers.get("host") {
            list.push(":authority", host);
        }
        for (name, value) in self.headers.iter() {
            if HOP_BY_HOP.contains(&name) {
                continue;
            }
            list.push(name, value);
        }
        list
    }
}

/// Decode an HTTP2-Settings header value into settings
pub fn decode_http2_settings(value: &str) -> Result<Settings> {
    let payload = HTTP2_SETTINGS_ENGINE
        .decode(value.trim())
        .map_err(|e| Error::InvalidUpgrade(format!("HTTP2-Settings is not base64url: {}", e)))?;
    Settings::decode_payload(&payload)
        .map_err(|e| Error::InvalidUpgrade(format!("HTTP2-Settings: {}", e)))
}

/// Encode settings as an HTTP2-Settings header value
pub fn encode_http2_settings(settings: &Settings) -> String {
    let mut payload = BytesMut::new();
    settings.encode_payload(&mut payload);
    HTTP2_SETTINGS_ENGINE.encode(&payload)
}

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION
fn parse_request_line(line: &str) -> Result<(UpgradeMethod, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }
    if parts[2] != "HTTP/1.1" {
        return Err(Error::Parse(format!("cannot upgrade {}", parts[2])));
    }

    let method = UpgradeMethod::from_str(parts[0])?;
    Ok((method, parts[1].to_string()))
}

/// Offset of the CRLFCRLF ending the head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
