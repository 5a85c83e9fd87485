//! Outbound response builder, adapted from the teacher's
//! `httpserver::serve::response::Response` (same field shape and
//! builder chain), generalized to also carry streaming bodies and
//! CORS/Bare headers rather than only static bytes.

use futures_lite::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::cors;
use crate::error::BareError;

const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    pub fn key_eq_ignore_ascii_case(&self, other: &str) -> bool {
        self.key.eq_ignore_ascii_case(other)
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}\r\n", self.key, self.value)
    }
}

/// A response body: either already in memory (error bodies, the
/// manifest, meta responses — all small and JSON-shaped) or a live
/// reader over the remote's body, so the bare envelope's HTTP handler
/// can pipe an upstream response straight to the client instead of
/// buffering it (spec.md §4.F "stream the remote body through").
pub enum Body {
    Bytes(Vec<u8>),
    Stream { reader: Box<dyn AsyncRead + Unpin + Send>, len: Option<u64> },
}

impl Body {
    fn len(&self) -> Option<u64> {
        match self {
            Self::Bytes(b) => Some(b.len() as u64),
            Self::Stream { len, .. } => *len,
        }
    }

    /// `Some` for an in-memory body, `None` for a live stream — used by
    /// tests and small-response call sites that only ever attach bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            Self::Stream { .. } => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Bytes(b) if b.is_empty())
    }
}

pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Option<Body>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            version: HTTP_VERSION.into(),
            status: 200,
            reason: "OK".into(),
            headers: vec![],
            body: None,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_body(mut self) -> Self {
        self.body = None;
        self
    }

    pub fn with_status(mut self, status: u16, reason: impl Into<String>) -> Self {
        self.status = status;
        self.reason = reason.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn with_body_bytes(mut self, body: Vec<u8>) -> Self {
        self.body = Some(Body::Bytes(body));
        self
    }

    /// Attaches a live body reader instead of a buffered `Vec<u8>`; `len`
    /// is `Some` when the upstream gave a `Content-Length` or the body is
    /// empty, `None` when it must be relayed until EOF and the client
    /// connection closed after (spec.md §4.F).
    pub fn with_streamed_body(mut self, reader: Box<dyn AsyncRead + Unpin + Send>, len: Option<u64>) -> Self {
        self.body = Some(Body::Stream { reader, len });
        self
    }

    fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|h| h.key_eq_ignore_ascii_case(key))
    }

    /// Renders a fully in-memory response. Panics if `self.body` is a
    /// live stream — callers that may hold a streamed body must use
    /// [`Response::write_to`] instead.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body: &[u8] = match &self.body {
            Some(Body::Bytes(b)) => b,
            Some(Body::Stream { .. }) => panic!("Response::to_bytes called on a streamed body; use write_to"),
            None => &[],
        };

        let mut head = String::new();
        head.push_str(&format!("{} {} {}\r\n", self.version, self.status, self.reason));

        if !self.has_header("Content-Length") {
            head.push_str(&Header::new("Content-Length", body.len().to_string()).to_string());
        }
        if !self.has_header("Connection") {
            head.push_str(&Header::new("Connection", "close").to_string());
        }

        for h in self.headers.iter() {
            head.push_str(&h.to_string());
        }
        head.push_str("\r\n");

        let mut out = Vec::with_capacity(head.len() + body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Writes the status line, headers and body straight to `stream`,
    /// copying a [`Body::Stream`] rather than buffering it first. Used
    /// by `bare-server`'s connection handler for every response it
    /// sends, so the envelope HTTP handlers' streamed remote bodies
    /// reach the client without ever sitting fully in memory.
    pub async fn write_to<W: AsyncWrite + Unpin>(self, stream: &mut W) -> std::io::Result<()> {
        let body_len = self.body.as_ref().and_then(Body::len);

        let mut head = String::new();
        head.push_str(&format!("{} {} {}\r\n", self.version, self.status, self.reason));
        if !self.has_header("Content-Length") {
            if let Some(len) = body_len {
                head.push_str(&Header::new("Content-Length", len.to_string()).to_string());
            }
        }
        if !self.has_header("Connection") {
            head.push_str(&Header::new("Connection", "close").to_string());
        }
        for h in self.headers.iter() {
            head.push_str(&h.to_string());
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;

        match self.body {
            Some(Body::Bytes(b)) => stream.write_all(&b).await?,
            Some(Body::Stream { mut reader, .. }) => {
                futures_lite::io::copy(&mut reader, &mut *stream).await?;
            }
            None => {}
        }
        stream.flush().await
    }

    pub fn plain_text(status: u16, reason: &str, body: &str) -> Self {
        Response::new()
            .with_status(status, reason)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body_bytes(body.as_bytes().to_vec())
    }

    pub fn json(status: u16, reason: &str, body: &str) -> Self {
        Response::new()
            .with_status(status, reason)
            .with_header("Content-Type", "application/json")
            .with_body_bytes(body.as_bytes().to_vec())
    }

    /// `BareError` → JSON error body per spec.md §5, with CORS headers
    /// attached so a failed fetch is still legible to the browser.
    pub fn from_bare_error(err: &BareError, include_stack: bool, origin: Option<&str>) -> Self {
        let body = serde_json::to_string(&err.body(include_stack)).unwrap_or_else(|_| "{}".to_string());
        let mut resp = Response::json(err.status(), status_reason(err.status()), &body);
        resp.headers.extend(cors::response_headers(origin));
        resp
    }

    pub fn with_cors(mut self, origin: Option<&str>) -> Self {
        self.headers.extend(cors::response_headers(origin));
        self
    }

    /// Runs `header_split::split_headers` over this response's headers,
    /// splitting an oversized `x-bare-headers` into numbered fragments
    /// (spec.md §4.B).
    pub fn split_oversized_headers(mut self) -> Self {
        let mut raw: Vec<(String, String)> =
            self.headers.iter().map(|h| (h.key.clone(), h.value.clone())).collect();
        crate::header_split::split_headers(&mut raw);
        self.headers = raw.into_iter().map(|(k, v)| Header::new(k, v)).collect();
        self
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_content_length_and_connection_are_injected() {
        let resp = Response::plain_text(200, "OK", "hi");
        let bytes = resp.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn explicit_header_is_not_duplicated() {
        let resp = Response::new().with_header("Content-Length", "0").without_body();
        let bytes = resp.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn bare_error_renders_json_with_cors() {
        let err = BareError::missing("x-bare-host");
        let resp = Response::from_bare_error(&err, false, Some("https://example.com"));
        assert_eq!(resp.status, 400);
        let bytes = resp.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"code\":\"MISSING_BARE_HEADER\""));
        assert!(text.contains("Access-Control-Allow-Origin"));
    }

    #[test]
    fn split_oversized_headers_replaces_large_x_bare_headers() {
        let big_value = "x".repeat(4000);
        let resp = Response::new().with_header("x-bare-headers", big_value).split_oversized_headers();
        assert!(!resp.headers.iter().any(|h| h.key == "x-bare-headers"));
        assert!(resp.headers.iter().any(|h| h.key == "x-bare-headers-0"));
    }
}
