//! Hand-rolled async HTTP/1.1 client for the outbound leg of `bareFetch`
//! (spec.md §4.D). `httproxy::start::forward_via_ureq` reads an upstream
//! response with the (blocking) `ureq` client; `ureq` cannot stream a
//! body or hand back a raw socket after a `101` upgrade, both of which
//! `bareUpgradeFetch`/`webSocketFetch` need, so this writes the request
//! line/headers by hand and parses the response head with `httparse`,
//! mirroring the inbound parser idiom in
//! `httproxy::start::read_client_request` but for the client role.

use futures_lite::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BareError;
use crate::shutdown::CancelToken;

const MAX_HEADER_BYTES: usize = 64 * 1024;

pub struct OutboundRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub default_port: u16,
    pub path: &'a str,
    pub headers: &'a [(String, String)],
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Bytes already read past the header terminator, belonging to the
    /// body (possibly the whole body if it fit in one read).
    pub trailing: Vec<u8>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }

    pub fn is_no_body_status(&self) -> bool {
        matches!(self.status, 101 | 204 | 205 | 304)
    }
}

/// Writes the request line, headers, and streams `body` straight onto
/// `stream` rather than buffering it first (spec.md §4.D "pipe the
/// inbound body into the outbound request"). `content_length` is the
/// body's known size, or `None` when it must be relayed until the
/// caller closes its side; pass `Some(0)` with
/// `futures_lite::io::empty()` for a bodyless request.
///
/// Only synthesizes `Host:` when `req.headers` doesn't already carry one
/// (so a client-supplied override, forwarded via `x-bare-headers`, wins
/// outright), and appends `:{port}` unless it's the scheme's default
/// (RFC 7230 §5.4).
pub async fn write_request<W, B>(
    stream: &mut W,
    req: &OutboundRequest<'_>,
    body: &mut B,
    content_length: Option<u64>,
    cancel: &CancelToken,
) -> Result<(), BareError>
where
    W: AsyncWrite + Unpin,
    B: AsyncRead + Unpin,
{
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method, req.path);

    if !req.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        if req.port == req.default_port {
            head.push_str(&format!("Host: {}\r\n", req.host));
        } else {
            head.push_str(&format!("Host: {}:{}\r\n", req.host, req.port));
        }
    }
    for (name, value) in req.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(len) = content_length {
        if len > 0 && !req.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
            head.push_str(&format!("Content-Length: {len}\r\n"));
        }
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await.map_err(BareError::from)?;
    if content_length != Some(0) {
        cancel.race(futures_lite::io::copy(body, &mut *stream)).await.map_err(BareError::from)?.map_err(BareError::from)?;
    }
    cancel.race(stream.flush()).await.map_err(BareError::from)?.map_err(BareError::from)?;
    Ok(())
}

/// Reads and parses the status line + headers, leaving any bytes read
/// past the terminator in [`ResponseHead::trailing`].
pub async fn read_response_head<R: AsyncRead + Unpin>(stream: &mut R) -> Result<ResponseHead, BareError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut tmp).await.map_err(BareError::from)?;
        if n == 0 {
            return Err(BareError::ConnectionReset { detail: "upstream closed before sending headers".into() });
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(BareError::invalid("upstream response headers too large"));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut raw_headers);
    match response.parse(&buf[..header_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(BareError::invalid("incomplete upstream response headers"));
        }
        Err(e) => return Err(BareError::invalid(format!("malformed upstream response: {e}"))),
    }

    let status = response.code.ok_or_else(|| BareError::invalid("upstream response missing status code"))?;
    let reason = response.reason.unwrap_or_default().to_string();
    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    Ok(ResponseHead { status, reason, headers, trailing: buf[header_end..].to_vec() })
}

/// Reads exactly `content_length` bytes of body, starting from
/// `head.trailing`.
pub async fn read_fixed_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    head: &ResponseHead,
    content_length: u64,
) -> Result<Vec<u8>, BareError> {
    let mut body = head.trailing.clone();
    let mut tmp = [0u8; 8192];
    while (body.len() as u64) < content_length {
        let n = stream.read(&mut tmp).await.map_err(BareError::from)?;
        if n == 0 {
            return Err(BareError::ConnectionReset { detail: "upstream closed mid-body".into() });
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length as usize);
    Ok(body)
}

/// Reads until EOF (used when neither `Content-Length` nor chunked
/// transfer-encoding is present).
pub async fn read_body_to_eof<R: AsyncRead + Unpin>(
    stream: &mut R,
    head: &ResponseHead,
) -> Result<Vec<u8>, BareError> {
    let mut body = head.trailing.clone();
    stream.read_to_end(&mut body).await.map_err(BareError::from)?;
    Ok(body)
}

/// Minimal chunked-transfer-encoding decoder (RFC 7230 §4.1), starting
/// from whatever chunk bytes already sit in `head.trailing`.
pub async fn read_chunked_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    head: &ResponseHead,
) -> Result<Vec<u8>, BareError> {
    let mut buf = head.trailing.clone();
    let mut out = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut pos = 0usize;

    loop {
        let line_end = loop {
            if let Some(rel) = find_subslice(&buf[pos..], b"\r\n") {
                break pos + rel;
            }
            let n = stream.read(&mut tmp).await.map_err(BareError::from)?;
            if n == 0 {
                return Err(BareError::ConnectionReset { detail: "upstream closed mid-chunk-size".into() });
            }
            buf.extend_from_slice(&tmp[..n]);
        };

        let size_line = std::str::from_utf8(&buf[pos..line_end])
            .map_err(|_| BareError::invalid("invalid chunk size line"))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| BareError::invalid(format!("invalid chunk size: {size_str:?}")))?;
        pos = line_end + 2;

        if size == 0 {
            break;
        }

        while buf.len() < pos + size + 2 {
            let n = stream.read(&mut tmp).await.map_err(BareError::from)?;
            if n == 0 {
                return Err(BareError::ConnectionReset { detail: "upstream closed mid-chunk-data".into() });
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        out.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }

    Ok(out)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_injects_content_length() {
        smol::block_on(async {
            let mut out = Vec::new();
            let req = OutboundRequest {
                method: "POST",
                host: "example.com",
                port: 443,
                default_port: 443,
                path: "/a",
                headers: &[("User-Agent".to_string(), "t".to_string())],
            };
            let mut body = futures_lite::io::Cursor::new(b"hi".to_vec());
            write_request(&mut out, &req, &mut body, Some(2), &CancelToken::new()).await.unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.starts_with("POST /a HTTP/1.1\r\n"));
            assert!(text.contains("Host: example.com\r\n"));
            assert!(text.contains("Content-Length: 2\r\n"));
            assert!(text.ends_with("hi"));
        });
    }

    #[test]
    fn write_request_appends_non_default_port() {
        smol::block_on(async {
            let mut out = Vec::new();
            let req = OutboundRequest {
                method: "GET",
                host: "example.com",
                port: 8443,
                default_port: 443,
                path: "/",
                headers: &[],
            };
            let mut body = futures_lite::io::empty();
            write_request(&mut out, &req, &mut body, Some(0), &CancelToken::new()).await.unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.contains("Host: example.com:8443\r\n"));
        });
    }

    #[test]
    fn write_request_does_not_duplicate_caller_supplied_host() {
        smol::block_on(async {
            let mut out = Vec::new();
            let req = OutboundRequest {
                method: "GET",
                host: "example.com",
                port: 443,
                default_port: 443,
                path: "/",
                headers: &[("Host".to_string(), "override.example".to_string())],
            };
            let mut body = futures_lite::io::empty();
            write_request(&mut out, &req, &mut body, Some(0), &CancelToken::new()).await.unwrap();
            let text = String::from_utf8(out).unwrap();
            assert_eq!(text.matches("Host:").count(), 1);
            assert!(text.contains("Host: override.example\r\n"));
        });
    }

    #[test]
    fn reads_head_and_fixed_body() {
        smol::block_on(async {
            let mut input =
                futures_lite::io::Cursor::new(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Foo: Bar\r\n\r\nhello".to_vec());
            let head = read_response_head(&mut input).await.unwrap();
            assert_eq!(head.status, 200);
            assert_eq!(head.header("x-foo"), Some("Bar"));
            let body = read_fixed_body(&mut input, &head, head.content_length().unwrap()).await.unwrap();
            assert_eq!(body, b"hello");
        });
    }

    #[test]
    fn decodes_chunked_body() {
        smol::block_on(async {
            let mut input = futures_lite::io::Cursor::new(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec(),
            );
            let head = read_response_head(&mut input).await.unwrap();
            assert!(head.is_chunked());
            let body = read_chunked_body(&mut input, &head).await.unwrap();
            assert_eq!(body, b"Wikipedia");
        });
    }

    #[test]
    fn no_body_statuses_are_flagged() {
        smol::block_on(async {
            let mut input = futures_lite::io::Cursor::new(b"HTTP/1.1 304 Not Modified\r\n\r\n".to_vec());
            let head = read_response_head(&mut input).await.unwrap();
            assert!(head.is_no_body_status());
        });
    }
}
