//! Growing-buffer HTTP/1.1 head reader, adapted from
//! `httproxy::start::read_client_request`: same `\r\n\r\n`-scanning read
//! loop, 64-header `httparse` slot budget and 32 KiB header cap, but
//! producing a `bare_core::Request` instead of a local `ClientRequest`
//! struct, and leaving body/prelude consumption to the caller so the
//! same parsed head serves both the plain-HTTP and WebSocket-upgrade
//! paths.

use bare_core::codec::RawHeaders;
use bare_core::{BareError, BodyReader, HttpVersion, Method, Request};
use futures_lite::AsyncReadExt;
use smol::net::TcpStream;

const MAX_HEADER_BYTES: usize = 32 * 1024;
pub const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// An inbound head, plus whatever bytes the client pipelined right after
/// it (the start of the body for a plain request, or the start of the
/// WebSocket frame stream for an upgrade).
pub struct ParsedHead {
    pub method: Method,
    pub version: HttpVersion,
    pub path_and_query: String,
    pub raw_headers: RawHeaders,
    pub prelude: Vec<u8>,
}

impl ParsedHead {
    pub fn is_upgrade(&self) -> bool {
        self.raw_headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("upgrade") && v.to_ascii_lowercase().contains("websocket"))
    }

    fn content_length(&self) -> Option<u64> {
        self.raw_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }

    fn is_chunked(&self) -> bool {
        self.raw_headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.trim().eq_ignore_ascii_case("chunked"))
    }
}

pub async fn read_head(stream: &mut TcpStream) -> Result<ParsedHead, BareError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut tmp).await.map_err(BareError::from)?;
        if n == 0 {
            return Err(BareError::ConnectionReset { detail: "peer closed before sending a full request head".into() });
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(BareError::invalid("request headers too large"));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = &buf[..header_end];
    let mut header_slots = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_slots);
    match parsed.parse(head).map_err(|e| BareError::invalid(format!("malformed request head: {e}")))? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(BareError::invalid("incomplete request head")),
    }

    let method = Method::parse(parsed.method.ok_or_else(|| BareError::invalid("missing method"))?);
    let path_and_query = parsed.path.ok_or_else(|| BareError::invalid("missing path"))?.to_string();
    let version = match parsed.version.ok_or_else(|| BareError::invalid("missing HTTP version"))? {
        1 => HttpVersion::Http11,
        _ => HttpVersion::Http10,
    };

    let raw_headers: RawHeaders = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    Ok(ParsedHead { method, version, path_and_query, raw_headers, prelude: buf[header_end..].to_vec() })
}

/// Turns a parsed head into a full `Request` for the plain-HTTP path:
/// reads the remaining `Content-Length` bytes off the socket (chunked
/// request bodies are rejected, matching the teacher's reader).
pub async fn into_http_request(
    head: ParsedHead,
    peer: std::net::SocketAddr,
    stream: TcpStream,
) -> Result<Request<BodyReader<TcpStream>>, BareError> {
    if head.is_chunked() {
        return Err(BareError::invalid("chunked request bodies are not supported"));
    }
    let content_length = head.content_length().unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(BareError::invalid(format!("request body too large: {content_length} bytes")));
    }
    let body = BodyReader::new(head.prelude, content_length, stream);
    Ok(Request::from_parts(head.method, head.version, head.path_and_query, head.raw_headers, peer, body))
}
