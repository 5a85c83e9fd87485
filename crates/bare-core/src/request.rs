//! Typed wrapper over the inbound exchange (spec.md §3/§4.F, component H).
//!
//! Field shape mirrors the teacher's `httpserver::serve::request::Request`
//! (`method`, `path`, `headers`, `body`, `peer`), but keeps the raw header
//! sequence (not just a lowercased map) so case-preserving round trips
//! (codec.rs) are possible, and exposes the body as a bounded reader
//! instead of a fully materialized buffer so large tunneled bodies
//! stream rather than being buffered in memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::codec::RawHeaders;
use crate::error::BareError;

/// Carried alongside the request so the rate limiter's keep-alive
/// heuristic (spec.md §9 (ii), see `ratelimit::is_keep_alive`) has
/// something to key off; the request model otherwise has no use for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Other,
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            _ => Self::Other,
        }
    }

    pub fn is_options(&self) -> bool {
        matches!(self, Self::Options)
    }

    /// Methods whose response must carry no body (spec.md §4.F).
    pub fn forces_empty_response(&self) -> bool {
        matches!(self, Self::Head)
    }
}

/// A request body bounded by a known `Content-Length`, backed by bytes
/// already buffered from the header read plus whatever remains on the
/// socket. Implements `AsyncRead` so it can be streamed with
/// `futures_lite::io::copy` straight into an outbound request writer
/// (spec.md §4.D "pipe the inbound body").
pub struct BodyReader<R> {
    prelude: Vec<u8>,
    prelude_pos: usize,
    content_length: u64,
    remaining: u64,
    inner: Option<R>,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    pub fn new(prelude: Vec<u8>, content_length: u64, inner: R) -> Self {
        let remaining = content_length.saturating_sub(prelude.len() as u64);
        Self { prelude, prelude_pos: 0, content_length, remaining, inner: Some(inner) }
    }

    pub fn empty() -> Self {
        Self { prelude: Vec::new(), prelude_pos: 0, content_length: 0, remaining: 0, inner: None }
    }

    /// Total body size this reader was constructed with, unaffected by
    /// how much has been read so far; lets an outbound writer emit
    /// `Content-Length` without buffering the body first.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Takes the wrapped socket once the body has been fully read, so a
    /// caller can hand it back to a connection pool instead of dropping
    /// it. Returns `None` if called before EOF or more than once.
    pub fn take_inner(&mut self) -> Option<R> {
        if self.remaining == 0 { self.inner.take() } else { None }
    }

    pub async fn read_to_vec(mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(out)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BodyReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.prelude_pos < self.prelude.len() {
            let n = std::cmp::min(buf.len(), self.prelude.len() - self.prelude_pos);
            buf[..n].copy_from_slice(&self.prelude[self.prelude_pos..self.prelude_pos + n]);
            self.prelude_pos += n;
            return Poll::Ready(Ok(n));
        }
        if self.remaining == 0 {
            return Poll::Ready(Ok(0));
        }
        let remaining = self.remaining;
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let cap = std::cmp::min(buf.len() as u64, remaining) as usize;
        match Pin::new(inner).poll_read(cx, &mut buf[..cap]) {
            Poll::Ready(Ok(n)) => {
                self.remaining = self.remaining.saturating_sub(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

/// A socket that has already had its HTTP/1.1 head parsed off, with any
/// bytes the client pipelined immediately after the upgrade request
/// (analogous to the outbound `headBuffer` in spec.md §4.D's
/// `bareUpgradeFetch`) replayed before further reads reach the socket.
/// Writes pass straight through. This is what the WS handlers relay
/// once the remote leg is dialed.
pub struct UpgradedStream<S> {
    prelude: Vec<u8>,
    prelude_pos: usize,
    inner: S,
}

impl<S> UpgradedStream<S> {
    pub fn new(prelude: Vec<u8>, inner: S) -> Self {
        Self { prelude, prelude_pos: 0, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for UpgradedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.prelude_pos < self.prelude.len() {
            let n = std::cmp::min(buf.len(), self.prelude.len() - self.prelude_pos);
            buf[..n].copy_from_slice(&self.prelude[self.prelude_pos..self.prelude_pos + n]);
            self.prelude_pos += n;
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for UpgradedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Inbound exchange, already through head parsing; the body is not yet
/// consumed (see [`BodyReader`]).
pub struct Request<B> {
    pub method: Method,
    pub version: HttpVersion,
    pub path_and_query: String,
    pub raw_headers: RawHeaders,
    pub lowercase_headers: HashMap<String, String>,
    pub peer: SocketAddr,
    pub body: B,
}

impl<B> Request<B> {
    pub fn from_parts(
        method: Method,
        version: HttpVersion,
        path_and_query: String,
        raw_headers: RawHeaders,
        peer: SocketAddr,
        body: B,
    ) -> Self {
        let lowercase_headers = raw_headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        Self { method, version, path_and_query, raw_headers, lowercase_headers, peer, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.lowercase_headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn required_header(&self, name: &str) -> Result<&str, BareError> {
        self.header(name).ok_or_else(|| BareError::missing(name))
    }

    pub fn path(&self) -> &str {
        self.path_and_query.split('?').next().unwrap_or(&self.path_and_query)
    }

    pub fn query(&self) -> Option<&str> {
        self.path_and_query.split_once('?').map(|(_, q)| q)
    }

    pub fn has_query_flag(&self, flag: &str) -> bool {
        self.query()
            .map(|q| q.split('&').any(|kv| kv == flag || kv.starts_with(&format!("{flag}="))))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_split() {
        let req: Request<()> = Request::from_parts(
            Method::Get,
            HttpVersion::Http11,
            "/v2/?cache&x=1".to_string(),
            vec![],
            "127.0.0.1:1".parse().unwrap(),
            (),
        );
        assert_eq!(req.path(), "/v2/");
        assert!(req.has_query_flag("cache"));
        assert!(!req.has_query_flag("nope"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req: Request<()> = Request::from_parts(
            Method::Get,
            HttpVersion::Http11,
            "/".to_string(),
            vec![("X-Bare-Host".to_string(), "example.com".to_string())],
            "127.0.0.1:1".parse().unwrap(),
            (),
        );
        assert_eq!(req.header("x-bare-host"), Some("example.com"));
        assert!(req.required_header("x-bare-port").is_err());
    }

    #[test]
    fn body_reader_streams_prelude_then_socket_bytes() {
        smol::block_on(async {
            let prelude = b"ab".to_vec();
            let rest = futures_lite::io::Cursor::new(b"cdef".to_vec());
            let reader = BodyReader::new(prelude, 6, rest);
            let out = reader.read_to_vec().await.unwrap();
            assert_eq!(out, b"abcdef");
        });
    }

    #[test]
    fn upgraded_stream_replays_prelude_then_reads_inner() {
        smol::block_on(async {
            let inner = futures_lite::io::Cursor::new(b"def".to_vec());
            let mut stream = UpgradedStream::new(b"abc".to_vec(), inner);
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"abcdef");
        });
    }
}
