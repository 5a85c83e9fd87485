//! Outbound fetch (spec.md §4.D): dialing the remote, SSRF gating, and
//! the three fetch flavors (`bareFetch`, `bareUpgradeFetch`,
//! `webSocketFetch`). Connection setup follows `httproxy::start`'s
//! `TcpStream::connect` + `tunnel()` pattern; TLS wraps the same socket
//! type via `fetch::tls`, so the relay code downstream never needs to
//! know whether it is holding a plain or TLS-wrapped connection.

pub mod http1;
pub mod ssrf;
pub mod tls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::{AsyncRead, AsyncWrite};
use mea::mutex::Mutex;

use crate::error::BareError;
use crate::remote::Remote;
use crate::request::{BodyReader, UpgradedStream};
use crate::shutdown::CancelToken;
use ssrf::SsrfPolicy;

/// Outbound upgrade request timeout (spec.md §5 "outbound upgrade
/// request 12 s").
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(12);

pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

enum RawDial {
    Plain(smol::net::TcpStream),
    Tls(futures_rustls::client::TlsStream<smol::net::TcpStream>),
}

impl AsyncRead for RawDial {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            RawDial::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            RawDial::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawDial {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            RawDial::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            RawDial::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            RawDial::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            RawDial::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            RawDial::Plain(s) => std::pin::Pin::new(s).poll_close(cx),
            RawDial::Tls(s) => std::pin::Pin::new(s).poll_close(cx),
        }
    }
}

/// Keyed by scheme/host/port, the way a browser's HTTP(S) agent keeps
/// its keep-alive sockets (spec.md:132 "Connection pools ... MUST
/// support keep-alive and be destroyed on close()"). Locking follows the
/// same `mea::mutex::Mutex<HashMap<..>>` idiom as `meta.rs`'s
/// `InMemoryMetaBackend`, here keyed on the dial target instead of a
/// string id and holding idle sockets instead of JSON values.
#[derive(Hash, Eq, PartialEq, Clone)]
struct PoolKey {
    tls: bool,
    host: String,
    port: u16,
}

#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<Box<dyn DuplexStream>>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(remote: &Remote) -> PoolKey {
        PoolKey { tls: remote.protocol.is_tls(), host: remote.host.clone(), port: remote.port }
    }

    async fn acquire(&self, remote: &Remote) -> Option<Box<dyn DuplexStream>> {
        self.idle.lock().await.get_mut(&Self::key(remote)).and_then(|sockets| sockets.pop())
    }

    async fn release(&self, remote: &Remote, stream: Box<dyn DuplexStream>) {
        self.idle.lock().await.entry(Self::key(remote)).or_default().push(stream);
    }

    /// Drops every idle socket. Called from `BareServer`'s shutdown path
    /// (spec.md:132 "be destroyed on close()").
    pub async fn clear(&self) {
        self.idle.lock().await.clear();
    }
}

/// Whether an upstream response head permits handing the socket back to
/// the pool: HTTP/1.1 implies keep-alive unless it says otherwise, and
/// the body framing must be self-terminating (fixed-length or chunked;
/// an EOF-terminated body leaves nothing to reuse).
fn is_keep_alive_eligible(head: &http1::ResponseHead) -> bool {
    let closes = head.header("connection").is_some_and(|v| v.eq_ignore_ascii_case("close"));
    !closes && (head.content_length().is_some() || head.is_chunked() || head.is_no_body_status())
}

/// Resolves `remote.host`, applying the SSRF gate (§6.4) either to a
/// literal IP (`filter_remote`) or to every candidate a DNS lookup
/// returns (`check_resolved`), then connects and TLS-wraps as needed.
/// Skips the gate and the handshake entirely when `pool` hands back an
/// idle keep-alive connection for this target.
pub async fn dial(remote: &Remote, ssrf: &SsrfPolicy, pool: &ConnectionPool) -> Result<Box<dyn DuplexStream>, BareError> {
    if let Some(reused) = pool.acquire(remote).await {
        return Ok(reused);
    }

    let tcp = if let Ok(ip) = remote.host.parse::<std::net::IpAddr>() {
        ssrf.filter_remote(&ip)?;
        smol::net::TcpStream::connect((ip, remote.port)).await.map_err(BareError::from)?
    } else {
        let addrs = smol::net::resolve((remote.host.as_str(), remote.port))
            .await
            .map_err(BareError::from)?;
        let mut chosen = None;
        for addr in addrs {
            if ssrf.check_resolved(&remote.host, &addr.ip()).is_ok() {
                chosen = Some(addr);
                break;
            }
        }
        let addr = chosen.ok_or_else(|| BareError::HostNotFound {
            detail: format!("no routable address found for {}", remote.host),
        })?;
        smol::net::TcpStream::connect(addr).await.map_err(BareError::from)?
    };

    if remote.protocol.is_tls() {
        let tls = tls::connect(&remote.host, tcp).await?;
        Ok(Box::new(RawDial::Tls(tls)))
    } else {
        Ok(Box::new(RawDial::Plain(tcp)))
    }
}

pub struct InboundResponse {
    pub head: http1::ResponseHead,
    pub stream: Box<dyn DuplexStream>,
    /// Set once a `bare_fetch` caller consumes a fixed-length or
    /// no-body response in full, so the socket can be handed back to
    /// `pool` instead of closed. `None` for EOF-terminated bodies and
    /// the raw upgrade path, which always close their socket.
    keep_alive: Option<(Remote, Arc<ConnectionPool>)>,
}

/// `bareFetch`: dials (reusing a pooled connection when one is idle),
/// streams `body` onto the wire without buffering it, and returns as
/// soon as the response head is parsed; the caller streams the body
/// from `stream` afterward via [`response_body_stream`].
pub async fn bare_fetch<B: AsyncRead + Unpin>(
    remote: &Remote,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
    req: http1::OutboundRequest<'_>,
    body: &mut B,
    content_length: Option<u64>,
) -> Result<InboundResponse, BareError> {
    let mut resp = bare_fetch_raw(remote, ssrf, pool, cancel, req, body, content_length).await?;
    if resp.head.status == 101 {
        return Err(BareError::UpgradeUnexpected);
    }
    if !is_keep_alive_eligible(&resp.head) {
        resp.keep_alive = None;
    }
    Ok(resp)
}

/// `bareUpgradeFetch` (v1/v2): writes an `Upgrade: websocket` request
/// with no body and expects a `101` on the returned socket; any other
/// status is an error. Upgraded sockets are never pooled.
pub async fn bare_upgrade_fetch(
    remote: &Remote,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
    mut headers: Vec<(String, String)>,
    path: &str,
) -> Result<InboundResponse, BareError> {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("connection")) {
        headers.push(("Connection".to_string(), "Upgrade".to_string()));
    }
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("upgrade")) {
        headers.push(("Upgrade".to_string(), "websocket".to_string()));
    }

    let http_equivalent_remote = Remote {
        protocol: remote.protocol.to_http_equivalent(),
        ..remote.clone()
    };

    let req = http1::OutboundRequest {
        method: "GET",
        host: &remote.host,
        port: http_equivalent_remote.port,
        default_port: http_equivalent_remote.protocol.default_port(),
        path,
        headers: &headers,
    };

    let mut empty = futures_lite::io::empty();
    let fetch = bare_fetch_raw(&http_equivalent_remote, ssrf, pool, cancel, req, &mut empty, Some(0));
    let timeout = smol::Timer::after(UPGRADE_TIMEOUT);
    futures_lite::future::or(
        async move {
            let resp = fetch.await?;
            if resp.head.status != 101 {
                return Err(BareError::UpgradeUnexpected);
            }
            Ok(resp)
        },
        async move {
            timeout.await;
            Err(BareError::ConnectionTimeout { detail: "outbound upgrade request timed out".into() })
        },
    )
    .await
}

/// Like `bare_fetch` but does not reject a `101` status (used
/// internally by `bare_upgrade_fetch`, which expects one).
async fn bare_fetch_raw<B: AsyncRead + Unpin>(
    remote: &Remote,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
    req: http1::OutboundRequest<'_>,
    body: &mut B,
    content_length: Option<u64>,
) -> Result<InboundResponse, BareError> {
    let mut stream = cancel.race(dial(remote, ssrf, pool)).await.map_err(BareError::from)??;
    cancel.race(http1::write_request(&mut stream, &req, body, content_length, cancel)).await.map_err(BareError::from)??;
    let head = cancel.race(http1::read_response_head(&mut stream)).await.map_err(BareError::from)??;
    Ok(InboundResponse { head, stream, keep_alive: Some((remote.clone(), pool.clone())) })
}

/// `webSocketFetch` (v3) is the same outbound upgrade as v1/v2; the
/// distinction spec.md draws is client-library shape (a WS client vs.
/// a raw-socket upgrade), which collapses to the same call here since
/// both legs degrade to byte-tunnel relay after the handshake.
pub async fn websocket_fetch(
    remote: &Remote,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
    headers: Vec<(String, String)>,
    path: &str,
) -> Result<InboundResponse, BareError> {
    bare_upgrade_fetch(remote, ssrf, pool, cancel, headers, path).await
}

pub fn shared_ssrf_policy(block_local: bool) -> Arc<SsrfPolicy> {
    Arc::new(SsrfPolicy::new(block_local))
}

/// Streams the body following an already-parsed response head
/// (spec.md §4.F "otherwise stream the remote body through") instead
/// of buffering it, dispatching on framing the same way
/// `read_response_body` used to: fixed `Content-Length` reuses
/// [`BodyReader`], an upgrade/EOF body reuses [`UpgradedStream`] since
/// both are "replay a prelude then pass the socket through" readers.
/// Chunked transfer-encoding is still decoded eagerly into memory —
/// a correct incremental chunk decoder needs care this crate can't
/// validate without compiling, so it stays buffered rather than risk a
/// broken streaming decoder.
///
/// When the response is fixed-length or no-body and keep-alive
/// eligible, the socket is handed back to the pool once the body
/// reader reaches EOF.
pub async fn response_body_stream(
    resp: InboundResponse,
) -> Result<(Box<dyn AsyncRead + Unpin + Send>, Option<u64>), BareError> {
    let InboundResponse { head, mut stream, keep_alive } = resp;

    if head.is_no_body_status() {
        if let Some((remote, pool)) = keep_alive {
            pool.release(&remote, stream).await;
        }
        return Ok((Box::new(futures_lite::io::empty()), Some(0)));
    }

    if head.is_chunked() {
        let body = http1::read_chunked_body(&mut stream, &head).await?;
        let len = body.len() as u64;
        if let Some((remote, pool)) = keep_alive {
            pool.release(&remote, stream).await;
        }
        return Ok((Box::new(futures_lite::io::Cursor::new(body)), Some(len)));
    }

    if let Some(len) = head.content_length() {
        let reader = PoolReleasingBody::new(BodyReader::new(head.trailing, len, stream), keep_alive);
        return Ok((Box::new(reader), Some(len)));
    }

    Ok((Box::new(UpgradedStream::new(head.trailing, stream)), None))
}

/// Wraps a fixed-length [`BodyReader`] so the underlying socket goes
/// back to the connection pool the moment the body is fully read,
/// rather than needing the caller to do it explicitly.
struct PoolReleasingBody {
    inner: BodyReader<Box<dyn DuplexStream>>,
    keep_alive: Option<(Remote, Arc<ConnectionPool>)>,
    released: bool,
}

impl PoolReleasingBody {
    fn new(inner: BodyReader<Box<dyn DuplexStream>>, keep_alive: Option<(Remote, Arc<ConnectionPool>)>) -> Self {
        Self { inner, keep_alive, released: false }
    }
}

impl AsyncRead for PoolReleasingBody {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match std::pin::Pin::new(&mut this.inner).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(0)) if !this.released => {
                this.released = true;
                if let Some((remote, pool)) = this.keep_alive.take() {
                    if let Some(stream) = this.inner.take_inner() {
                        smol::spawn(async move { pool.release(&remote, stream).await }).detach();
                    }
                }
                std::task::Poll::Ready(Ok(0))
            }
            other => other,
        }
    }
}
