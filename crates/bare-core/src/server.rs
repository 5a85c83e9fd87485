//! Prefix routing, CORS injection, rate limiting and the error funnel
//! (spec.md §4.G, component G). Mirrors the teacher's
//! `httpserver::serve` module shape (a `Router`-like dispatch plus a
//! `Response` builder chain) generalized from a single static-file
//! route to the v1/v2/v3 sub-path table.
//!
//! This module never touches a socket directly — per spec.md §1 "the
//! design treats the HTTP listener as an external caller that routes
//! incoming exchanges into this core by prefix" — the TCP accept loop
//! and inbound HTTP parsing live in the `bare-server` binary crate.

use std::sync::Arc;

use futures_lite::{AsyncRead, AsyncWrite};

use crate::error::BareError;
use crate::fetch::{ConnectionPool, ssrf::SsrfPolicy};
use crate::manifest::{Maintainer, Manifest, Project};
use crate::meta::MetaStore;
use crate::ratelimit::{self, RateLimitConfig, RateLimiter};
use crate::request::{BodyReader, HttpVersion, Request, UpgradedStream};
use crate::response::{Header, Response};
use crate::shutdown::GracefulShutdown;
use crate::versions::{v1, v2, v3};

#[derive(Clone)]
pub struct BareServerConfig {
    pub mount_prefix: String,
    pub block_local: bool,
    /// Open Question decision (i), spec.md §9: v1 stays permissive by
    /// default; set to enforce the v2/v3 forbidden-forward list on v1 too.
    pub strict_v1_forward: bool,
    pub log_errors: bool,
    pub rate_limit: Option<RateLimitConfig>,
    pub project: Project,
    pub maintainer: Option<Maintainer>,
}

impl BareServerConfig {
    pub fn new(mount_prefix: impl Into<String>, project: Project) -> Self {
        Self {
            mount_prefix: mount_prefix.into(),
            block_local: true,
            strict_v1_forward: false,
            log_errors: false,
            rate_limit: None,
            project,
            maintainer: None,
        }
    }

    pub fn with_block_local(mut self, block_local: bool) -> Self {
        self.block_local = block_local;
        self
    }

    pub fn with_strict_v1_forward(mut self, strict: bool) -> Self {
        self.strict_v1_forward = strict;
        self
    }

    pub fn with_log_errors(mut self, log_errors: bool) -> Self {
        self.log_errors = log_errors;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_maintainer(mut self, maintainer: Maintainer) -> Self {
        self.maintainer = Some(maintainer);
        self
    }
}

/// Outcome of the per-IP token-bucket gate (spec.md §4.K), threaded
/// through both the plain-HTTP dispatch path and the WS upgrade path in
/// `bare-server`'s accept loop (which must write a 429 on the raw socket
/// itself rather than go through `dispatch_http`).
pub enum RateLimitGate {
    Allowed(Vec<Header>),
    Limited(Response),
}

pub struct BareServer {
    config: BareServerConfig,
    ssrf: Arc<SsrfPolicy>,
    meta: MetaStore,
    rate_limiter: RateLimiter,
    manifest: Manifest,
    shutdown: GracefulShutdown,
    pool: Arc<ConnectionPool>,
}

impl BareServer {
    pub fn new(config: BareServerConfig) -> Self {
        let ssrf = Arc::new(SsrfPolicy::new(config.block_local));
        let rate_limiter = match &config.rate_limit {
            Some(cfg) => RateLimiter::new(cfg.clone()),
            None => RateLimiter::disabled(),
        };
        let manifest = Manifest::new(config.project.clone(), config.maintainer.clone());
        Self {
            config,
            ssrf,
            meta: MetaStore::in_memory(),
            rate_limiter,
            manifest,
            shutdown: GracefulShutdown::new(),
            pool: Arc::new(ConnectionPool::new()),
        }
    }

    /// Outbound keep-alive socket pool, shared by every v1/v2/v3
    /// handler's `bare_fetch` call (spec.md:132). `bare-server`'s
    /// shutdown path tears it down via `pool().clear()` once in-flight
    /// exchanges have drained.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn with_ssrf_policy(mut self, ssrf: SsrfPolicy) -> Self {
        self.ssrf = Arc::new(ssrf);
        self
    }

    pub fn with_meta_store(mut self, meta: MetaStore) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta_store(&self) -> &MetaStore {
        &self.meta
    }

    pub fn shutdown_handle(&self) -> GracefulShutdown {
        self.shutdown.clone()
    }

    /// `shouldRoute` (spec.md §3 invariants / §4.G): the external listener
    /// must not touch the socket at all when this returns `false`.
    pub fn should_route(&self, path_and_query: &str) -> bool {
        path_and_query.starts_with(&self.config.mount_prefix) && !self.shutdown.is_shutting_down()
    }

    fn sub_path<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.config.mount_prefix.as_str()).unwrap_or(path)
    }

    /// Per-IP rate gate; shared by `dispatch_http` and by the WS upgrade
    /// path in `bare-server`, which calls this before attempting the
    /// upgrade handshake (spec.md §4.K "for a WS upgrade, write the 429
    /// response on the raw socket and end").
    pub async fn check_rate_limit<B>(&self, req: &Request<B>) -> RateLimitGate {
        if !self.rate_limiter.is_enabled() {
            return RateLimitGate::Allowed(Vec::new());
        }
        let ip = ratelimit::resolve_client_ip(req.header("x-forwarded-for"), req.header("x-real-ip"), req.peer.ip());
        let keep_alive = ratelimit::is_keep_alive(req.version == HttpVersion::Http11, req.header("connection"));
        let outcome = self.rate_limiter.check(ip, keep_alive).await;
        if outcome.allowed {
            RateLimitGate::Allowed(outcome.headers())
        } else {
            let mut resp = Response::from_bare_error(&outcome.to_error(), false, None);
            resp.headers.push(outcome.retry_after_header());
            resp.headers.extend(outcome.headers());
            RateLimitGate::Limited(resp)
        }
    }

    /// `routeRequest` for a non-upgrade exchange: OPTIONS pre-flight,
    /// rate limiting, sub-path dispatch, and the error funnel, all ending
    /// in a CORS-stamped response (spec.md §4.G).
    pub async fn dispatch_http<R: AsyncRead + Unpin>(&self, req: &mut Request<BodyReader<R>>) -> Response {
        if req.method.is_options() {
            return Response::new().with_status(200, "OK").without_body().with_cors(None);
        }

        let gate_headers = match self.check_rate_limit(req).await {
            RateLimitGate::Allowed(headers) => headers,
            RateLimitGate::Limited(resp) => return resp,
        };

        let sub_path = self.sub_path(req.path()).to_string();
        let mut resp = match self.route_http(&sub_path, req).await {
            Ok(resp) => resp,
            Err(err) => Response::from_bare_error(&err, self.config.log_errors, None),
        };
        resp.headers.extend(gate_headers);
        resp
    }

    async fn route_http<R: AsyncRead + Unpin>(&self, sub_path: &str, req: &mut Request<BodyReader<R>>) -> Result<Response, BareError> {
        // Each exchange gets its own cancellation token, wired to the
        // server's shutdown signal (spec.md §5 trigger (c)); v1/v2/v3's
        // `bare_fetch` additionally fires it if the inbound body or the
        // outbound socket closes mid-exchange.
        let cancel = self.shutdown.cancel_token();
        match sub_path {
            "" | "/" => Ok(self.manifest_response()),
            "v1/" => v1::handle_http(req, &self.ssrf, &self.pool, &cancel, self.config.strict_v1_forward).await,
            "v1/ws-new-meta" => Ok(v1::handle_ws_new_meta(&self.meta).await),
            "v1/ws-meta" => v1::handle_ws_meta(req.header("x-bare-id"), &self.meta).await,
            "v2/" => v2::handle_http(req, &self.ssrf, &self.pool, &cancel).await,
            "v2/ws-new-meta" => v2::handle_ws_new_meta(req, &self.meta).await,
            "v2/ws-meta" => v2::handle_ws_meta(req.header("x-bare-id"), &self.meta).await,
            "v3/" => v3::handle_http(req, &self.ssrf, &self.pool, &cancel).await,
            _ => Err(BareError::NotFound),
        }
    }

    fn manifest_response(&self) -> Response {
        Response::json(200, "OK", &self.manifest.to_json()).with_cors(None)
    }

    /// `routeUpgrade`: dispatches an already-accepted WebSocket upgrade
    /// (head parsed, socket not yet written to) by the same sub-path
    /// table, minus the manifest/ws-meta entries which never upgrade.
    pub async fn dispatch_ws<S>(&self, path: &str, inbound: UpgradedStream<S>, raw_headers: &[(String, String)]) -> Result<(), BareError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sub_path = self.sub_path(path);
        let cancel = self.shutdown.cancel_token();
        match sub_path {
            "v1/" => v1::handle_ws(inbound, raw_headers, &self.ssrf, &self.meta, &self.pool, cancel).await,
            "v2/" => v2::handle_ws(inbound, raw_headers, &self.ssrf, &self.meta, &self.pool, cancel).await,
            "v3/" => v3::handle_ws(inbound, raw_headers, &self.ssrf, &self.pool, cancel).await,
            _ => Err(BareError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Project;
    use crate::request::Method;

    fn test_project() -> Project {
        Project { name: "bare-server".into(), description: "tunneling proxy".into(), repository: "local".into(), version: "0.1.0".into() }
    }

    fn get_request(path: &str) -> Request<BodyReader<futures_lite::io::Cursor<Vec<u8>>>> {
        Request::from_parts(
            Method::Get,
            HttpVersion::Http11,
            path.to_string(),
            vec![],
            "127.0.0.1:1".parse().unwrap(),
            BodyReader::empty(),
        )
    }

    #[test]
    fn root_returns_manifest_with_cors() {
        smol::block_on(async {
            let server = BareServer::new(BareServerConfig::new("/", test_project()));
            let mut req = get_request("/");
            let resp = server.dispatch_http(&mut req).await;
            assert_eq!(resp.status, 200);
            let body = String::from_utf8_lossy(resp.body.as_ref().unwrap().as_bytes().unwrap()).into_owned();
            assert!(body.contains("\"versions\":[\"v1\",\"v2\",\"v3\"]"));
            assert!(resp.headers.iter().any(|h| h.key == "Access-Control-Allow-Origin"));
        });
    }

    #[test]
    fn options_short_circuits_before_routing() {
        smol::block_on(async {
            let server = BareServer::new(BareServerConfig::new("/", test_project()));
            let mut req = Request::from_parts(
                Method::Options,
                HttpVersion::Http11,
                "/v1/totally-unknown".to_string(),
                vec![],
                "127.0.0.1:1".parse().unwrap(),
                BodyReader::<futures_lite::io::Cursor<Vec<u8>>>::empty(),
            );
            let resp = server.dispatch_http(&mut req).await;
            assert_eq!(resp.status, 200);
            assert!(resp.body.is_none() || resp.body.as_ref().unwrap().is_empty());
        });
    }

    #[test]
    fn unknown_sub_path_is_404() {
        smol::block_on(async {
            let server = BareServer::new(BareServerConfig::new("/", test_project()));
            let mut req = get_request("/v9/");
            let resp = server.dispatch_http(&mut req).await;
            assert_eq!(resp.status, 404);
        });
    }

    #[test]
    fn should_route_respects_prefix_and_shutdown() {
        let server = BareServer::new(BareServerConfig::new("/bare/", test_project()));
        assert!(server.should_route("/bare/v1/"));
        assert!(!server.should_route("/other/"));
        server.shutdown_handle().initiate();
        assert!(!server.should_route("/bare/v1/"));
    }

    #[test]
    fn v1_ws_new_meta_round_trips_through_dispatch() {
        smol::block_on(async {
            let server = BareServer::new(BareServerConfig::new("/", test_project()));
            let mut req = get_request("/v1/ws-new-meta");
            let resp = server.dispatch_http(&mut req).await;
            assert_eq!(resp.status, 200);
            let id = String::from_utf8_lossy(resp.body.as_ref().unwrap().as_bytes().unwrap()).into_owned();
            assert_eq!(id.len(), 32);

            let mut meta_req = Request::from_parts(
                Method::Get,
                HttpVersion::Http11,
                "/v1/ws-meta".to_string(),
                vec![("x-bare-id".to_string(), id)],
                "127.0.0.1:1".parse().unwrap(),
                BodyReader::<futures_lite::io::Cursor<Vec<u8>>>::empty(),
            );
            let resp = server.dispatch_http(&mut meta_req).await;
            // no response was ever recorded for this id, so ws-meta errors.
            assert_eq!(resp.status, 400);
        });
    }

    #[test]
    fn rate_limit_blocks_after_capacity_exhausted() {
        smol::block_on(async {
            let server = BareServer::new(
                BareServerConfig::new("/", test_project()).with_rate_limit(RateLimitConfig { capacity: 1, refill_per_sec: 0.0 }),
            );
            let mut first = get_request("/");
            assert_eq!(server.dispatch_http(&mut first).await.status, 200);
            let mut second = get_request("/");
            let resp = server.dispatch_http(&mut second).await;
            assert_eq!(resp.status, 429);
            assert!(resp.headers.iter().any(|h| h.key == "Retry-After"));
        });
    }
}
