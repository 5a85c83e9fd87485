//! TCP front end for `bare-core`: binds a listener, reads inbound
//! HTTP/1.1 heads with `httparse`, and hands each exchange to
//! `bare_core::BareServer`. Wiring (logger → signal handler → accept
//! loop → graceful drain) mirrors `rproxy::lib::run` and
//! `httproxy::start::handle_local_target`; CLI argument parsing uses
//! plain environment variables instead of `sarge`, which the pack does
//! not carry a fetchable replacement for (see DESIGN.md).

mod inbound;
mod logger;

use std::net::SocketAddr;
use std::sync::Arc;

use bare_core::ratelimit::RateLimitConfig;
use bare_core::{BareError, BareServer, BareServerConfig, GracefulShutdown, Maintainer, Method, Project, RateLimitGate, Request, Response, UpgradedStream};
use futures_lite::future;
use smol::net::{TcpListener, TcpStream};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn build_config() -> BareServerConfig {
    let project = Project {
        name: "bare-server".to_string(),
        description: "HTTP(S)/WebSocket tunneling proxy implementing the bare protocol.".to_string(),
        repository: env_or("BARE_REPOSITORY", "https://github.com/example/bare-server"),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let mut config = BareServerConfig::new(env_or("BARE_PREFIX", "/"), project)
        .with_block_local(bool_env("BARE_BLOCK_LOCAL", true))
        .with_strict_v1_forward(bool_env("BARE_STRICT_V1_FORWARD", false))
        .with_log_errors(bool_env("BARE_LOG_ERRORS", false));

    if let Ok(raw_capacity) = std::env::var("BARE_RATE_LIMIT_CAPACITY") {
        let capacity: u32 = raw_capacity.parse().unwrap_or(300);
        let refill_per_sec: f64 = std::env::var("BARE_RATE_LIMIT_REFILL").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0);
        config = config.with_rate_limit(RateLimitConfig { capacity, refill_per_sec });
    }

    if let Ok(email) = std::env::var("BARE_MAINTAINER_EMAIL") {
        config = config.with_maintainer(Maintainer { email: Some(email), website: std::env::var("BARE_MAINTAINER_WEBSITE").ok() });
    }

    config
}

fn main() -> anyhow::Result<()> {
    logger::init(&env_or("BARE_LOG_LEVEL", "info"), std::env::var("NO_COLOR").is_err())?;
    smol::block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let bind_addr: SocketAddr = env_or("BARE_BIND", "0.0.0.0:8080").parse()?;
    let server = Arc::new(BareServer::new(build_config()));
    let shutdown = server.shutdown_handle();

    let ctrlc = ctrlc2::AsyncCtrlC::new(move || {
        println!("Ctrl-C received! Ready to exiting...");
        true
    })?;
    let shutdown_for_signal = shutdown.clone();
    smol::spawn(async move {
        let _ = ctrlc.await;
        log::info!("Shutdown requested (Ctrl+C). Waiting for in-flight requests...");
        shutdown_for_signal.initiate();
    })
    .detach();

    let meta_reaper = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        smol::spawn(async move { server.meta_store().run_reaper(shutdown).await })
    };

    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("bare-server listening on {bind_addr}");

    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, &shutdown).await? else { break };
        let server = server.clone();
        let shutdown = shutdown.clone();
        smol::spawn(async move {
            let _guard = shutdown.inflight_guard();
            if let Err(err) = handle_connection(server, stream, peer).await {
                log::warn!("peer={peer} error: {err}");
            }
        })
        .detach();
    }

    shutdown.wait_inflight_zero().await;
    meta_reaper.await;
    server.pool().clear().await;
    log::info!("Shutdown complete.");
    Ok(())
}

async fn accept_or_shutdown(listener: &TcpListener, shutdown: &GracefulShutdown) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept_fut = async { listener.accept().await.map(Some) };
    let shutdown_fut = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept_fut, shutdown_fut).await
}

async fn handle_connection(server: Arc<BareServer>, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let head = match inbound::read_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            let resp = Response::from_bare_error(&err, false, None);
            let _ = resp.write_to(&mut stream).await;
            return Ok(());
        }
    };

    if !server.should_route(&head.path_and_query) {
        let resp = Response::from_bare_error(&BareError::NotFound, false, None);
        resp.write_to(&mut stream).await?;
        return Ok(());
    }

    if head.is_upgrade() && head.method == Method::Get {
        let probe = Request::from_parts(head.method, head.version, head.path_and_query.clone(), head.raw_headers.clone(), peer, ());
        if let RateLimitGate::Limited(resp) = server.check_rate_limit(&probe).await {
            resp.write_to(&mut stream).await?;
            return Ok(());
        }

        let path = head.path_and_query.clone();
        let raw_headers = head.raw_headers.clone();
        let upgraded = UpgradedStream::new(head.prelude, stream);
        if let Err(err) = server.dispatch_ws(&path, upgraded, &raw_headers).await {
            log::warn!("peer={peer} websocket upgrade failed: {err}");
        }
        return Ok(());
    }

    let mut req = match inbound::into_http_request(head, peer, stream.clone()).await {
        Ok(req) => req,
        Err(err) => {
            let resp = Response::from_bare_error(&err, false, None);
            resp.write_to(&mut stream).await?;
            return Ok(());
        }
    };

    let response = server.dispatch_http(&mut req).await;
    response.write_to(&mut stream).await?;
    Ok(())
}
