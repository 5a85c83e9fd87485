//! v2 envelope: same remote split as v1, but with explicit
//! `x-bare-pass-headers`/`x-bare-pass-status`/`x-bare-forward-headers`
//! (comma-separated), forbidden-forward/forbidden-pass enforcement, and
//! `?cache` query mode (spec.md §4.F).

use std::sync::Arc;

use futures_lite::{AsyncRead, AsyncWrite};

use crate::error::BareError;
use crate::fetch::{self, ConnectionPool, ssrf::SsrfPolicy};
use crate::headers::BareHeaders;
use crate::meta::{EnvelopeRemote, MetaResponse, MetaStore};
use crate::relay;
use crate::remote::{Remote, Scheme};
use crate::request::{Method, Request, UpgradedStream};
use crate::response::Response;
use crate::shutdown::CancelToken;
use crate::ws;

use super::common::{self, CACHE_FORWARD_HEADERS, CACHE_PASS_HEADERS, DEFAULT_FORWARD_HEADERS, DEFAULT_PASS_HEADERS, WS_DEFAULT_FORWARD_HEADERS};

fn method_str(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Put => "PUT",
        Method::Delete => "DELETE",
        Method::Patch => "PATCH",
        Method::Head => "HEAD",
        Method::Options => "OPTIONS",
        Method::Other => "GET",
    }
}

#[derive(Debug)]
struct Envelope {
    remote: Remote,
    send_headers: BareHeaders,
    forward_names: Vec<String>,
    pass_names: Vec<String>,
    pass_status: Vec<u16>,
}

fn parse_envelope(lookup: impl Fn(&str) -> Option<String>, cache: bool) -> Result<Envelope, BareError> {
    let remote = common::parse_split_remote(
        lookup("x-bare-host").as_deref(),
        lookup("x-bare-port").as_deref(),
        lookup("x-bare-protocol").as_deref(),
        lookup("x-bare-path").as_deref(),
    )?;

    let send_headers = match lookup("x-bare-headers") {
        Some(raw) => BareHeaders::from_json(&raw)?,
        None => return Err(BareError::missing("x-bare-headers")),
    };

    let declared_forward = lookup("x-bare-forward-headers").map(|raw| common::parse_name_csv(&raw)).unwrap_or_default();
    common::reject_forbidden_forward(&declared_forward)?;
    let mut forward_names: Vec<String> = DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()).collect();
    forward_names.extend(declared_forward);
    if cache {
        forward_names.extend(CACHE_FORWARD_HEADERS.iter().map(|s| s.to_string()));
    }

    let declared_pass = lookup("x-bare-pass-headers").map(|raw| common::parse_name_csv(&raw)).unwrap_or_default();
    common::reject_forbidden_pass(&declared_pass)?;
    let mut pass_names: Vec<String> = DEFAULT_PASS_HEADERS.iter().map(|s| s.to_string()).collect();
    pass_names.extend(declared_pass);
    if cache {
        pass_names.extend(CACHE_PASS_HEADERS.iter().map(|s| s.to_string()));
    }

    let mut pass_status: Vec<u16> = lookup("x-bare-pass-status")
        .map(|raw| raw.split(',').filter_map(|s| s.trim().parse::<u16>().ok()).collect())
        .unwrap_or_default();
    if cache {
        pass_status.push(304);
    }

    Ok(Envelope { remote, send_headers, forward_names, pass_names, pass_status })
}

/// `ANY D v2/`, optionally with `?cache`. Streams `req.body` straight
/// into the outbound request and back out of the response rather than
/// buffering either (spec.md §4.D/§4.F).
pub async fn handle_http<R: AsyncRead + Unpin>(
    req: &mut Request<crate::request::BodyReader<R>>,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
) -> Result<Response, BareError> {
    let cache = req.has_query_flag("cache");
    let envelope = parse_envelope(|name| req.header(name).map(str::to_string), cache)?;

    let send_headers_out = common::build_send_headers(&envelope.send_headers, &envelope.forward_names, &req.raw_headers);

    let outbound = crate::fetch::http1::OutboundRequest {
        method: method_str(req.method),
        host: &envelope.remote.host,
        port: envelope.remote.port,
        default_port: envelope.remote.protocol.default_port(),
        path: &envelope.remote.path,
        headers: &send_headers_out,
    };

    let no_body = matches!(req.method, Method::Get | Method::Head);
    let resp = if no_body {
        let mut empty = futures_lite::io::empty();
        fetch::bare_fetch(&envelope.remote, ssrf, pool, cancel, outbound, &mut empty, Some(0)).await?
    } else {
        let content_length = req.body.content_length();
        fetch::bare_fetch(&envelope.remote, ssrf, pool, cancel, outbound, &mut req.body, Some(content_length)).await?
    };

    let head = resp.head.clone();
    let (body, body_len) = fetch::response_body_stream(resp).await?;

    let out = common::build_envelope_response(&head, body, body_len, &envelope.pass_names, &envelope.pass_status);
    Ok(out.with_cors(None).split_oversized_headers())
}

/// `ANY D v2/ws-new-meta`: registers the envelope under a fresh id so
/// the subsequent WebSocket upgrade (which carries only the id in
/// `Sec-WebSocket-Protocol`) can recover it.
pub async fn handle_ws_new_meta<R: AsyncRead + Unpin>(req: &mut Request<crate::request::BodyReader<R>>, meta: &MetaStore) -> Result<Response, BareError> {
    let envelope = parse_envelope(|name| req.header(name).map(str::to_string), false)?;
    let remote_record = EnvelopeRemote {
        protocol: envelope.remote.protocol.as_str().to_string(),
        host: envelope.remote.host.clone(),
        port: envelope.remote.port,
        path: envelope.remote.path.clone(),
    };
    let send_headers_out = common::build_send_headers(&envelope.send_headers, &envelope.forward_names, &req.raw_headers);
    let send_headers_json = serde_json::to_value(
        send_headers_out.into_iter().collect::<std::collections::HashMap<_, _>>(),
    )
    .unwrap_or(serde_json::Value::Null);

    let id = meta.new_meta_with_envelope(2, remote_record, send_headers_json, Vec::new()).await;
    Ok(Response::plain_text(200, "OK", &id).with_cors(None))
}

/// `ANY D v2/ws-meta`.
pub async fn handle_ws_meta(id_header: Option<&str>, meta: &MetaStore) -> Result<Response, BareError> {
    let id = id_header.ok_or_else(|| BareError::missing("x-bare-id"))?;
    let recorded = meta.take_response(id, 2).await?;
    let body = serde_json::to_string(&recorded).map_err(|e| BareError::invalid(format!("meta response serialize: {e}")))?;
    Ok(Response::json(200, "OK", &body).with_cors(None))
}

/// `D v2/` WebSocket handshake: `Sec-WebSocket-Protocol` carries the
/// meta id directly (spec.md §6.2 v2); the envelope was registered
/// earlier by `ws-new-meta`.
pub async fn handle_ws<S>(
    inbound: UpgradedStream<S>,
    raw_headers: &[(String, String)],
    ssrf: &SsrfPolicy,
    meta: &MetaStore,
    pool: &Arc<ConnectionPool>,
    cancel: CancelToken,
) -> Result<(), BareError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let header = |name: &str| -> Option<&str> {
        raw_headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    };
    let client_key = header("sec-websocket-key").ok_or_else(|| BareError::missing("sec-websocket-key"))?;
    let id = header("sec-websocket-protocol").ok_or_else(|| BareError::missing("sec-websocket-protocol"))?.trim().to_string();

    let (remote_record, send_headers_json, mut forward_names) = meta.load_envelope(&id, 2).await?;
    forward_names.extend(WS_DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()));

    let protocol = Scheme::parse(&remote_record.protocol)?;
    let remote = Remote::new(protocol, remote_record.host, remote_record.port, remote_record.path)?;

    let send_headers = BareHeaders::from_json(&send_headers_json.to_string())?;
    let send_headers_out = common::build_send_headers(&send_headers, &forward_names, raw_headers);

    let upstream = fetch::websocket_fetch(&remote, ssrf, pool, &cancel, send_headers_out, &remote.path).await?;

    let extensions = upstream
        .head
        .header("sec-websocket-extensions")
        .map(|v| ("Sec-WebSocket-Extensions".to_string(), v.to_string()));
    let extra: Vec<(String, String)> = extensions.into_iter().collect();

    let mut inbound = inbound;
    let handshake_bytes = ws::handshake::build_101_response(client_key, Some(&id), &extra);
    futures_lite::AsyncWriteExt::write_all(&mut inbound, &handshake_bytes)
        .await
        .map_err(BareError::from)?;

    let mut response_headers = std::collections::HashMap::new();
    for (name, value) in &upstream.head.headers {
        response_headers.insert(name.clone(), crate::headers::HeaderValue::Single(value.clone()));
    }
    meta.set_response(
        &id,
        2,
        MetaResponse { headers: response_headers, status: Some(upstream.head.status), status_text: Some(upstream.head.reason.clone()) },
    )
    .await?;

    relay::tunnel(inbound, upstream.stream, cancel).await.map_err(BareError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_flag_adds_304_to_pass_status_and_etag_to_pass_names() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/"),
            ("x-bare-headers", "{}"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let envelope = parse_envelope(lookup, true).unwrap();
        assert!(envelope.pass_status.contains(&304));
        assert!(envelope.pass_names.contains(&"etag".to_string()));
    }

    #[test]
    fn rejects_forbidden_pass_header_name() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/"),
            ("x-bare-headers", "{}"),
            ("x-bare-pass-headers", "vary"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let err = parse_envelope(lookup, false).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN_BARE_HEADER");
    }

    #[test]
    fn parses_pass_status_csv() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/"),
            ("x-bare-headers", "{}"),
            ("x-bare-pass-status", "301, 302"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let envelope = parse_envelope(lookup, false).unwrap();
        assert_eq!(envelope.pass_status, vec![301, 302]);
    }
}
