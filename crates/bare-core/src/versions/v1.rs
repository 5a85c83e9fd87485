//! v1 envelope: remote split across `x-bare-{host,port,protocol,path}`,
//! `x-bare-forward-headers` required and historically unenforced against
//! the forbidden-forward list (spec.md §9 (i); kept permissive here, see
//! DESIGN.md), WebSocket handshake carried in
//! `Sec-WebSocket-Protocol: bare, <percent-encoded JSON>` (spec.md §6.2).

use std::sync::Arc;

use futures_lite::{AsyncRead, AsyncWrite};
use serde::Deserialize;

use crate::codec;
use crate::error::BareError;
use crate::fetch::{self, ConnectionPool, ssrf::SsrfPolicy};
use crate::headers::BareHeaders;
use crate::meta::{MetaResponse, MetaStore};
use crate::relay;
use crate::remote::{Remote, Scheme};
use crate::request::{Method, Request, UpgradedStream};
use crate::response::Response;
use crate::shutdown::CancelToken;
use crate::ws;

use super::common::{self, DEFAULT_FORWARD_HEADERS, DEFAULT_PASS_HEADERS, WS_DEFAULT_FORWARD_HEADERS};

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

fn parse_envelope(raw_headers_lookup: impl Fn(&str) -> Option<String>, strict_forward: bool) -> Result<(Remote, BareHeaders, Vec<String>), BareError> {
    let host = raw_headers_lookup("x-bare-host");
    let port = raw_headers_lookup("x-bare-port");
    let protocol = raw_headers_lookup("x-bare-protocol");
    let path = raw_headers_lookup("x-bare-path");
    let remote = common::parse_split_remote(host.as_deref(), port.as_deref(), protocol.as_deref(), path.as_deref())?;

    let send_headers = match raw_headers_lookup("x-bare-headers") {
        Some(raw) => BareHeaders::from_json(&raw)?,
        None => return Err(BareError::missing("x-bare-headers")),
    };

    let forward_raw = raw_headers_lookup("x-bare-forward-headers").ok_or_else(|| BareError::missing("x-bare-forward-headers"))?;
    let declared = common::parse_name_array(&forward_raw)?;
    // Historically v1 implementations never rejected forbidden forward
    // names here; `strict_forward` lets a deployment opt into v2/v3's
    // enforcement instead (spec.md §9 (i), see DESIGN.md).
    if strict_forward {
        common::reject_forbidden_forward(&declared)?;
    }

    Ok((remote, send_headers, declared))
}

/// `ANY D v1/` for a plain (non-upgrade) exchange. Streams `req.body`
/// straight into the outbound request and back out of the response
/// rather than buffering either (spec.md §4.D/§4.F).
pub async fn handle_http<R: AsyncRead + Unpin>(
    req: &mut Request<crate::request::BodyReader<R>>,
    ssrf: &SsrfPolicy,
    pool: &Arc<ConnectionPool>,
    cancel: &CancelToken,
    strict_forward: bool,
) -> Result<Response, BareError> {
    let (remote, send_headers, declared) = parse_envelope(|name| req.header(name).map(str::to_string), strict_forward)?;

    let mut forward_names: Vec<String> = DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()).collect();
    forward_names.extend(declared);

    let send_headers_out = common::build_send_headers(&send_headers, &forward_names, &req.raw_headers);

    let outbound = crate::fetch::http1::OutboundRequest {
        method: method_str(req.method),
        host: &remote.host,
        port: remote.port,
        default_port: remote.protocol.default_port(),
        path: &remote.path,
        headers: &send_headers_out,
    };

    let no_body = matches!(req.method, Method::Get | Method::Head);
    let resp = if no_body {
        let mut empty = futures_lite::io::empty();
        fetch::bare_fetch(&remote, ssrf, pool, cancel, outbound, &mut empty, Some(0)).await?
    } else {
        let content_length = req.body.content_length();
        fetch::bare_fetch(&remote, ssrf, pool, cancel, outbound, &mut req.body, Some(content_length)).await?
    };

    let head = resp.head.clone();
    let (body, body_len) = fetch::response_body_stream(resp).await?;

    let pass_headers: Vec<String> = DEFAULT_PASS_HEADERS.iter().map(|s| s.to_string()).collect();
    let envelope = common::build_envelope_response(&head, body, body_len, &pass_headers, &[]);
    Ok(envelope.with_cors(None).split_oversized_headers())
}

/// `ANY D v1/ws-new-meta`.
pub async fn handle_ws_new_meta(meta: &MetaStore) -> Response {
    let id = meta.new_meta(1).await;
    Response::plain_text(200, "OK", &id).with_cors(None)
}

/// `ANY D v1/ws-meta`.
pub async fn handle_ws_meta(id_header: Option<&str>, meta: &MetaStore) -> Result<Response, BareError> {
    let id = id_header.ok_or_else(|| BareError::missing("x-bare-id"))?;
    let recorded = meta.take_response(id, 1).await?;
    let body = serde_json::json!({ "headers": recorded.headers }).to_string();
    Ok(Response::json(200, "OK", &body).with_cors(None))
}

#[derive(Deserialize)]
struct ConnectRemote {
    host: String,
    port: serde_json::Value,
    protocol: String,
    path: String,
}

#[derive(Deserialize)]
struct ConnectMessage {
    remote: ConnectRemote,
    headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "forward_headers")]
    forward_headers: Vec<String>,
    id: String,
}

fn port_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `D v1/` WebSocket handshake: decodes `Sec-WebSocket-Protocol: bare,
/// <encoded>`, dials the remote, writes the 101 handshake, records the
/// remote's response into the meta store, then relays bytes until one
/// side closes (spec.md §4.F WebSocket handler (v1/v2)).
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
    let protocol_header = header("sec-websocket-protocol").ok_or_else(|| BareError::missing("sec-websocket-protocol"))?;

    let (tag, encoded) = protocol_header
        .split_once(',')
        .ok_or_else(|| BareError::invalid("sec-websocket-protocol must be 'bare, <payload>'"))?;
    if tag.trim() != "bare" {
        return Err(BareError::invalid("sec-websocket-protocol tag must be 'bare'"));
    }
    let decoded = codec::decode_protocol(encoded.trim());
    let envelope: ConnectMessage = serde_json::from_str(&decoded)
        .map_err(|e| BareError::invalid(format!("malformed v1 connect payload: {e}")))?;

    let port = crate::remote::parse_port(&port_to_string(&envelope.remote.port))?;
    let protocol = Scheme::parse(&envelope.remote.protocol)?;
    let remote = Remote::new(protocol, envelope.remote.host, port, envelope.remote.path)?;

    let headers_json = serde_json::Value::Object(envelope.headers).to_string();
    let send_headers = BareHeaders::from_json(&headers_json)?;

    let mut forward_names: Vec<String> = DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()).collect();
    forward_names.extend(WS_DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()));
    forward_names.extend(envelope.forward_headers);

    let send_headers_out = common::build_send_headers(&send_headers, &forward_names, raw_headers);

    let upstream = fetch::websocket_fetch(&remote, ssrf, pool, &cancel, send_headers_out, &remote.path).await?;

    let extensions = upstream
        .head
        .header("sec-websocket-extensions")
        .map(|v| ("Sec-WebSocket-Extensions".to_string(), v.to_string()));
    let extra: Vec<(String, String)> = extensions.into_iter().collect();

    let mut inbound = inbound;
    let handshake_bytes = ws::handshake::build_101_response(client_key, Some("bare"), &extra);
    futures_lite::AsyncWriteExt::write_all(&mut inbound, &handshake_bytes)
        .await
        .map_err(BareError::from)?;

    let mut response_headers = std::collections::HashMap::new();
    for (name, value) in &upstream.head.headers {
        response_headers.insert(name.clone(), crate::headers::HeaderValue::Single(value.clone()));
    }
    meta.set_response(
        &envelope.id,
        1,
        MetaResponse { headers: response_headers, status: Some(upstream.head.status), status_text: Some(upstream.head.reason.clone()) },
    )
    .await?;

    relay::tunnel(inbound, upstream.stream, cancel).await.map_err(BareError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_split_envelope_headers() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/a"),
            ("x-bare-headers", "{\"User-Agent\":\"t\"}"),
            ("x-bare-forward-headers", "[]"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let (remote, send_headers, forward) = parse_envelope(lookup, false).unwrap();
        assert_eq!(remote.host, "example.com");
        assert_eq!(remote.port, 443);
        assert!(forward.is_empty());
        assert!(!send_headers.is_empty());
    }

    #[test]
    fn missing_forward_headers_is_a_missing_header_error() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/a"),
            ("x-bare-headers", "{}"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let err = parse_envelope(lookup, false).unwrap_err();
        assert_eq!(err.code(), "MISSING_BARE_HEADER");
    }

    #[test]
    fn strict_forward_rejects_forbidden_name() {
        let headers = [
            ("x-bare-host", "example.com"),
            ("x-bare-port", "443"),
            ("x-bare-protocol", "https:"),
            ("x-bare-path", "/a"),
            ("x-bare-headers", "{}"),
            ("x-bare-forward-headers", "[\"host\"]"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        assert!(parse_envelope(lookup, false).is_ok());
        let err = parse_envelope(lookup, true).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN_BARE_HEADER");
    }

    #[test]
    fn decodes_connect_message_json() {
        let json = r#"{"remote":{"host":"echo.example","port":443,"protocol":"wss:","path":"/"},
                       "headers":{},"forward_headers":[],"id":"0123456789abcdef0123456789abcdef"}"#;
        let msg: ConnectMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.remote.host, "echo.example");
        assert_eq!(port_to_string(&msg.remote.port), "443");
    }
}
