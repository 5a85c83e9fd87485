//! v3 envelope: single `x-bare-url` remote for plain tunnel requests
//! (spec.md §6.1), and a WebSocket-only upgrade flow where the connect
//! request travels as the first client text frame rather than through
//! `Sec-WebSocket-Protocol` or the meta store (spec.md §4.F, §6.2 v3).

use std::sync::Arc;
use std::time::Duration;

use futures_lite::{AsyncRead, AsyncWrite};
use serde::Deserialize;
use url::Url;

use crate::error::BareError;
use crate::fetch::{self, ConnectionPool, ssrf::SsrfPolicy};
use crate::headers::BareHeaders;
use crate::relay;
use crate::remote::Remote;
use crate::request::{Method, Request, UpgradedStream};
use crate::response::Response;
use crate::shutdown::CancelToken;
use crate::ws;

use super::common::{self, CACHE_FORWARD_HEADERS, CACHE_PASS_HEADERS, DEFAULT_FORWARD_HEADERS, DEFAULT_PASS_HEADERS, WS_DEFAULT_FORWARD_HEADERS};

/// Client-to-server WS meta handshake timeout (spec.md §5).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

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
    let raw_url = lookup("x-bare-url").ok_or_else(|| BareError::missing("x-bare-url"))?;
    let url = Url::parse(&raw_url).map_err(|e| BareError::invalid(format!("x-bare-url is not a valid URL: {e}")))?;
    let remote = Remote::from_url(&url)?;

    let send_headers = match lookup("x-bare-headers") {
        Some(raw) => BareHeaders::from_json(&raw)?,
        None => return Err(BareError::missing("x-bare-headers")),
    };

    let declared_forward = match lookup("x-bare-forward-headers") {
        Some(raw) => common::parse_name_array(&raw)?,
        None => Vec::new(),
    };
    common::reject_forbidden_forward(&declared_forward)?;
    let mut forward_names: Vec<String> = DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()).collect();
    forward_names.extend(declared_forward);
    if cache {
        forward_names.extend(CACHE_FORWARD_HEADERS.iter().map(|s| s.to_string()));
    }

    let declared_pass = match lookup("x-bare-pass-headers") {
        Some(raw) => common::parse_name_array(&raw)?,
        None => Vec::new(),
    };
    common::reject_forbidden_pass(&declared_pass)?;
    let mut pass_names: Vec<String> = DEFAULT_PASS_HEADERS.iter().map(|s| s.to_string()).collect();
    pass_names.extend(declared_pass);
    if cache {
        pass_names.extend(CACHE_PASS_HEADERS.iter().map(|s| s.to_string()));
    }

    let mut pass_status: Vec<u16> = match lookup("x-bare-pass-status") {
        Some(raw) => serde_json::from_str::<Vec<u16>>(&raw)
            .map_err(|e| BareError::invalid(format!("x-bare-pass-status must be a JSON array of integers: {e}")))?,
        None => Vec::new(),
    };
    if cache {
        pass_status.push(304);
    }

    Ok(Envelope { remote, send_headers, forward_names, pass_names, pass_status })
}

/// `ANY D v3/`, optionally with `?cache`. Streams `req.body` straight
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

#[derive(Deserialize)]
struct ConnectFrame {
    #[serde(rename = "type")]
    kind: String,
    remote: String,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "forwardHeaders")]
    forward_headers: Vec<String>,
}

/// `D v3/` WebSocket handshake: the connection is upgraded before any
/// connect information is known, so the 101 is written immediately and
/// the connect request arrives as the first client text frame
/// (spec.md §4.F "WebSocket handler (v3)").
pub async fn handle_ws<S>(
    inbound: UpgradedStream<S>,
    raw_headers: &[(String, String)],
    ssrf: &SsrfPolicy,
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

    let mut inbound = inbound;
    let handshake_bytes = ws::handshake::build_101_response(client_key, None, &[]);
    futures_lite::AsyncWriteExt::write_all(&mut inbound, &handshake_bytes)
        .await
        .map_err(BareError::from)?;

    let timeout = smol::Timer::after(CONNECT_TIMEOUT);
    let frame = futures_lite::future::or(
        async { ws::frame::read_masked_frame(&mut inbound).await.map(Some) },
        async {
            timeout.await;
            Ok(None)
        },
    )
    .await?;

    let Some(frame) = frame else {
        return Err(BareError::ConnectionTimeout { detail: "v3 connect frame not received within 10s".into() });
    };
    if frame.opcode != ws::frame::OpCode::Text {
        return Err(BareError::invalid("v3 first frame must be a text message"));
    }

    let connect: ConnectFrame = serde_json::from_slice(&frame.payload)
        .map_err(|e| BareError::invalid(format!("malformed v3 connect frame: {e}")))?;
    if connect.kind != "connect" {
        return Err(BareError::invalid("v3 first frame must have type \"connect\""));
    }

    let url = Url::parse(&connect.remote).map_err(|e| BareError::invalid(format!("v3 connect.remote is not a valid URL: {e}")))?;
    let remote = Remote::from_url(&url)?;

    common::reject_forbidden_forward(&connect.forward_headers)?;
    let mut forward_names: Vec<String> = DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()).collect();
    forward_names.extend(WS_DEFAULT_FORWARD_HEADERS.iter().map(|s| s.to_string()));
    forward_names.extend(connect.forward_headers);

    let headers_json = serde_json::Value::Object(connect.headers).to_string();
    let send_headers = BareHeaders::from_json(&headers_json)?;
    let mut send_headers_out = common::build_send_headers(&send_headers, &forward_names, raw_headers);
    if !connect.protocols.is_empty() {
        send_headers_out.push(("Sec-WebSocket-Protocol".to_string(), connect.protocols.join(", ")));
    }

    let upstream = fetch::websocket_fetch(&remote, ssrf, pool, &cancel, send_headers_out, &remote.path).await?;

    let protocol = upstream.head.header("sec-websocket-protocol").map(str::to_string);
    let set_cookies: Vec<String> = upstream
        .head
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
        .map(|(_, value)| value.clone())
        .collect();

    let open = serde_json::json!({ "type": "open", "protocol": protocol, "setCookies": set_cookies }).to_string();
    ws::frame::write_text(&mut inbound, &open).await?;

    relay::tunnel(inbound, upstream.stream, cancel).await.map_err(BareError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_envelope() {
        let headers = [
            ("x-bare-url", "https://example.com/a/b"),
            ("x-bare-headers", "{\"User-Agent\":\"t\"}"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let envelope = parse_envelope(lookup, false).unwrap();
        assert_eq!(envelope.remote.host, "example.com");
        assert_eq!(envelope.remote.path, "/a/b");
    }

    #[test]
    fn rejects_forbidden_forward_header_name() {
        let headers = [
            ("x-bare-url", "https://example.com/"),
            ("x-bare-headers", "{}"),
            ("x-bare-forward-headers", "[\"host\"]"),
        ];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let err = parse_envelope(lookup, false).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN_BARE_HEADER");
    }

    #[test]
    fn decodes_connect_frame_json() {
        let json = r#"{"type":"connect","remote":"wss://echo.example/","protocols":["x"],"headers":{},"forwardHeaders":[]}"#;
        let frame: ConnectFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.kind, "connect");
        assert_eq!(frame.protocols, vec!["x".to_string()]);
    }

    #[test]
    fn missing_url_is_a_missing_header_error() {
        let headers = [("x-bare-headers", "{}")];
        let lookup = |name: &str| headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string());
        let err = parse_envelope(lookup, false).unwrap_err();
        assert_eq!(err.code(), "MISSING_BARE_HEADER");
    }
}
