//! Shared envelope parsing steps across v1/v2/v3 (spec.md §4.F).

use std::collections::HashMap;

use futures_lite::AsyncRead;

use crate::error::BareError;
use crate::fetch::http1::ResponseHead;
use crate::headers::BareHeaders;
use crate::remote::Remote;
use crate::response::Response;

pub const FORBIDDEN_SEND_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

pub const FORBIDDEN_FORWARD_HEADERS: &[&str] =
    &["connection", "transfer-encoding", "host", "origin", "referer"];

pub const FORBIDDEN_PASS_HEADERS: &[&str] = &[
    "vary",
    "connection",
    "transfer-encoding",
    "access-control-allow-origin",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-expose-headers",
];

pub const DEFAULT_FORWARD_HEADERS: &[&str] = &["accept-encoding", "accept-language"];

/// v1/v2 additionally forward the WebSocket handshake headers by
/// default so a plain HTTP request that happens to be an upgrade
/// still carries them through.
pub const WS_DEFAULT_FORWARD_HEADERS: &[&str] =
    &["sec-websocket-extensions", "sec-websocket-key", "sec-websocket-version"];

pub const DEFAULT_PASS_HEADERS: &[&str] = &["content-encoding", "content-length", "last-modified"];

pub const CACHE_FORWARD_HEADERS: &[&str] = &["if-modified-since", "if-none-match", "cache-control"];
pub const CACHE_PASS_HEADERS: &[&str] = &["cache-control", "etag"];

fn is_forbidden(name: &str, list: &[&str]) -> bool {
    list.iter().any(|f| f.eq_ignore_ascii_case(name))
}

pub fn reject_forbidden_forward(names: &[String]) -> Result<(), BareError> {
    for name in names {
        if is_forbidden(name, FORBIDDEN_FORWARD_HEADERS) {
            return Err(BareError::forbidden(name.clone()));
        }
    }
    Ok(())
}

pub fn reject_forbidden_pass(names: &[String]) -> Result<(), BareError> {
    for name in names {
        if is_forbidden(name, FORBIDDEN_PASS_HEADERS) {
            return Err(BareError::forbidden(name.clone()));
        }
    }
    Ok(())
}

/// Builds the final outbound header list: `sendHeaders` (minus
/// forbidden-send names) plus case-preserved values forwarded from the
/// inbound request for every name in `forward_names` (spec.md §4.F
/// (iii)-(iv)).
pub fn build_send_headers(
    send_headers: &BareHeaders,
    forward_names: &[String],
    inbound_raw: &[(String, String)],
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in send_headers.iter() {
        if is_forbidden(name, FORBIDDEN_SEND_HEADERS) {
            continue;
        }
        out.push((name.clone(), crate::codec::flatten_header(value)));
    }
    for name in forward_names {
        for (inbound_name, inbound_value) in inbound_raw {
            if inbound_name.eq_ignore_ascii_case(name) {
                out.push((inbound_name.clone(), inbound_value.clone()));
            }
        }
    }
    out
}

/// Parses `x-bare-host`/`x-bare-port`/`x-bare-protocol`/`x-bare-path`
/// into a [`Remote`] (v1/v2 remote shape, spec.md §3).
pub fn parse_split_remote(
    host: Option<&str>,
    port: Option<&str>,
    protocol: Option<&str>,
    path: Option<&str>,
) -> Result<Remote, BareError> {
    let host = host.ok_or_else(|| BareError::missing("x-bare-host"))?.to_string();
    let port = crate::remote::parse_port(port.ok_or_else(|| BareError::missing("x-bare-port"))?)?;
    let protocol = crate::remote::Scheme::parse(protocol.ok_or_else(|| BareError::missing("x-bare-protocol"))?)?;
    let path = path.ok_or_else(|| BareError::missing("x-bare-path"))?.to_string();
    Remote::new(protocol, host, port, path)
}

/// Parses a JSON array of header names (`x-bare-forward-headers` in
/// v1, and the forward-headers field of v3's connect envelope).
pub fn parse_name_array(raw: &str) -> Result<Vec<String>, BareError> {
    serde_json::from_str(raw).map_err(|e| BareError::invalid(format!("malformed header-name array: {e}")))
}

/// Parses a comma-separated list of header names (v2's
/// `x-bare-forward-headers`/`x-bare-pass-headers`).
pub fn parse_name_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn lowercase_join_map(raw: &[(String, String)]) -> HashMap<String, String> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in raw {
        grouped.entry(name.to_ascii_lowercase()).or_default().push(value.clone());
    }
    grouped.into_iter().map(|(k, values)| (k, values.join(", "))).collect()
}

/// Builds the `x-bare-headers` JSON payload from the upstream's raw
/// header sequence, preserving capitalization via
/// `rawHeaderNames`/`mapHeadersFromArray` (spec.md §4.A).
fn bare_headers_json(raw: &[(String, String)]) -> String {
    let names = crate::codec::raw_header_names(raw);
    let lowercase_map = lowercase_join_map(raw);
    let pairs = crate::codec::map_headers_from_array(&names, &lowercase_map);
    let map: serde_json::Map<String, serde_json::Value> =
        pairs.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect();
    serde_json::Value::Object(map).to_string()
}

/// Assembles the envelope HTTP response from the upstream's response
/// head and a live body reader (spec.md §4.F "HTTP request handler"),
/// piping the remote body through rather than buffering it first.
pub fn build_envelope_response(
    upstream: &ResponseHead,
    body: Box<dyn AsyncRead + Unpin + Send>,
    body_len: Option<u64>,
    pass_headers: &[String],
    pass_status: &[u16],
) -> Response {
    let cache_not_modified = upstream.status == 304;
    let status = if pass_status.contains(&upstream.status) { upstream.status } else { 200 };
    let reason = if status == upstream.status { upstream.reason.clone() } else { "OK".to_string() };

    let mut resp = Response::new().with_status(status, reason.clone());

    for name in pass_headers {
        if let Some(value) = upstream.header(name) {
            resp = resp.with_header(name.clone(), value.to_string());
        }
    }

    if !cache_not_modified {
        resp = resp
            .with_header("x-bare-status", upstream.status.to_string())
            .with_header("x-bare-status-text", upstream.reason.clone())
            .with_header("x-bare-headers", bare_headers_json(&upstream.headers));
    }

    if upstream.is_no_body_status() {
        resp.without_body()
    } else {
        resp.with_streamed_body(body, body_len)
    }
}
