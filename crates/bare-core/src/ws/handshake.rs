//! `Sec-WebSocket-Accept` computation (RFC 6455 §1.3). Same GUID
//! constant and sha1-then-base64 recipe as
//! `paritytech-soketto::handshake::server`, updated to the `sha1`/
//! `base64` crate APIs pinned by this workspace (soketto's vendored
//! copy predates the `Digest`-trait `update`/`finalize` and the
//! engine-based `base64` API).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Builds the raw `101 Switching Protocols` response bytes written
/// directly to the inbound socket (spec.md §4.F "write back a 101
/// handshake"). Bypasses `response::Response::to_bytes` since a 101
/// carries neither `Content-Length` nor `Connection: close`.
pub fn build_101_response(client_key: &str, subprotocol: Option<&str>, extra_headers: &[(String, String)]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    out.push_str("Upgrade: websocket\r\n");
    out.push_str("Connection: Upgrade\r\n");
    out.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(client_key)));
    if let Some(proto) = subprotocol {
        out.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    for (name, value) in extra_headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc6455_worked_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn builds_101_with_subprotocol_and_extra_headers() {
        let bytes = build_101_response(
            "dGhlIHNhbXBsZSBub25jZQ==",
            Some("bare"),
            &[("Sec-WebSocket-Extensions".to_string(), "permessage-deflate".to_string())],
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: bare\r\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
