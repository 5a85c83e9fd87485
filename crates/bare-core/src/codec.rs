//! Percent-safe codec for `Sec-WebSocket-Protocol` payloads, and
//! case-preserving raw-header utilities (spec.md §4.A).

/// Characters that may appear unescaped in an encoded protocol string.
/// This is the HTTP `tchar` set minus `%`, which spec.md §4.A carves out
/// as a reserve character even though it is nominally a `tchar`.
fn is_unreserved(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}

/// Encode `s` so the only bytes present are from the validProtocolChars
/// set; everything else (including the reserve character `%`) becomes a
/// lowercase `%HH` escape.
pub fn encode_protocol(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

/// Decode a string produced by [`encode_protocol`]. Malformed or
/// truncated `%HH` escapes stop decoding and return what has been
/// produced so far (spec.md §9 (iii)) rather than failing.
pub fn decode_protocol(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            if i + 2 >= bytes.len() {
                break;
            }
            let hi = hex_val(bytes[i + 1]);
            let lo = hex_val(bytes[i + 2]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push((hi << 4) | lo);
                    i += 3;
                }
                _ => break,
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// An inbound exchange's header list, preserving original case and
/// duplicate entries in arrival order.
pub type RawHeaders = Vec<(String, String)>;

/// Returns the ordered set of distinct header names from `seq`, first
/// occurrence wins, original capitalization preserved.
pub fn raw_header_names(seq: &[(String, String)]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for (name, _) in seq {
        let lower = name.to_ascii_lowercase();
        if seen.insert(lower) {
            names.push(name.clone());
        }
    }
    names
}

/// Rebuilds a map whose keys are the original-case names from `raw_names`
/// with values taken from `lowercase_map`, keyed by lowercased name. This
/// is how a remote's header capitalization survives a round trip through
/// `x-bare-headers`.
pub fn map_headers_from_array(
    raw_names: &[String],
    lowercase_map: &std::collections::HashMap<String, String>,
) -> Vec<(String, String)> {
    raw_names
        .iter()
        .filter_map(|name| {
            lowercase_map
                .get(&name.to_ascii_lowercase())
                .map(|value| (name.clone(), value.clone()))
        })
        .collect()
}

/// RFC 7230 header value combining: arrays join with `", "`.
pub fn flatten_header(value: &crate::headers::HeaderValue) -> String {
    match value {
        crate::headers::HeaderValue::Single(s) => s.clone(),
        crate::headers::HeaderValue::Multi(items) => items.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_unreserved_chars() {
        let s = "!#$%&'*+-.0-9A-Za-z^_`|~";
        assert_eq!(decode_protocol(&encode_protocol(s)), s);
    }

    #[test]
    fn round_trips_arbitrary_strings() {
        for s in ["bare", "{\"a\":1}", "héllo", "a b", ""] {
            assert_eq!(decode_protocol(&encode_protocol(s)), s);
        }
    }

    #[test]
    fn encodes_percent_itself() {
        assert_eq!(encode_protocol("%"), "%25");
    }

    #[test]
    fn decode_truncated_escape_stops_without_panicking() {
        assert_eq!(decode_protocol("abc%"), "abc");
        assert_eq!(decode_protocol("abc%2"), "abc");
        assert_eq!(decode_protocol("abc%zz"), "abc");
    }

    #[test]
    fn raw_header_names_preserves_first_occurrence_case() {
        let seq = vec![
            ("X-Foo".to_string(), "1".to_string()),
            ("x-foo".to_string(), "2".to_string()),
            ("X-Bar".to_string(), "3".to_string()),
        ];
        assert_eq!(raw_header_names(&seq), vec!["X-Foo".to_string(), "X-Bar".to_string()]);
    }

    #[test]
    fn map_headers_from_array_preserves_case_and_values() {
        let raw_names = vec!["X-Foo".to_string(), "X-Bar".to_string()];
        let mut lower = std::collections::HashMap::new();
        lower.insert("x-foo".to_string(), "1".to_string());
        lower.insert("x-bar".to_string(), "2".to_string());
        let out = map_headers_from_array(&raw_names, &lower);
        assert_eq!(out, vec![
            ("X-Foo".to_string(), "1".to_string()),
            ("X-Bar".to_string(), "2".to_string()),
        ]);
    }
}
