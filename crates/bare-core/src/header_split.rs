//! Chunks an oversized `x-bare-headers` value into `x-bare-headers-N`
//! fragments and recombines them (spec.md §4.B).
//!
//! HTTP servers commonly cap a single header value around 8 KiB; the
//! serialized `x-bare-headers` JSON can exceed that. Each fragment is
//! prefixed with a literal `;` to defeat middleboxes that trim
//! zero-length header values.

use crate::error::BareError;

const MAX_FRAGMENT: usize = 3072;
const HEADER_NAME: &str = "x-bare-headers";

/// If `x-bare-headers` is present and exceeds [`MAX_FRAGMENT`], removes it
/// and inserts `x-bare-headers-0`, `x-bare-headers-1`, … in its place.
pub fn split_headers(headers: &mut Vec<(String, String)>) {
    let Some(idx) = headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(HEADER_NAME)) else {
        return;
    };
    let (_, value) = headers.remove(idx);
    if value.len() <= MAX_FRAGMENT {
        headers.insert(idx, (HEADER_NAME.to_string(), value));
        return;
    }

    let chars: Vec<char> = value.chars().collect();
    let mut insert_at = idx;
    for (n, chunk) in chars.chunks(MAX_FRAGMENT).enumerate() {
        let fragment: String = chunk.iter().collect();
        headers.insert(insert_at, (format!("{HEADER_NAME}-{n}"), format!(";{fragment}")));
        insert_at += 1;
    }
}

/// Reassembles `x-bare-headers-0`, `x-bare-headers-1`, … (in ascending
/// numeric order) into a single `x-bare-headers` entry.
pub fn join_headers(headers: &mut Vec<(String, String)>) -> Result<(), BareError> {
    let mut fragments: Vec<(usize, String)> = Vec::new();
    let mut remove_at = Vec::new();
    for (i, (k, v)) in headers.iter().enumerate() {
        if let Some(n) = fragment_index(k) {
            fragments.push((n, v.clone()));
            remove_at.push(i);
        }
    }
    if fragments.is_empty() {
        return Ok(());
    }
    fragments.sort_by_key(|(n, _)| *n);

    let mut joined = String::new();
    for (_, fragment) in &fragments {
        let rest = fragment
            .strip_prefix(';')
            .ok_or_else(|| BareError::invalid("x-bare-headers fragment missing leading ';'"))?;
        joined.push_str(rest);
    }

    for i in remove_at.into_iter().rev() {
        headers.remove(i);
    }
    headers.push((HEADER_NAME.to_string(), joined));
    Ok(())
}

fn fragment_index(name: &str) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    let suffix = lower.strip_prefix(&format!("{HEADER_NAME}-"))?;
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_large_value() {
        let big = "x".repeat(10_000);
        let mut headers = vec![("x-bare-headers".to_string(), big.clone())];
        split_headers(&mut headers);
        assert!(headers.iter().any(|(k, _)| k == "x-bare-headers-0"));
        assert!(headers.iter().all(|(k, v)| !k.eq_ignore_ascii_case("x-bare-headers-0") || v.starts_with(';')));

        join_headers(&mut headers).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0], ("x-bare-headers".to_string(), big));
    }

    #[test]
    fn leaves_small_value_untouched() {
        let mut headers = vec![("x-bare-headers".to_string(), "{}".to_string())];
        split_headers(&mut headers);
        assert_eq!(headers, vec![("x-bare-headers".to_string(), "{}".to_string())]);
    }

    #[test]
    fn join_rejects_fragment_without_semicolon() {
        let mut headers = vec![("x-bare-headers-0".to_string(), "nosemicolon".to_string())];
        assert!(join_headers(&mut headers).is_err());
    }

    #[test]
    fn join_orders_fragments_numerically_not_lexically() {
        let mut headers = vec![
            ("x-bare-headers-10".to_string(), ";b".to_string()),
            ("x-bare-headers-2".to_string(), ";a".to_string()),
        ];
        join_headers(&mut headers).unwrap();
        assert_eq!(headers[0].1, "ab");
    }
}
