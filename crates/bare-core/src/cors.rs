//! Fixed CORS header set appended to every response (spec.md §4.G):
//! `access-control-allow-{origin,headers,methods,expose-headers}: *`,
//! `access-control-max-age: 7200`, `x-robots-tag: noindex`.
//!
//! `origin` is accepted but unused for now — the policy is a fixed
//! wildcard, not an echoed allow-list; the parameter exists so a future
//! per-origin policy (spec.md Open Question, resolved in favor of the
//! wildcard for this implementation, see DESIGN.md) only touches this
//! module.

use crate::response::Header;

pub fn response_headers(_origin: Option<&str>) -> Vec<Header> {
    vec![
        Header::new("Access-Control-Allow-Origin", "*"),
        Header::new("Access-Control-Allow-Headers", "*"),
        Header::new("Access-Control-Allow-Methods", "*"),
        Header::new("Access-Control-Expose-Headers", "*"),
        Header::new("Access-Control-Max-Age", "7200"),
        Header::new("X-Robots-Tag", "noindex"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_fixed_set() {
        let headers = response_headers(None);
        assert!(headers.iter().any(|h| h.key == "Access-Control-Allow-Origin" && h.value == "*"));
        assert!(headers.iter().any(|h| h.key == "Access-Control-Max-Age" && h.value == "7200"));
        assert!(headers.iter().any(|h| h.key == "X-Robots-Tag" && h.value == "noindex"));
    }
}
