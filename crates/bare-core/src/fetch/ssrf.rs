//! SSRF policy hooks (spec.md §6.4): `filterRemote`, `lookup`,
//! `blockLocal`. IP classification follows the same plain
//! `std::net::IpAddr` style as the teacher's DNS layer
//! (`httpclient::dns::host::Host` wraps a bare `IpAddr`) rather than
//! pulling in a CIDR/IP-range crate not present anywhere in the pack.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::BareError;

/// True for loopback, private, link-local, unspecified and other
/// non-globally-routable addresses. Conservative: unknown IPv6
/// categories (documentation, benchmarking ranges) are also blocked.
pub fn is_non_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_unicast_v4(v4),
        IpAddr::V6(v6) => is_non_unicast_v6(v6),
    }
}

fn is_non_unicast_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
}

fn is_non_unicast_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_non_unicast_v4(&v4);
    }
    // fc00::/7 unique local
    let segments = ip.segments();
    (segments[0] & 0xfe00) == 0xfc00
}

/// Hook invoked before dialing a remote whose host is a literal IP.
/// Default rejects any non-unicast address; callers may override with
/// a custom closure via [`SsrfPolicy::with_filter_remote`].
pub type FilterRemoteFn = dyn Fn(&IpAddr) -> Result<(), BareError> + Send + Sync;

/// Hook invoked after DNS resolution to approve/reject the resolved
/// address.
pub type LookupFilterFn = dyn Fn(&str, &IpAddr) -> Result<(), BareError> + Send + Sync;

pub struct SsrfPolicy {
    block_local: bool,
    filter_remote: Option<Box<FilterRemoteFn>>,
    lookup_filter: Option<Box<LookupFilterFn>>,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        Self { block_local: true, filter_remote: None, lookup_filter: None }
    }
}

impl SsrfPolicy {
    pub fn new(block_local: bool) -> Self {
        Self { block_local, ..Self::default() }
    }

    pub fn with_filter_remote(mut self, f: Box<FilterRemoteFn>) -> Self {
        self.filter_remote = Some(f);
        self
    }

    pub fn with_lookup_filter(mut self, f: Box<LookupFilterFn>) -> Self {
        self.lookup_filter = Some(f);
        self
    }

    /// Called before dialing a host that was supplied as a literal IP.
    pub fn filter_remote(&self, ip: &IpAddr) -> Result<(), BareError> {
        if let Some(f) = &self.filter_remote {
            return f(ip);
        }
        if self.block_local && is_non_unicast(ip) {
            // Real bare servers' default `filterRemote` throws a plain
            // `Error("Forbidden IP")`, which the funnel folds into
            // `UNKNOWN` rather than a dedicated DNS-failure code.
            return Err(BareError::Unknown { message: "Forbidden IP".to_string(), stack: None });
        }
        Ok(())
    }

    /// Called once per resolved address after DNS lookup.
    pub fn check_resolved(&self, hostname: &str, ip: &IpAddr) -> Result<(), BareError> {
        if let Some(f) = &self.lookup_filter {
            return f(hostname, ip);
        }
        if self.block_local && is_non_unicast(ip) {
            return Err(BareError::Unknown { message: "Forbidden IP".to_string(), stack: None });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_non_unicast_v4() {
        assert!(is_non_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(is_non_unicast(&"10.0.0.1".parse().unwrap()));
        assert!(is_non_unicast(&"169.254.1.1".parse().unwrap()));
        assert!(!is_non_unicast(&"93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn classifies_v6_unique_local_and_loopback() {
        assert!(is_non_unicast(&"::1".parse().unwrap()));
        assert!(is_non_unicast(&"fc00::1".parse().unwrap()));
        assert!(!is_non_unicast(&"2606:4700:4700::1111".parse().unwrap()));
    }

    #[test]
    fn default_policy_blocks_loopback() {
        let policy = SsrfPolicy::default();
        assert!(policy.filter_remote(&"127.0.0.1".parse().unwrap()).is_err());
        assert!(policy.filter_remote(&"93.184.216.34".parse().unwrap()).is_ok());
    }

    #[test]
    fn default_rejection_codes_as_unknown() {
        let policy = SsrfPolicy::default();
        let err = policy.filter_remote(&"127.0.0.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN");
        let err = policy.check_resolved("internal.example", &"10.0.0.1".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN");
    }

    #[test]
    fn block_local_false_allows_everything() {
        let policy = SsrfPolicy::new(false);
        assert!(policy.filter_remote(&"127.0.0.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn custom_filter_overrides_default() {
        let policy = SsrfPolicy::default().with_filter_remote(Box::new(|_ip| Ok(())));
        assert!(policy.filter_remote(&"127.0.0.1".parse().unwrap()).is_ok());
    }
}
