//! Per-IP token bucket rate limiter (spec.md §4.K, optional).
//!
//! No external limiter crate appears anywhere in the examples pack, so
//! this follows the same primitives the teacher reaches for elsewhere
//! in the workspace: a `mea::Mutex`-guarded map (cf. `meta.rs`'s
//! in-memory backend) plus `std::time::Instant` deltas for the refill
//! math.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mea::mutex::Mutex;

use crate::error::BareError;
use crate::response::Header;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 300, refill_per_sec: 1.0 }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        Self { tokens: capacity as f64, last_refill: Instant::now() }
    }

    fn refill(&mut self, cfg: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * cfg.refill_per_sec).min(cfg.capacity as f64);
        self.last_refill = now;
    }
}

/// Outcome of a rate-limit check, enough to render both the `429`
/// headers and the success-path `RateLimit-*` headers.
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
}

impl RateLimitOutcome {
    pub fn to_error(&self) -> BareError {
        BareError::ConnectionLimitExceeded
    }

    pub fn headers(&self) -> Vec<Header> {
        vec![
            Header::new("RateLimit-Limit", self.limit.to_string()),
            Header::new("RateLimit-Remaining", self.remaining.to_string()),
            Header::new("RateLimit-Reset", self.reset_secs.to_string()),
        ]
    }

    pub fn retry_after_header(&self) -> Header {
        Header::new("Retry-After", self.reset_secs.to_string())
    }
}

/// Disabled (no-op) unless explicitly configured, matching spec.md
/// §4.K "(optional)".
pub struct RateLimiter {
    config: Option<RateLimitConfig>,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RateLimiter {
    pub fn disabled() -> Self {
        Self { config: None, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn new(config: RateLimitConfig) -> Self {
        Self { config: Some(config), buckets: Mutex::new(HashMap::new()) }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// `keep_alive = true` consumes a token; `false` only inspects the
    /// current count (spec.md §4.K "two modes per exchange").
    pub async fn check(&self, ip: IpAddr, keep_alive: bool) -> RateLimitOutcome {
        let Some(cfg) = &self.config else {
            return RateLimitOutcome { allowed: true, limit: u32::MAX, remaining: u32::MAX, reset_secs: 0 };
        };
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket::new(cfg.capacity));
        bucket.refill(cfg);

        let remaining_before = bucket.tokens;
        let allowed = remaining_before >= 1.0;
        if allowed && keep_alive {
            bucket.tokens -= 1.0;
        }

        let reset_secs = if cfg.refill_per_sec > 0.0 {
            ((cfg.capacity as f64 - bucket.tokens) / cfg.refill_per_sec).ceil().max(0.0) as u64
        } else {
            0
        };

        RateLimitOutcome {
            allowed,
            limit: cfg.capacity,
            remaining: bucket.tokens.max(0.0) as u32,
            reset_secs,
        }
    }
}

/// Client IP resolution order: `X-Forwarded-For` first value, else
/// `X-Real-IP`, else peer address (spec.md §4.K).
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: IpAddr,
) -> IpAddr {
    if let Some(first) = forwarded_for.and_then(|v| v.split(',').next()) {
        if let Ok(ip) = first.trim().parse() {
            return ip;
        }
    }
    if let Some(ip) = real_ip.and_then(|v| v.trim().parse().ok()) {
        return ip;
    }
    peer
}

pub fn sleep_for_tests() -> Duration {
    Duration::from_millis(10)
}

/// Keep-alive heuristic (spec.md §9 (ii), Open Question (ii)): HTTP/1.1
/// defaults to keep-alive unless `Connection: close` is present;
/// HTTP/1.0 defaults to close unless `Connection: keep-alive` is
/// explicit. There is no way to know the transport's actual connection
/// reuse plans from the request alone, so this is advisory only.
pub fn is_keep_alive(is_http11: bool, connection_header: Option<&str>) -> bool {
    let tokens = |v: &str| -> Vec<String> { v.split(',').map(|t| t.trim().to_ascii_lowercase()).collect() };
    match connection_header {
        Some(v) if is_http11 => !tokens(v).iter().any(|t| t == "close"),
        Some(v) => tokens(v).iter().any(|t| t == "keep-alive"),
        None => is_http11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_always_allows() {
        smol::block_on(async {
            let limiter = RateLimiter::disabled();
            let outcome = limiter.check("127.0.0.1".parse().unwrap(), true).await;
            assert!(outcome.allowed);
        });
    }

    #[test]
    fn exhausts_then_refills() {
        smol::block_on(async {
            let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 100.0 });
            let ip: IpAddr = "10.0.0.1".parse().unwrap();
            assert!(limiter.check(ip, true).await.allowed);
            assert!(!limiter.check(ip, true).await.allowed);
            smol::Timer::after(Duration::from_millis(20)).await;
            assert!(limiter.check(ip, true).await.allowed);
        });
    }

    #[test]
    fn inspect_mode_does_not_consume() {
        smol::block_on(async {
            let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 0.0 });
            let ip: IpAddr = "10.0.0.2".parse().unwrap();
            assert!(limiter.check(ip, false).await.allowed);
            assert!(limiter.check(ip, false).await.allowed);
        });
    }

    #[test]
    fn resolves_forwarded_for_then_real_ip_then_peer() {
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(
            resolve_client_ip(Some("1.2.3.4, 5.6.7.8"), None, peer),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(resolve_client_ip(None, Some("9.9.9.9"), peer), "9.9.9.9".parse::<IpAddr>().unwrap());
        assert_eq!(resolve_client_ip(None, None, peer), peer);
    }

    #[test]
    fn http11_defaults_keep_alive_unless_close_present() {
        assert!(is_keep_alive(true, None));
        assert!(!is_keep_alive(true, Some("close")));
        assert!(is_keep_alive(true, Some("Keep-Alive")));
    }

    #[test]
    fn http10_defaults_close_unless_keep_alive_present() {
        assert!(!is_keep_alive(false, None));
        assert!(is_keep_alive(false, Some("keep-alive")));
        assert!(!is_keep_alive(false, Some("close")));
    }
}
