//! Graceful shutdown: an atomic flag plus an in-flight counter, gated by
//! a `mea` condvar. Adapted from the teacher's
//! `httproxy::init::shutdown::GracefulShutdown`, generalized so the
//! server core (not just a binary's signal handler) owns it — this is
//! the "lifecycle" responsibility of component G (spec.md §2).
//!
//! [`GracefulShutdown`] gates two other things in this crate beyond the
//! accept loop: the outbound connection pool (`fetch::ConnectionPool`)
//! is torn down from the same signal, and every relay hands out a
//! [`CancelToken`] from `cancel_token()` so the per-exchange
//! cancellation spec.md §5 asks for shares this file's wait primitive
//! instead of duplicating it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use mea::condvar::Condvar;
use mea::mutex::Mutex;

#[derive(Clone, Debug)]
pub struct GracefulShutdown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    shutting_down: AtomicBool,
    inflight: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
}

#[derive(Debug)]
pub struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.cv.notify_all();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shutting_down: AtomicBool::new(false),
                inflight: AtomicU64::new(0),
                gate: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Idempotent: triggers shutdown, returns immediately both on first
    /// and subsequent calls.
    pub fn initiate(&self) {
        if self.inner.shutting_down.swap(true, Ordering::Release) {
            return;
        }
        self.inner.cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub async fn wait_shutting_down(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while !self.is_shutting_down() {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard { inner: self.inner.clone() }
    }

    pub fn inflight_count(&self) -> u64 {
        self.inner.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_inflight_zero(&self) {
        if self.inner.inflight.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while self.inner.inflight.load(Ordering::Acquire) != 0 {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    /// Hands out a [`CancelToken`] for one exchange, already wired so a
    /// server-wide shutdown cancels it too (spec.md §5 cancellation
    /// trigger (c)). The caller still has to fire it on the other two
    /// triggers — inbound body closing early, outbound socket closing —
    /// since those are per-exchange and this type has no visibility into
    /// either socket.
    pub fn cancel_token(&self) -> CancelToken {
        let token = CancelToken::new();
        let watched = token.clone();
        let shutdown = self.clone();
        smol::spawn(async move {
            shutdown.wait_shutting_down().await;
            watched.cancel();
        })
        .detach();
        token
    }
}

/// Per-exchange cancellation (spec.md §5: "each relay creates a
/// cancellation token ... triggered when either the inbound body closes
/// before completion or the outbound socket closes, and it cancels the
/// outbound request"). Shares the flag-plus-condvar wait idiom above,
/// scoped to a single relay instead of the whole process; fetch/relay
/// code races `cancelled()` against the next socket read or write so a
/// trigger takes effect within one scheduler turn rather than waiting
/// for the current I/O call to return on its own.
#[derive(Clone, Debug)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
    cv: Arc<Condvar>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self { fired: Arc::new(AtomicBool::new(false)), gate: Arc::new(Mutex::new(())), cv: Arc::new(Condvar::new()) }
    }

    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.cv.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut guard = self.gate.lock().await;
        while !self.is_cancelled() {
            guard = self.cv.wait(guard).await;
        }
    }

    /// Races `fut` against this token firing. Used to make a socket
    /// read/write or an `io::copy` loop give up within one scheduler
    /// turn of cancellation instead of running to completion.
    pub async fn race<Fut: std::future::Future>(&self, fut: Fut) -> Result<Fut::Output, Cancelled> {
        futures_lite::future::or(async { Ok(fut.await) }, async {
            self.cancelled().await;
            Err(Cancelled)
        })
        .await
    }
}

/// Returned by [`CancelToken::race`] when the token fired first.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiate_is_idempotent() {
        let s = GracefulShutdown::new();
        assert!(!s.is_shutting_down());
        s.initiate();
        s.initiate();
        assert!(s.is_shutting_down());
    }

    #[test]
    fn inflight_guard_decrements_on_drop() {
        let s = GracefulShutdown::new();
        {
            let _g = s.inflight_guard();
            assert_eq!(s.inflight_count(), 1);
        }
        assert_eq!(s.inflight_count(), 0);
    }

    #[test]
    fn cancel_token_fires_on_explicit_cancel() {
        smol::block_on(async {
            let token = CancelToken::new();
            assert!(!token.is_cancelled());
            token.cancel();
            token.cancelled().await;
            assert!(token.is_cancelled());
        });
    }

    #[test]
    fn cancel_token_fires_when_parent_shutdown_initiates() {
        smol::block_on(async {
            let shutdown = GracefulShutdown::new();
            let token = shutdown.cancel_token();
            assert!(!token.is_cancelled());
            shutdown.initiate();
            token.cancelled().await;
            assert!(token.is_cancelled());
        });
    }
}
