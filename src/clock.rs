//! Injectable time source.
//!
//! Every time-dependent path in this crate (cache expiry, rate limiter, read
//! deadlines, recorder timestamps, pool health/idle eviction) goes through
//! this port instead of reading wall-clock time directly, so tests can drive
//! time deterministically with [`FakeClock`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A point in time as seen by the injected clock, comparable and orderable
/// the way [`std::time::Instant`] is, but cheaply constructible by fakes.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic "now", used for intervals and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch, used for recorder headers.
    fn unix_now(&self) -> f64;

    /// Sleep until the given instant. Used by background loops (health
    /// ticks, rate-limiter cleanup) so fakes can make them resolve
    /// instantly or on `advance`.
    fn sleep_until<'a>(
        &'a self,
        deadline: Instant,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>;
}

/// Real clock backed by the OS.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn sleep_until<'a>(
        &'a self,
        deadline: Instant,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep_until(deadline.into()))
    }
}

/// Deterministic clock for tests. `now()`/`unix_now()` only move when
/// [`FakeClock::advance`] is called; `sleep_until` resolves as soon as the
/// advanced time reaches the deadline, polled via a small fixed backoff so
/// tests don't need a custom waker.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

#[derive(Debug)]
struct FakeClockState {
    now: Instant,
    unix_base: f64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                now: Instant::now(),
                unix_base: 1_700_000_000.0,
            })),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut s = self.inner.lock().unwrap();
        s.now += d;
        s.unix_base += d.as_secs_f64();
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().now
    }

    fn unix_now(&self) -> f64 {
        self.inner.lock().unwrap().unix_base
    }

    fn sleep_until<'a>(
        &'a self,
        deadline: Instant,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                if self.now() >= deadline {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }
}
