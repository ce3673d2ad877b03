//! Per-host/user auth-failure lockout.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry {
    failure_count: u32,
    first_fail: Instant,
    locked_at: Option<Instant>,
}

#[derive(Clone)]
pub struct AuthRateLimiter {
    clock: Arc<dyn Clock>,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    max_failures: u32,
    lockout_duration: Duration,
}

fn key(user: &str, host: &str) -> String {
    format!("{user}@{host}")
}

impl AuthRateLimiter {
    pub fn new(clock: Arc<dyn Clock>, max_failures: u32, lockout_duration: Duration) -> Self {
        Self {
            clock,
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_failures,
            lockout_duration,
        }
    }

    pub async fn record_failure(&self, user: &str, host: &str) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key(user, host)).or_insert_with(|| Entry {
            failure_count: 0,
            first_fail: now,
            locked_at: None,
        });
        entry.failure_count += 1;
        if entry.failure_count >= self.max_failures {
            entry.locked_at = Some(now);
        }
    }

    /// Returns `(locked, remaining)`; `remaining` is zero when not locked.
    pub async fn is_locked(&self, user: &str, host: &str) -> (bool, Duration) {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.get(&key(user, host)).and_then(|e| e.locked_at) {
            Some(locked_at) => {
                let elapsed = now.duration_since(locked_at);
                if elapsed < self.lockout_duration {
                    (true, self.lockout_duration - elapsed)
                } else {
                    (false, Duration::ZERO)
                }
            }
            None => (false, Duration::ZERO),
        }
    }

    pub async fn record_success(&self, user: &str, host: &str) {
        self.entries.write().await.remove(&key(user, host));
    }

    /// Removes entries whose lockout has fully expired, or whose first
    /// failure is older than twice the lockout duration with no lockout
    /// ever triggered (stale, low-frequency failures that never escalated).
    pub async fn cleanup(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| {
            if let Some(locked_at) = e.locked_at {
                now.duration_since(locked_at) < self.lockout_duration
            } else {
                now.duration_since(e.first_fail) < 2 * self.lockout_duration
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[tokio::test]
    async fn lockout_after_max_failures_and_auto_expiry() {
        let clock = Arc::new(FakeClock::new());
        let limiter = AuthRateLimiter::new(clock.clone(), 3, Duration::from_secs(60));

        for _ in 0..3 {
            limiter.record_failure("alice", "host1").await;
        }

        let (locked, remaining) = limiter.is_locked("alice", "host1").await;
        assert!(locked);
        assert!(remaining > Duration::ZERO && remaining <= Duration::from_secs(60));

        clock.advance(Duration::from_secs(61));
        let (locked, remaining) = limiter.is_locked("alice", "host1").await;
        assert!(!locked);
        assert_eq!(remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn success_clears_entry() {
        let clock = Arc::new(FakeClock::new());
        let limiter = AuthRateLimiter::new(clock, 2, Duration::from_secs(60));
        limiter.record_failure("bob", "host2").await;
        limiter.record_failure("bob", "host2").await;
        assert!(limiter.is_locked("bob", "host2").await.0);
        limiter.record_success("bob", "host2").await;
        assert!(!limiter.is_locked("bob", "host2").await.0);
    }

    #[tokio::test]
    async fn below_threshold_not_locked() {
        let clock = Arc::new(FakeClock::new());
        let limiter = AuthRateLimiter::new(clock, 5, Duration::from_secs(60));
        limiter.record_failure("carol", "host3").await;
        assert!(!limiter.is_locked("carol", "host3").await.0);
    }
}
