//! Per-(host, port, user) pool of SSH connections with idle eviction and
//! keepalive health checks, driven entirely by the injected [`Clock`].

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::error::{AgentShellError, Result};
use crate::ssh_dialer::{ConnectSpec, PooledConn, SSHDialer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

struct Entry<C> {
    conn: C,
    created: Instant,
    last_used: Instant,
    in_use: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
}

/// A pool of connections to one `(host, port, user)`.
pub struct Pool<D: SSHDialer> {
    dialer: Arc<D>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    spec_template: ConnectSpec,
    connections: Mutex<Vec<Entry<D::Conn>>>,
}

impl<D: SSHDialer> Pool<D> {
    fn new(dialer: Arc<D>, clock: Arc<dyn Clock>, config: PoolConfig, spec_template: ConnectSpec) -> Self {
        Self {
            dialer,
            clock,
            config,
            spec_template,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Scans for an idle connection; else dials a new one if below `max`;
    /// else fails `PoolExhausted`.
    pub async fn get(&self) -> Result<D::Conn> {
        let mut conns = self.connections.lock().await;

        if let Some(entry) = conns.iter_mut().find(|e| !e.in_use) {
            entry.in_use = true;
            entry.last_used = self.clock.now();
            return Ok(entry.conn.clone());
        }

        if conns.len() >= self.config.max {
            return Err(AgentShellError::PoolExhausted(format!(
                "{}@{}:{}",
                self.spec_template.user, self.spec_template.host, self.spec_template.port
            )));
        }

        let conn = self.dialer.dial(self.spec_template.clone()).await?;
        let now = self.clock.now();
        conns.push(Entry {
            conn: conn.clone(),
            created: now,
            last_used: now,
            in_use: true,
        });
        Ok(conn)
    }

    /// Returns a connection to idle.
    pub async fn put(&self, conn: &D::Conn) {
        let mut conns = self.connections.lock().await;
        if let Some(entry) = conns.iter_mut().find(|e| e.conn.id() == conn.id()) {
            entry.in_use = false;
            entry.last_used = self.clock.now();
        }
    }

    /// Removes a connection from the pool entirely (caller determined it's
    /// unusable).
    pub async fn release(&self, conn: &D::Conn) {
        let mut conns = self.connections.lock().await;
        conns.retain(|e| e.conn.id() != conn.id());
    }

    /// Runs one health-check pass: evicts idle connections past
    /// `max_idle_time` (never dropping idle count below `min`), and sends
    /// a keepalive to every remaining idle connection, evicting failures.
    /// In-use connections are never inspected, so they can never be
    /// evicted by this loop.
    pub async fn health_tick(&self) {
        let now = self.clock.now();
        let mut to_check: Vec<D::Conn> = Vec::new();

        {
            let mut conns = self.connections.lock().await;
            let idle_count = conns.iter().filter(|e| !e.in_use).count();
            let mut evictable = idle_count.saturating_sub(self.config.min);

            conns.retain(|e| {
                if e.in_use {
                    return true;
                }
                if evictable > 0 && now.duration_since(e.last_used) > self.config.max_idle_time {
                    evictable -= 1;
                    return false;
                }
                true
            });

            for e in conns.iter().filter(|e| !e.in_use) {
                to_check.push(e.conn.clone());
            }
        }

        for conn in to_check {
            if conn.keepalive().await.is_err() {
                let mut conns = self.connections.lock().await;
                conns.retain(|e| !(e.conn.id() == conn.id() && !e.in_use));
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let conns = self.connections.lock().await;
        let in_use = conns.iter().filter(|e| e.in_use).count();
        PoolStats {
            total: conns.len(),
            in_use,
            idle: conns.len() - in_use,
        }
    }

    pub async fn close(&self) {
        self.connections.lock().await.clear();
    }
}

/// Mapping from pool key to [`Pool`], with lazy creation and `close_all`.
pub struct PoolManager<D: SSHDialer> {
    dialer: Arc<D>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    pools: Arc<RwLock<HashMap<String, Arc<Pool<D>>>>>,
}

impl<D: SSHDialer> Clone for PoolManager<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            pools: self.pools.clone(),
        }
    }
}

impl<D: SSHDialer> PoolManager<D> {
    pub fn new(dialer: Arc<D>, clock: Arc<dyn Clock>, config: PoolConfig) -> Self {
        Self {
            dialer,
            clock,
            config,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key(spec: &ConnectSpec) -> String {
        format!("{}@{}:{}", spec.user, spec.host, spec.port)
    }

    pub async fn pool_for(&self, spec: &ConnectSpec) -> Arc<Pool<D>> {
        let key = Self::key(spec);
        if let Some(pool) = self.pools.read().await.get(&key) {
            return pool.clone();
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Pool::new(
                    self.dialer.clone(),
                    self.clock.clone(),
                    self.config.clone(),
                    spec.clone(),
                ))
            })
            .clone()
    }

    /// Runs one health pass across every pool. Intended to be driven by a
    /// background loop ticking on `config.health_check_interval` via the
    /// injected clock.
    pub async fn health_tick_all(&self) {
        let pools: Vec<Arc<Pool<D>>> = self.pools.read().await.values().cloned().collect();
        for pool in pools {
            pool.health_tick().await;
        }
    }

    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// A connection that can be told to start failing its keepalive, used
    /// to drive eviction deterministically without a real SSH server.
    #[derive(Clone)]
    struct FakeConn {
        id: usize,
        dead: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PooledConn for FakeConn {
        fn id(&self) -> usize {
            self.id
        }

        async fn keepalive(&self) -> Result<()> {
            if self.dead.load(Ordering::SeqCst) {
                Err(AgentShellError::ConnFailed("fake connection is dead".into()))
            } else {
                Ok(())
            }
        }
    }

    struct FakeDialer {
        next_id: AtomicUsize,
        dial_count: AtomicUsize,
        last_dialed: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl FakeDialer {
        fn new() -> Self {
            Self {
                next_id: AtomicUsize::new(1),
                dial_count: AtomicUsize::new(0),
                last_dialed: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SSHDialer for FakeDialer {
        type Conn = FakeConn;

        async fn dial(&self, _spec: ConnectSpec) -> Result<FakeConn> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let dead = Arc::new(AtomicBool::new(false));
            *self.last_dialed.lock().await = Some(dead.clone());
            Ok(FakeConn { id, dead })
        }
    }

    fn test_spec() -> ConnectSpec {
        ConnectSpec {
            host: "example.com".into(),
            port: 22,
            user: "deploy".into(),
            auth: crate::ssh_dialer::AuthHints::default(),
            known_hosts_path: None,
        }
    }

    #[tokio::test]
    async fn pool_exhausted_when_at_max_and_all_in_use() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let dialer = Arc::new(FakeDialer::new());
        let config = PoolConfig {
            max: 1,
            min: 0,
            max_idle_time: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
        };
        let manager = PoolManager::new(dialer, clock, config);
        let pool = manager.pool_for(&test_spec()).await;

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, AgentShellError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn get_put_get_reuses_the_same_connection() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let dialer = Arc::new(FakeDialer::new());
        let config = PoolConfig {
            max: 4,
            min: 0,
            max_idle_time: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
        };
        let manager = PoolManager::new(dialer.clone(), clock, config);
        let pool = manager.pool_for(&test_spec()).await;

        let conn1 = pool.get().await.unwrap();
        pool.put(&conn1).await;
        let conn2 = pool.get().await.unwrap();

        assert_eq!(conn1.id(), conn2.id());
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_connection_is_evicted_on_health_tick() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let dialer = Arc::new(FakeDialer::new());
        let config = PoolConfig {
            max: 4,
            min: 0,
            max_idle_time: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(10),
        };
        let manager = PoolManager::new(dialer.clone(), clock, config);
        let pool = manager.pool_for(&test_spec()).await;

        let conn = pool.get().await.unwrap();
        pool.put(&conn).await;
        assert_eq!(pool.stats().await.total, 1);

        dialer.last_dialed.lock().await.as_ref().unwrap().store(true, Ordering::SeqCst);
        pool.health_tick().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn idle_past_max_idle_time_is_evicted_respecting_min_floor() {
        let clock = Arc::new(FakeClock::new());
        let dialer = Arc::new(FakeDialer::new());
        let config = PoolConfig {
            max: 4,
            min: 1,
            max_idle_time: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
        };
        let manager = PoolManager::new(dialer, Arc::clone(&clock) as Arc<dyn Clock>, config);
        let pool = manager.pool_for(&test_spec()).await;

        let conn1 = pool.get().await.unwrap();
        pool.put(&conn1).await;
        let conn2 = pool.get().await.unwrap();
        pool.put(&conn2).await;
        assert_eq!(pool.stats().await.total, 2);

        clock.advance(Duration::from_secs(10));
        pool.health_tick().await;

        // min=1 keeps one idle connection alive even though both are
        // past max_idle_time.
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn in_use_connection_is_never_evicted() {
        let clock = Arc::new(FakeClock::new());
        let dialer = Arc::new(FakeDialer::new());
        let config = PoolConfig {
            max: 4,
            min: 0,
            max_idle_time: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
        };
        let manager = PoolManager::new(dialer, Arc::clone(&clock) as Arc<dyn Clock>, config);
        let pool = manager.pool_for(&test_spec()).await;

        let _held = pool.get().await.unwrap();
        clock.advance(Duration::from_secs(100));
        pool.health_tick().await;

        assert_eq!(pool.stats().await.total, 1);
        assert_eq!(pool.stats().await.in_use, 1);
    }
}
