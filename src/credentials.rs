//! Secret handling: sudo passwords and other short-lived credentials are
//! kept as byte buffers, never as `String`, and wiped on every exit path.
//!
//! Two layers, per the design: [`SecureBytes`] owns a buffer and overwrites
//! it (random, zero, random, zero) before release; [`SecureCache`] adds a
//! creation time and TTL on top; [`SudoCache`] maps session id to
//! `SecureCache`.

use crate::clock::Clock;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A byte buffer holding secret material. Wiped on drop and on every
/// explicit release path with a random/zero/random/zero pattern so no
/// single memory scan can recover a fixed pattern from the old bytes.
pub struct SecureBytes {
    bytes: Vec<u8>,
}

impl SecureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Borrow the secret bytes. This is the one permitted point where the
    /// caller may look at the plaintext -- e.g. writing it to a PTY.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// A defensive copy, independent of this buffer's lifetime. The caller
    /// is responsible for wiping it when done.
    pub fn defensive_copy(&self) -> SecureBytes {
        SecureBytes::new(self.bytes.clone())
    }

    fn wipe(buf: &mut [u8]) {
        let mut rng = rand::thread_rng();
        rng.fill_bytes(buf);
        buf.fill(0);
        rng.fill_bytes(buf);
        buf.fill(0);
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        Self::wipe(&mut self.bytes);
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBytes")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A [`SecureBytes`] value with a creation time and TTL.
pub struct SecureCache {
    data: Option<SecureBytes>,
    created_at: Instant,
    ttl: Duration,
}

impl SecureCache {
    pub fn new(bytes: Vec<u8>, created_at: Instant, ttl: Duration) -> Self {
        Self {
            data: Some(SecureBytes::new(bytes)),
            created_at,
            ttl,
        }
    }

    /// Returns a defensive copy, or `None` if expired. Expired data is
    /// wiped as a side effect.
    pub fn get(&mut self, now: Instant) -> Option<SecureBytes> {
        if !self.is_valid(now) {
            self.clear();
            return None;
        }
        self.data.as_ref().map(SecureBytes::defensive_copy)
    }

    pub fn is_valid(&mut self, now: Instant) -> bool {
        if self.data.is_none() {
            return false;
        }
        if now.duration_since(self.created_at) >= self.ttl {
            self.clear();
            return false;
        }
        true
    }

    pub fn expires_in(&self, now: Instant) -> Duration {
        self.ttl
            .checked_sub(now.duration_since(self.created_at))
            .unwrap_or(Duration::ZERO)
    }

    /// Idempotent: wipes the held bytes (if any) and marks the cache empty.
    pub fn clear(&mut self) {
        self.data = None;
    }
}

/// Maps session id to a cached sudo credential.
#[derive(Clone)]
pub struct SudoCache {
    clock: Arc<dyn Clock>,
    entries: Arc<RwLock<HashMap<String, SecureCache>>>,
    ttl: Duration,
}

impl SudoCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Stores `bytes` for `session_id`, wiping any prior entry first.
    pub async fn set(&self, session_id: &str, bytes: Vec<u8>) {
        let mut entries = self.entries.write().await;
        if let Some(old) = entries.get_mut(session_id) {
            old.clear();
        }
        entries.insert(
            session_id.to_string(),
            SecureCache::new(bytes, self.clock.now(), self.ttl),
        );
    }

    pub async fn get(&self, session_id: &str) -> Option<SecureBytes> {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        entries.get_mut(session_id).and_then(|c| c.get(now))
    }

    pub async fn is_valid(&self, session_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        match entries.get_mut(session_id) {
            Some(c) => c.is_valid(now),
            None => false,
        }
    }

    pub async fn expires_in(&self, session_id: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        entries.get(session_id).map(|c| c.expires_in(self.clock.now()))
    }

    pub async fn clear(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(mut c) = entries.remove(session_id) {
            c.clear();
        }
    }

    pub async fn clear_all(&self) {
        let mut entries = self.entries.write().await;
        for (_, mut c) in entries.drain() {
            c.clear();
        }
    }

    /// Drops any entry that has expired. Unlike `get`/`is_valid`, this
    /// walks the whole map; intended for a periodic background sweep.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        entries.retain(|_, c| c.is_valid(now));
    }
}
