//! Time-bounded in-memory caches keyed by tenant
//!
//! Tenant weight overrides, plugin definitions, knowledge bases, and derived
//! key material all live in short-TTL caches with safe-to-miss semantics: a
//! miss means the caller reloads, never that the request fails. The clock is
//! injectable so tests can expire entries deterministically.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

// Cache contents are reloadable, so a poisoned lock recovers the inner map
// instead of failing the caller.
fn recover<'a, T>(lock: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = recover(&self.entries);
        entries.get(key).and_then(|(value, inserted)| {
            if now.duration_since(*inserted) < self.ttl {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut entries = recover(&self.entries);
        entries.insert(key, (value, now));
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = recover(&self.entries);
        entries.remove(key);
    }

    /// Drop every expired entry. Called opportunistically; correctness does
    /// not depend on it since `get` checks expiry itself.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        let mut entries = recover(&self.entries);
        entries.retain(|_, (_, inserted)| now.duration_since(*inserted) < self.ttl);
    }

    pub fn len(&self) -> usize {
        recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
