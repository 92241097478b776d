//! TTL-bounded caches
//!
//! Two pipeline uses: the request-deduplication cache (value = in-flight
//! marker) and the tombstone cache (value = last full change record held
//! between the delete phases). Both are explicitly constructed and passed
//! as dependencies; there is no ambient cache state and no proxy layer, so
//! the check-then-act sequences around `put_if_absent` stay visible to
//! callers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Concurrent map whose entries expire after a fixed TTL.
///
/// Expiry is lazy: entries are dropped when a read or write touches them
/// past their deadline. An expired entry behaves exactly like an absent one,
/// including for `put_if_absent`.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entry_for(&self, value: V) -> CacheEntry<V> {
        CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        }
    }

    /// Clone out the value for `key` if present and unexpired.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.live() => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // The read guard is dropped; clear the stale slot unless a fresh
        // write raced in behind it.
        self.entries.remove_if(key, |_, entry| !entry.live());
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite, restarting the TTL window.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), self.entry_for(value));
    }

    /// First write wins: insert only if the key is absent or expired.
    ///
    /// Returns true when this call claimed the slot. Concurrent callers are
    /// arbitrated by the shard lock held across the entry, so exactly one
    /// claims it.
    pub fn put_if_absent(&self, key: impl Into<String>, value: V) -> bool {
        match self.entries.entry(key.into()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    false
                } else {
                    occupied.insert(self.entry_for(value));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.entry_for(value));
                true
            }
        }
    }

    /// Remove the entry for `key`, returning its value if it was unexpired.
    pub fn evict(&self, key: &str) -> Option<V> {
        self.entries
            .remove(key)
            .filter(|(_, entry)| entry.live())
            .map(|(_, entry)| entry.value)
    }

    /// Read-and-evict in one step. Used by post-delete tombstone consumption.
    pub fn take(&self, key: &str) -> Option<V> {
        self.evict(key)
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
