//! Bounded LRU cache of fully-reassembled plaintext file bodies.
//!
//! Keyed by arbitrary strings. The filesystem adapter uses `"file:<virtualPath>"`
//! so that [`ContentCache::evict_by_prefix`] can drop every cached body under a
//! path without the cache needing to know anything about path structure.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Default byte budget when a caller does not specify one: 256 MiB.
pub const DEFAULT_BUDGET_BYTES: u64 = 256 * 1024 * 1024;

struct Entry {
    bytes: Arc<[u8]>,
    last_access_millis: AtomicI64,
}

/// Bounded, LRU-evicting cache of immutable byte bodies.
///
/// `add` and `get` are lock-free on the common path; eviction is serialized
/// by a dedicated mutex, and the entering thread re-checks the over-budget
/// condition after acquiring it, since the atomic size counter can have
/// moved between the check that triggered eviction and the lock being
/// granted.
pub struct ContentCache {
    entries: DashMap<String, Entry>,
    current_size: AtomicU64,
    budget_bytes: u64,
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    #[must_use]
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            current_size: AtomicU64::new(0),
            budget_bytes,
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_default_budget() -> Self {
        Self::new(DEFAULT_BUDGET_BYTES)
    }

    /// Insert or replace the body stored under `key`, evicting older entries
    /// if the cache is now over budget.
    pub fn add(&self, key: impl Into<String>, bytes: Vec<u8>) {
        let key = key.into();
        let new_len = bytes.len() as u64;

        if let Some((_, old)) = self.entries.remove(&key) {
            self.current_size.fetch_sub(old.bytes.len() as u64, Ordering::Relaxed);
        }
        self.entries.insert(
            key,
            Entry {
                bytes: Arc::from(bytes.into_boxed_slice()),
                last_access_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            },
        );
        self.current_size.fetch_add(new_len, Ordering::Relaxed);

        if self.current_size.load(Ordering::Relaxed) > self.budget_bytes {
            self.evict_until_within_budget();
        }
    }

    /// Returns a cheap clone of the cached body and bumps its recency, or
    /// `None` on a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        let Some(entry) = self.entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        entry.last_access_millis.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&entry.bytes))
    }

    /// `(hits, misses)` observed by [`Self::get`] since this cache was
    /// created. Used by the `--stats` mount flag to report a hit rate.
    #[must_use]
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn evict(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.current_size.fetch_sub(entry.bytes.len() as u64, Ordering::Relaxed);
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn evict_by_prefix(&self, prefix: &str) {
        let matches: Vec<String> = self
            .entries
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .map(|kv| kv.key().clone())
            .collect();
        for key in matches {
            self.evict(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn evict_until_within_budget(&self) {
        let _guard = self.eviction_lock.lock();
        if self.current_size.load(Ordering::Relaxed) <= self.budget_bytes {
            trace!("eviction pass aborted: another thread already brought the cache in budget");
            return;
        }

        let mut by_recency: Vec<(String, i64, u64)> = self
            .entries
            .iter()
            .map(|kv| {
                (
                    kv.key().clone(),
                    kv.value().last_access_millis.load(Ordering::Relaxed),
                    kv.value().bytes.len() as u64,
                )
            })
            .collect();
        by_recency.sort_by_key(|(_, last_access, _)| *last_access);

        for (key, _, size) in by_recency {
            if self.current_size.load(Ordering::Relaxed) <= self.budget_bytes {
                break;
            }
            if self.entries.remove(&key).is_some() {
                self.current_size.fetch_sub(size, Ordering::Relaxed);
                debug!(key, "evicted cache entry to stay within budget");
            }
        }
    }
}
