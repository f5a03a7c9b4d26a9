// Shared byte-budgeted cache for serialized chunks and other derived
// values. Eviction is cost-weighted LRU: each entry carries the cost (in
// seconds) that producing it took, and the cheapest-to-recompute,
// least-recently-used entries are evicted first. Eviction runs
// synchronously on insert.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    nbytes: u64,
    cost: f64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    total_bytes: u64,
    tick: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
pub struct ObjectCache {
    available_bytes: u64,
    inner: Mutex<Inner>,
}

impl ObjectCache {
    pub fn new(available_bytes: u64) -> Self {
        Self {
            available_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.available_bytes
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = tick;
                let value = entry.value.clone();
                inner.hits += 1;
                tracing::debug!(key, "object cache hit");
                Some(value)
            }
            None => {
                inner.misses += 1;
                tracing::debug!(key, "object cache miss");
                None
            }
        }
    }

    /// Insert a value with its production cost in seconds. Values larger
    /// than the whole budget are not admitted.
    pub fn put(&self, key: impl Into<String>, value: Bytes, cost: f64) {
        let nbytes = value.len() as u64;
        if nbytes > self.available_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let key = key.into();
        if let Some(old) = inner.entries.remove(&key) {
            inner.total_bytes -= old.nbytes;
        }
        inner.total_bytes += nbytes;
        inner.entries.insert(
            key,
            Entry {
                value,
                nbytes,
                cost,
                last_access: tick,
            },
        );
        while inner.total_bytes > self.available_bytes {
            // Victim: smallest cost-weighted recency score.
            let victim = inner
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(entry) = inner.entries.remove(&k) {
                        inner.total_bytes -= entry.nbytes;
                        tracing::debug!(key = %k, "object cache evict");
                    }
                }
                None => break,
            }
        }
    }

    pub fn discard(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_bytes -= entry.nbytes;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// (hits, misses) counters, for diagnostics.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}

fn score(entry: &Entry) -> f64 {
    // Recency dominates; cost breaks ties so that expensive values
    // survive longer than cheap ones touched at the same time.
    entry.last_access as f64 + entry.cost
}
