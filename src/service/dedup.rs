//! Dedup cache (C6): a bounded, TTL'd associative map keyed by correlation
//! id, used to make `handleMaybeAct` idempotent under retries (§4.11, P7).

use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_TTL_MS: u64 = 30_000;
pub const DEFAULT_MAX: usize = 1024;

struct Entry<T> {
    value: T,
    expires_at_ms: u64,
}

/// Bounded, insertion-ordered, TTL'd cache. Iteration order of the
/// underlying map is insertion order, so "oldest" is well defined (§4.6).
pub struct DedupCache<T> {
    max: usize,
    ttl_ms: u64,
    seq: u64,
    by_id: HashMap<String, (u64, Entry<T>)>,
    /// seq -> id, maintains insertion order for oldest-eviction.
    order: BTreeMap<u64, String>,
}

impl<T> DedupCache<T> {
    pub fn new(max: usize, ttl_ms: u64) -> Self {
        Self {
            max,
            ttl_ms,
            seq: 0,
            by_id: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn sweep_expired(&mut self, now_ms: u64) {
        let expired: Vec<String> = self
            .by_id
            .iter()
            .filter(|(_, (_, e))| e.expires_at_ms <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.remove(&id);
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some((seq, _)) = self.by_id.remove(id) {
            self.order.remove(&seq);
        }
    }

    /// Insert a value for `id`. On `size >= max`, first sweeps expired
    /// entries; if still full, evicts the oldest-inserted entry (§4.6).
    pub fn set(&mut self, id: impl Into<String>, value: T, now_ms: u64) {
        let id = id.into();
        if self.by_id.len() >= self.max {
            self.sweep_expired(now_ms);
        }
        if self.by_id.len() >= self.max {
            if let Some((&seq, oldest_id)) = self.order.iter().next() {
                let oldest_id = oldest_id.clone();
                self.order.remove(&seq);
                self.by_id.remove(&oldest_id);
            }
        }
        // Replacing an existing id keeps the original insertion slot out of
        // the ordering structure clean by removing it first.
        self.remove(&id);

        let seq = self.seq;
        self.seq += 1;
        self.order.insert(seq, id.clone());
        self.by_id.insert(
            id,
            (
                seq,
                Entry {
                    value,
                    expires_at_ms: now_ms + self.ttl_ms,
                },
            ),
        );
    }

    pub fn get(&self, id: &str, now_ms: u64) -> Option<&T> {
        self.by_id.get(id).and_then(|(_, e)| {
            if e.expires_at_ms > now_ms {
                Some(&e.value)
            } else {
                None
            }
        })
    }

    pub fn contains(&self, id: &str, now_ms: u64) -> bool {
        self.get(id, now_ms).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<T> Default for DedupCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX, DEFAULT_TTL_MS)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut c = DedupCache::new(4, 30_000);
        c.set("a", 1, 0);
        assert_eq!(c.get("a", 0), Some(&1));
    }

    #[test]
    fn test_expiry() {
        let mut c = DedupCache::new(4, 1000);
        c.set("a", 1, 0);
        assert_eq!(c.get("a", 1001), None);
    }

    #[test]
    fn test_evicts_oldest_when_full_and_nothing_expired() {
        let mut c: DedupCache<u32> = DedupCache::new(2, 30_000);
        c.set("a", 1, 0);
        c.set("b", 2, 1);
        c.set("c", 3, 2);
        assert!(c.get("a", 2).is_none());
        assert!(c.get("b", 2).is_some());
        assert!(c.get("c", 2).is_some());
    }

    #[test]
    fn test_sweeps_expired_before_evicting_oldest() {
        let mut c: DedupCache<u32> = DedupCache::new(2, 10);
        c.set("a", 1, 0);
        c.set("b", 2, 100);
        // "a" has expired by now; it should be swept instead of forcing
        // eviction of "b".
        c.set("c", 3, 101);
        assert!(c.get("b", 101).is_some());
        assert!(c.get("c", 101).is_some());
    }

    #[test]
    fn test_idempotent_lookup_returns_same_value() {
        let mut c = DedupCache::new(16, 30_000);
        c.set("corr-1", "first-response".to_string(), 0);
        assert_eq!(c.get("corr-1", 1), Some(&"first-response".to_string()));
        assert_eq!(c.get("corr-1", 2), Some(&"first-response".to_string()));
    }
}
