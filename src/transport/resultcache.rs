//! Operation-result (dedup) cache: keyed by `(peer ip, peer port,
//! transaction id)`, stores `(result, errno)` so a retransmitted mutating
//! request returns the original outcome instead of replaying its side
//! effect.
//!
//! Unbounded growth is the obvious hazard of a cache keyed by ever-growing
//! transaction IDs; entries are evicted once they age past a window wider
//! than the sender's own retry window (`RETRY_LIMIT * AGAIN_LIMIT` poll
//! cycles), since no legitimate retransmit can arrive after that.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub transaction_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedResult {
    pub result: i32,
    pub errno: u16,
}

struct Entry {
    value: CachedResult,
    inserted_at: Instant,
}

/// Default retention window: generous relative to the sender's own
/// `RETRY_LIMIT * AGAIN_LIMIT * poll_timeout` budget.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<ResultKey, Entry>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration) -> ResultCache {
        ResultCache { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: ResultKey) -> Option<CachedResult> {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        self.evict_expired(&mut entries);
        entries.get(&key).map(|e| e.value)
    }

    pub fn insert(&self, key: ResultKey, value: CachedResult) {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        entries.insert(key, Entry { value, inserted_at: Instant::now() });
    }

    /// Look up and insert as a single atomic step: `compute` runs (and its
    /// side effect takes place) only on a cache miss.
    pub fn get_or_insert_with(
        &self,
        key: ResultKey,
        compute: impl FnOnce() -> CachedResult,
    ) -> CachedResult {
        {
            let mut entries = self.entries.lock().expect("result cache poisoned");
            self.evict_expired(&mut entries);
            if let Some(hit) = entries.get(&key) {
                return hit.value;
            }
        }
        let value = compute();
        let mut entries = self.entries.lock().expect("result cache poisoned");
        entries.entry(key).or_insert(Entry { value, inserted_at: Instant::now() });
        value
    }

    fn evict_expired(&self, entries: &mut HashMap<ResultKey, Entry>) {
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("result cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(tid: u16) -> ResultKey {
        ResultKey { peer_ip: Ipv4Addr::LOCALHOST, peer_port: 9000, transaction_id: tid }
    }

    #[test]
    fn a_retransmit_does_not_repeat_the_side_effect() {
        let cache = ResultCache::default();
        let side_effects = AtomicU32::new(0);
        let run = || {
            cache.get_or_insert_with(key(1), || {
                side_effects.fetch_add(1, Ordering::SeqCst);
                CachedResult { result: 0, errno: 0 }
            })
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
        assert_eq!(side_effects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_transaction_ids_do_not_collide() {
        let cache = ResultCache::default();
        cache.insert(key(1), CachedResult { result: 0, errno: 0 });
        cache.insert(key(2), CachedResult { result: -1, errno: 2 });
        assert_eq!(cache.get(key(1)).unwrap().result, 0);
        assert_eq!(cache.get(key(2)).unwrap().result, -1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.insert(key(1), CachedResult { result: 0, errno: 0 });
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(key(1)).is_none());
    }
}
