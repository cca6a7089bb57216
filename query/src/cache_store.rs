use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tokio::task::AbortHandle;

use crate::{clock::SharedClock, util};

pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A cached value together with the time it was written.
#[derive(Clone)]
pub struct CacheEntry {
    pub(crate) data: ErasedValue,
    /// When the value was fetched or set.
    pub timestamp: Instant,
    /// Lifetime measured from `timestamp`. `None` never expires.
    pub ttl: Option<Duration>,
    generation: u64,
}

impl CacheEntry {
    /// Borrows the value if it has type `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// Whether the entry outlived its ttl at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.timestamp) >= ttl,
            None => false,
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("timestamp", &self.timestamp)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Keyed map of cached values that owns their eviction timers.
pub(crate) struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    timers: Mutex<HashMap<String, AbortHandle>>,
    generation: AtomicU64,
    clock: SharedClock,
}

impl CacheStore {
    pub(crate) fn new(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            clock,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    pub(crate) fn get_data<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.entries
            .read()
            .get(key)
            .and_then(|entry| entry.data::<T>().cloned())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Replaces the entry for `key` and restarts its eviction timer.
    pub(crate) fn insert(
        self: &Arc<Self>,
        key: &str,
        data: ErasedValue,
        timestamp: Instant,
        ttl: Option<Duration>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            data,
            timestamp,
            ttl,
            generation,
        };
        self.entries.write().insert(key.to_string(), entry);
        self.schedule_eviction(key, timestamp, ttl, generation);
    }

    pub(crate) fn remove(&self, key: &str) -> Option<CacheEntry> {
        if let Some(timer) = self.timers.lock().remove(key) {
            timer.abort();
        }
        self.entries.write().remove(key)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
        self.entries.write().clear();
    }

    fn schedule_eviction(
        self: &Arc<Self>,
        key: &str,
        timestamp: Instant,
        ttl: Option<Duration>,
        generation: u64,
    ) {
        if let Some(previous) = self.timers.lock().remove(key) {
            previous.abort();
        }

        let Some(ttl) = ttl else {
            return;
        };
        if self.clock.is_virtual() {
            return;
        }

        let remaining = util::time_until_stale(timestamp, ttl, self.clock.now());
        let store = Arc::downgrade(self);
        let clock = self.clock.clone();
        let owned_key = key.to_string();

        let handle = util::spawn(async move {
            clock.sleep(remaining).await;
            if let Some(store) = store.upgrade() {
                store.evict(&owned_key, generation);
            }
        });

        if let Some(handle) = handle {
            self.timers.lock().insert(key.to_string(), handle);
        }
    }

    fn evict(&self, key: &str, generation: u64) {
        let mut entries = self.entries.write();
        // A newer write owns its own timer.
        if entries.get(key).map(|entry| entry.generation) == Some(generation) {
            entries.remove(key);
            drop(entries);
            self.timers.lock().remove(key);
            tracing::debug!(key, "cache entry evicted");
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        for (_, timer) in self.timers.get_mut().drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, SystemClock};

    fn erased<T: Send + Sync + 'static>(value: T) -> ErasedValue {
        Arc::new(value)
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let clock: SharedClock = Arc::new(SystemClock);
        let store = Arc::new(CacheStore::new(clock.clone()));

        store.insert("a", erased(1_u32), clock.now(), Some(Duration::from_secs(5)));
        store.insert("forever", erased(2_u32), clock.now(), None);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.get_data::<u32>("a"), Some(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get_data::<u32>("a"), None);
        assert_eq!(store.get_data::<u32>("forever"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_resets_its_timer() {
        let clock: SharedClock = Arc::new(SystemClock);
        let store = Arc::new(CacheStore::new(clock.clone()));

        store.insert("a", erased(1_u32), clock.now(), Some(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(4)).await;
        store.insert("a", erased(2_u32), clock.now(), Some(Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.get_data::<u32>("a"), Some(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn virtual_clock_never_evicts() {
        let manual = ManualClock::new();
        let clock: SharedClock = Arc::new(manual.clone());
        let store = Arc::new(CacheStore::new(clock.clone()));

        store.insert("a", erased("x"), clock.now(), Some(Duration::from_millis(1)));
        manual.advance(Duration::from_secs(60));
        tokio::task::yield_now().await;

        let entry = store.get("a").expect("entry kept");
        assert!(entry.is_expired(clock.now()));
        assert_eq!(entry.data::<&str>(), Some(&"x"));
    }

    #[test]
    fn wrong_type_reads_as_missing() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let store = Arc::new(CacheStore::new(clock.clone()));
        store.insert("a", erased(1_u32), clock.now(), None);

        assert_eq!(store.get_data::<String>("a"), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys(), vec!["a".to_string()]);
        assert!(store.remove("a").is_some());
        assert_eq!(store.len(), 0);
    }
}
