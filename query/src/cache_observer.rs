slotmap::new_key_type! {
    /// Handle returned by [`QueryCache::register_cache_observer`](crate::QueryCache::register_cache_observer).
    pub struct CacheObserverKey;
}

/// Subscribing to cache events.
pub trait CacheObserver: Send + Sync {
    /// Receive a cache event.
    fn process_cache_event(&self, event: &CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn process_cache_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// The events that can be observed from the query cache.
/// Each carries the normalized key of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A query was registered.
    Created(String),
    /// Data for a key was written.
    Updated(String),
    /// A query was marked stale.
    Invalidated(String),
    /// A query was removed from the cache.
    Removed(String),
}

impl CacheEvent {
    /// The key this event refers to.
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Created(key)
            | CacheEvent::Updated(key)
            | CacheEvent::Invalidated(key)
            | CacheEvent::Removed(key) => key,
        }
    }
}
