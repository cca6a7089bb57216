use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use futures::{
    future::{join_all, BoxFuture, Shared},
    FutureExt, Stream, StreamExt,
};
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;
use tokio::task::AbortHandle;

use crate::{
    cache_observer::{CacheEvent, CacheObserver, CacheObserverKey},
    cache_store::{CacheEntry, CacheStore, ErasedValue},
    clock::SharedClock,
    lifecycle::RefetchTrigger,
    query::{boxed_fetcher, Fetcher},
    query_persister::PersistedQuery,
    retry::{self, RetryError},
    util, AppLifecycle, BoxError, CancelToken, FetchStatus, MutationQueue, MutationQueueConfig,
    Query, QueryConfig, QueryError, QueryKey, QueryOptions, QueryPersister, QueryResult,
    QueryStatus, QueryValue, SystemClock,
};

/// Settings shared by every query of a [`QueryCache`].
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// Base configuration that per-query [`QueryOptions`] are merged onto.
    pub default_config: QueryConfig,
    /// Initial network state.
    pub online: bool,
    /// Version written into, and expected from, persisted entries.
    pub persist_version: u32,
    /// Replay policy of the offline mutation queue.
    pub mutation_queue: MutationQueueConfig,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            default_config: QueryConfig::default(),
            online: true,
            persist_version: 1,
            mutation_queue: MutationQueueConfig::default(),
        }
    }
}

/// Counters describing the cache at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Registered queries.
    pub total_queries: usize,
    /// Values held by the store, including those without a registered query.
    pub cached_entries: usize,
    /// Registered queries whose data is stale.
    pub stale_queries: usize,
    /// Registered queries with a request in flight.
    pub fetching_queries: usize,
    /// Registered queries whose last attempt failed.
    pub error_queries: usize,
    /// Keys with a deduplicated fetch in progress.
    pub pending_fetches: usize,
    /// Jobs waiting in the offline mutation queue.
    pub queued_mutations: usize,
}

/// What the cache needs to know about any registered query, whatever its value type.
pub(crate) trait CachedQuery: Send + Sync + 'static {
    fn key(&self) -> &str;
    fn scope(&self) -> Option<&str>;
    fn id(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn cache_time(&self) -> Option<Duration>;
    fn snapshot(&self) -> QuerySnapshot;
    fn invalidate(&self) -> bool;
    fn force_fetch(&self) -> BoxFuture<'static, QueryResult<()>>;
    fn cancel(&self) -> bool;
    fn dispose(&self);
    fn hydrate(&self) -> BoxFuture<'static, QueryResult<bool>>;
    fn dehydrate(&self, version: u32) -> Option<QueryResult<PersistedQuery>>;

    fn on_app_lifecycle(&self, _lifecycle: AppLifecycle) {}

    /// Stale or errored, not loading, enabled and configured for `trigger`.
    fn wants_refetch(&self, trigger: RefetchTrigger) -> bool {
        let snapshot = self.snapshot();
        let configured = match trigger {
            RefetchTrigger::Reconnect => snapshot.refetch_on_reconnect,
            RefetchTrigger::Focus => snapshot.refetch_on_focus,
        };
        configured
            && snapshot.enabled
            && snapshot.status != QueryStatus::Loading
            && (snapshot.is_stale || snapshot.status == QueryStatus::Error)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QuerySnapshot {
    pub(crate) status: QueryStatus,
    pub(crate) fetch_status: FetchStatus,
    pub(crate) is_stale: bool,
    pub(crate) enabled: bool,
    pub(crate) refetch_on_focus: bool,
    pub(crate) refetch_on_reconnect: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Result<ErasedValue, QueryError>>>;

struct PendingFetch {
    id: u64,
    future: SharedFetch,
}

/// Registry of queries and their cached values.
///
/// A cache is a cheap handle: clones share the same registry. Build one per
/// application (or per test) and hand it to whatever needs data.
///
/// Queries can be:
/// - [Created or retrieved](Self::query) by key.
/// - [Prefetched](Self::prefetch) before anything reads them.
/// - [Invalidated](Self::invalidate_queries), which marks them stale without refetching.
/// - [Refetched](Self::refetch_queries) in bulk.
/// - [Manually updated](Self::set_query_data).
/// - [Introspected](Self::get_cached_data) without subscribing.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: QueryCacheConfig,
    clock: SharedClock,
    store: Arc<CacheStore>,
    queries: RwLock<HashMap<String, Arc<dyn CachedQuery>>>,
    pending: Mutex<HashMap<String, PendingFetch>>,
    next_fetch_id: AtomicU64,
    observers: Mutex<SlotMap<CacheObserverKey, Arc<dyn CacheObserver>>>,
    persister: Option<Arc<dyn QueryPersister>>,
    // Keys whose stored entry is being deleted, by delete id.
    pending_deletes: Mutex<HashMap<String, u64>>,
    // Live scope handles, by scope id.
    scope_handles: Mutex<HashMap<String, usize>>,
    online: AtomicBool,
    lifecycle: Mutex<AppLifecycle>,
    mutation_queue: MutationQueue,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Non-owning handle held by queries.
#[derive(Clone)]
pub(crate) struct WeakQueryCache(Weak<CacheInner>);

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|inner| QueryCache { inner })
    }
}

/// Builds a [`QueryCache`].
#[derive(Default)]
pub struct QueryCacheBuilder {
    config: QueryCacheConfig,
    clock: Option<SharedClock>,
    persister: Option<Arc<dyn QueryPersister>>,
}

impl QueryCacheBuilder {
    /// Sets the cache wide configuration.
    pub fn config(mut self, config: QueryCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the [`SystemClock`].
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Storage for persisted queries and the mutation queue.
    pub fn persister(mut self, persister: Arc<dyn QueryPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Creates the cache.
    pub fn build(self) -> QueryCache {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mutation_queue = MutationQueue::new(
            self.config.mutation_queue.clone(),
            self.persister.clone(),
            clock.clone(),
        );
        QueryCache {
            inner: Arc::new(CacheInner {
                store: Arc::new(CacheStore::new(clock.clone())),
                clock,
                queries: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
                observers: Mutex::new(SlotMap::with_key()),
                persister: self.persister,
                pending_deletes: Mutex::new(HashMap::new()),
                scope_handles: Mutex::new(HashMap::new()),
                online: AtomicBool::new(self.config.online),
                lifecycle: Mutex::new(AppLifecycle::Foreground),
                mutation_queue,
                tasks: Mutex::new(Vec::new()),
                config: self.config,
            }),
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// Creates a cache with the default configuration and the system clock.
    pub fn new() -> Self {
        QueryCacheBuilder::default().build()
    }

    /// Starts building a cache.
    pub fn builder() -> QueryCacheBuilder {
        QueryCacheBuilder::default()
    }

    /// Returns the query registered under `key`, or creates one with `fetcher`.
    ///
    /// When the key is already registered, `fetcher` and `options` are ignored.
    /// A key registered with another value type yields [`QueryError::TypeMismatch`].
    ///
    /// Example:
    /// ```
    /// use zen_query::*;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), QueryError> {
    /// let cache = QueryCache::new();
    /// let todos = cache.query(
    ///     &("todos", 1),
    ///     |_token| async { Ok::<_, BoxError>(vec!["buy milk".to_string()]) },
    ///     QueryOptions::default(),
    /// )?;
    /// assert_eq!(todos.fetch(false).await?, vec!["buy milk".to_string()]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn query<K, T, F, Fu>(
        &self,
        key: &K,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> QueryResult<Query<T>>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
        F: Fn(CancelToken) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.query_in_scope(None, crate::normalize(key), boxed_fetcher(fetcher), options)
    }

    pub(crate) fn query_in_scope<T>(
        &self,
        scope: Option<&str>,
        key: String,
        fetcher: Fetcher<T>,
        options: QueryOptions<T>,
    ) -> QueryResult<Query<T>>
    where
        T: QueryValue,
    {
        self.get_or_insert(&key, || {
            Query::new(self, key.clone(), scope.map(str::to_string), fetcher, options)
        })
    }

    /// Registered query for `key`, if it holds values of type `T`.
    pub fn get_query<K, T>(&self, key: &K) -> Option<Query<T>>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
    {
        self.registered::<Query<T>>(&crate::normalize(key))
            .ok()
            .flatten()
    }

    /// Fetches `key` ahead of time so a later [`query`](Self::query) starts with data.
    ///
    /// A registered query is fetched through its own fetcher; otherwise `fetcher`
    /// runs with the default retry policy and its result is cached with the default
    /// `cache_time`. Fresh data is not fetched again.
    pub async fn prefetch<K, T, F, Fu>(&self, key: &K, fetcher: F) -> QueryResult<()>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
        F: Fn(CancelToken) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let key = crate::normalize(key);
        if let Some(query) = self.registered::<Query<T>>(&key)? {
            return query.fetch(false).await.map(|_| ());
        }

        let config = self.inner.config.default_config.clone();
        if let Some((_, fetched_at)) = self.cached_entry::<T>(&key) {
            let age = self.inner.clock.now().saturating_duration_since(fetched_at);
            if age <= config.stale_time {
                return Ok(());
            }
        }

        let cache = self.clone();
        let owned_key = key.clone();
        self.deduplicate_fetch(&key, move || async move {
            let token = CancelToken::new();
            let result = retry::run_with_retry(
                &config.retry_policy(),
                &*cache.inner.clock,
                &token,
                &owned_key,
                || fetcher(token.clone()),
            )
            .await;
            match result {
                Ok(data) => {
                    let now = cache.inner.clock.now();
                    cache.update_cache(&owned_key, Arc::new(data.clone()), now);
                    cache.notify(CacheEvent::Updated(owned_key));
                    Ok(data)
                }
                Err(RetryError::Exhausted(error)) => Err(QueryError::fetch_failed(error)),
                Err(RetryError::Cancelled) => Err(QueryError::Cancelled { reason: None }),
            }
        })
        .await
        .map(|_: T| ())
    }

    /// Cached value for `key`, falling back to the registered query's data.
    pub fn get_cached_data<K, T>(&self, key: &K) -> Option<T>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
    {
        let key = crate::normalize(key);
        self.inner
            .store
            .get_data::<T>(&key)
            .or_else(|| self.registered::<Query<T>>(&key).ok()??.data())
    }

    /// The raw entry for `key`, with its write time and lifetime.
    pub fn get_cache_entry<K>(&self, key: &K) -> Option<CacheEntry>
    where
        K: QueryKey + ?Sized,
    {
        self.inner.store.get(&crate::normalize(key))
    }

    /// Writes `data` for `key`, through the registered query when there is one.
    pub fn set_query_data<K, T>(&self, key: &K, data: T) -> QueryResult<()>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
    {
        let key = crate::normalize(key);
        match self.registered::<Query<T>>(&key)? {
            Some(query) => query.set_data(data),
            None => {
                self.update_cache(&key, Arc::new(data), self.inner.clock.now());
                self.notify(CacheEvent::Updated(key));
                Ok(())
            }
        }
    }

    /// Replaces the value for `key` with `update_fn(current)`.
    pub fn update_query_data<K, T>(
        &self,
        key: &K,
        update_fn: impl FnOnce(Option<T>) -> T,
    ) -> QueryResult<()>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
    {
        let current = self.get_cached_data::<K, T>(key);
        self.set_query_data(key, update_fn(current))
    }

    /// Drops the value for `key` while keeping the registered query, which
    /// becomes idle.
    ///
    /// Returns true if there was a value.
    pub fn clear_query_data<K, T>(&self, key: &K) -> QueryResult<bool>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
    {
        let key = crate::normalize(key);
        let query = self.registered::<Query<T>>(&key)?;
        let mut cleared = self.inner.store.remove(&key).is_some();
        if let Some(query) = query {
            cleared |= query.data().is_some();
            query.clear_data()?;
        }
        self.forget_persisted(&key);
        if cleared {
            self.notify(CacheEvent::Updated(key));
        }
        Ok(cleared)
    }

    /// Disposes the query registered under `key` and drops its cached value,
    /// including the stored copy.
    ///
    /// Returns true if there was anything to remove.
    pub fn remove_query<K>(&self, key: &K) -> bool
    where
        K: QueryKey + ?Sized,
    {
        let key = crate::normalize(key);
        self.remove_normalized(&key)
    }

    /// Marks the query stale. It is refetched on next use.
    ///
    /// Returns true if a query was registered under `key`.
    pub fn invalidate_query<K>(&self, key: &K) -> bool
    where
        K: QueryKey + ?Sized,
    {
        let key = crate::normalize(key);
        let query = self.inner.queries.read().get(&key).cloned();
        query.is_some_and(|query| query.invalidate())
    }

    /// Marks every query whose key matches `predicate` stale.
    ///
    /// Returns the number of invalidated queries.
    pub fn invalidate_queries(&self, predicate: impl Fn(&str) -> bool) -> usize {
        self.registered_matching(|query| predicate(query.key()))
            .iter()
            .filter(|query| query.invalidate())
            .count()
    }

    /// Marks every query stale.
    pub fn invalidate_all(&self) -> usize {
        self.invalidate_queries(|_| true)
    }

    /// Force fetches the query under `key`. Failures are logged.
    ///
    /// Returns true if the refetch succeeded.
    pub async fn refetch_query<K>(&self, key: &K) -> bool
    where
        K: QueryKey + ?Sized,
    {
        let key = crate::normalize(key);
        let query = self.inner.queries.read().get(&key).cloned();
        match query {
            Some(query) => refetch_all(vec![query], "refetch").await == 1,
            None => false,
        }
    }

    /// Force fetches every query whose key matches `predicate`.
    ///
    /// Failures are logged per query and never abort the batch. Returns the
    /// number of successful refetches.
    pub async fn refetch_queries(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let queries = self.registered_matching(|query| predicate(query.key()));
        refetch_all(queries, "refetch").await
    }

    /// Marks every query of `scope` stale.
    pub fn invalidate_scope(&self, scope: &str) -> usize {
        self.registered_matching(|query| query.scope() == Some(scope))
            .iter()
            .filter(|query| query.invalidate())
            .count()
    }

    /// Force fetches every query of `scope`.
    pub async fn refetch_scope(&self, scope: &str) -> usize {
        let queries = self.registered_matching(|query| query.scope() == Some(scope));
        refetch_all(queries, "scope refetch").await
    }

    /// Disposes and removes every query of `scope`.
    pub fn clear_scope(&self, scope: &str) -> usize {
        let queries = self.registered_matching(|query| query.scope() == Some(scope));
        for query in &queries {
            self.remove_normalized(query.key());
        }
        tracing::debug!(scope, cleared = queries.len(), "scope cleared");
        queries.len()
    }

    pub(crate) fn acquire_scope(&self, scope: &str) {
        *self
            .inner
            .scope_handles
            .lock()
            .entry(scope.to_string())
            .or_insert(0) += 1;
    }

    /// Returns the number of handles still open for `scope`.
    pub(crate) fn release_scope(&self, scope: &str) -> usize {
        let mut handles = self.inner.scope_handles.lock();
        let Some(count) = handles.get_mut(scope) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let left = *count;
        if left == 0 {
            handles.remove(scope);
        }
        left
    }

    /// Cancels the in-flight attempt of the query under `key`.
    pub fn cancel_query<K>(&self, key: &K) -> bool
    where
        K: QueryKey + ?Sized,
    {
        let key = crate::normalize(key);
        let query = self.inner.queries.read().get(&key).cloned();
        query.is_some_and(|query| query.cancel())
    }

    /// Counters for the whole cache.
    pub fn get_stats(&self) -> CacheStats {
        let snapshots = self
            .registered_matching(|_| true)
            .iter()
            .map(|query| query.snapshot())
            .collect::<Vec<_>>();
        CacheStats {
            total_queries: snapshots.len(),
            cached_entries: self.inner.store.len(),
            stale_queries: snapshots.iter().filter(|s| s.is_stale).count(),
            fetching_queries: snapshots
                .iter()
                .filter(|s| s.fetch_status == FetchStatus::Fetching)
                .count(),
            error_queries: snapshots
                .iter()
                .filter(|s| s.status == QueryStatus::Error)
                .count(),
            pending_fetches: self.inner.pending.lock().len(),
            queued_mutations: self.inner.mutation_queue.len(),
        }
    }

    /// Keys of every registered query.
    pub fn keys(&self) -> Vec<String> {
        self.inner.queries.read().keys().cloned().collect()
    }

    /// Registers an observer of cache events.
    pub fn register_cache_observer(
        &self,
        observer: impl CacheObserver + 'static,
    ) -> CacheObserverKey {
        self.inner.observers.lock().insert(Arc::new(observer))
    }

    /// Removes an observer.
    pub fn unregister_cache_observer(&self, key: CacheObserverKey) -> bool {
        self.inner.observers.lock().remove(key).is_some()
    }

    /// Restores persisted data of every persisting query and the mutation queue.
    ///
    /// Returns the number of restored queries.
    pub async fn hydrate(&self) -> usize {
        if let Err(error) = self.inner.mutation_queue.restore().await {
            tracing::warn!(%error, "failed to restore mutation queue");
        }
        let queries = self.registered_matching(|_| true);
        let results = join_all(queries.iter().map(|query| query.hydrate())).await;
        results
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count()
    }

    /// Writes the data of every persisting query to storage.
    ///
    /// Returns the number of written entries.
    pub async fn dehydrate(&self) -> usize {
        let Some(persister) = self.persister() else {
            return 0;
        };
        let version = self.persist_version();
        let mut written = 0;
        for query in self.registered_matching(|_| true) {
            let entry = match query.dehydrate(version) {
                Some(Ok(entry)) => entry,
                Some(Err(error)) => {
                    tracing::warn!(key = query.key(), %error, "failed to encode query");
                    continue;
                }
                None => continue,
            };
            self.remember_persisted(query.key());
            match persister.write(query.key(), entry).await {
                Ok(()) => written += 1,
                Err(error) => tracing::warn!(key = query.key(), %error, "failed to persist query"),
            }
        }
        written
    }

    /// Reports network availability. Coming back online refetches stale queries
    /// and replays the mutation queue in the background.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            tracing::debug!("network reconnected");
            let cache = self.clone();
            util::spawn(async move {
                cache.handle_reconnect().await;
            });
        }
    }

    /// Current network availability.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Refetches queries configured for reconnect, then replays queued mutations.
    ///
    /// Returns the number of successful refetches.
    pub async fn handle_reconnect(&self) -> usize {
        let refetched = self.sweep(RefetchTrigger::Reconnect).await;
        let report = self.inner.mutation_queue.replay().await;
        tracing::debug!(refetched, ?report, "reconnect handled");
        refetched
    }

    /// Reports the app lifecycle. Returning to the foreground refetches stale
    /// queries in the background; stream queries pause and resume.
    pub fn set_app_lifecycle(&self, lifecycle: AppLifecycle) {
        let previous = std::mem::replace(&mut *self.inner.lifecycle.lock(), lifecycle);
        if previous == lifecycle {
            return;
        }
        for query in self.registered_matching(|_| true) {
            query.on_app_lifecycle(lifecycle);
        }
        if lifecycle == AppLifecycle::Foreground {
            let cache = self.clone();
            util::spawn(async move {
                cache.handle_focus().await;
            });
        }
    }

    /// Last reported app lifecycle.
    pub fn app_lifecycle(&self) -> AppLifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Refetches queries configured for focus.
    pub async fn handle_focus(&self) -> usize {
        self.sweep(RefetchTrigger::Focus).await
    }

    /// Follows a stream of network availability until it ends or the cache is dropped.
    pub fn bind_network<S>(&self, signal: S) -> QueryResult<()>
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        let weak = self.downgrade();
        self.spawn_binding(async move {
            let mut signal = pin!(signal);
            while let Some(online) = signal.next().await {
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.set_online(online);
            }
        })
    }

    /// Follows a stream of app lifecycle changes until it ends or the cache is dropped.
    pub fn bind_app_lifecycle<S>(&self, signal: S) -> QueryResult<()>
    where
        S: Stream<Item = AppLifecycle> + Send + 'static,
    {
        let weak = self.downgrade();
        self.spawn_binding(async move {
            let mut signal = pin!(signal);
            while let Some(lifecycle) = signal.next().await {
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.set_app_lifecycle(lifecycle);
            }
        })
    }

    /// The offline mutation queue.
    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.inner.mutation_queue
    }

    /// Disposes every query and drops every cached value, including the
    /// stored copies. Queued mutations are kept.
    pub fn clear(&self) {
        let queries = std::mem::take(&mut *self.inner.queries.write());
        self.inner.pending.lock().clear();
        for query in queries.values() {
            query.dispose();
        }
        let mut stored = self.inner.store.keys();
        stored.extend(queries.keys().cloned());
        stored.sort_unstable();
        stored.dedup();
        for key in &stored {
            self.forget_persisted(key);
        }
        self.inner.store.clear();
        for key in queries.into_keys() {
            self.notify(CacheEvent::Removed(key));
        }
    }

    pub(crate) fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Arc::downgrade(&self.inner))
    }

    pub(crate) fn clock(&self) -> SharedClock {
        self.inner.clock.clone()
    }

    pub(crate) fn default_config(&self) -> &QueryConfig {
        &self.inner.config.default_config
    }

    pub(crate) fn persister(&self) -> Option<Arc<dyn QueryPersister>> {
        self.inner.persister.clone()
    }

    pub(crate) fn persist_version(&self) -> u32 {
        self.inner.config.persist_version
    }

    pub(crate) fn cached_entry<T: Clone + 'static>(&self, key: &str) -> Option<(T, Instant)> {
        let entry = self.inner.store.get(key)?;
        let data = entry.data::<T>()?.clone();
        Some((data, entry.timestamp))
    }

    /// Returns the registered `Q` under `key`, creating it with `create` when absent.
    pub(crate) fn get_or_insert<Q>(&self, key: &str, create: impl FnOnce() -> Q) -> QueryResult<Q>
    where
        Q: CachedQuery + Clone,
    {
        let created = {
            let mut queries = self.inner.queries.write();
            if let Some(existing) = queries.get(key) {
                return existing
                    .as_any()
                    .downcast_ref::<Q>()
                    .cloned()
                    .ok_or_else(|| QueryError::TypeMismatch(key.to_string()));
            }
            let query = create();
            queries.insert(key.to_string(), Arc::new(query.clone()));
            query
        };
        tracing::debug!(key, "query registered");
        self.notify(CacheEvent::Created(key.to_string()));
        Ok(created)
    }

    /// The registered `Q` under `key`. Another query type is a mismatch.
    pub(crate) fn registered<Q>(&self, key: &str) -> QueryResult<Option<Q>>
    where
        Q: CachedQuery + Clone,
    {
        let query = self.inner.queries.read().get(key).cloned();
        match query {
            Some(query) => query
                .as_any()
                .downcast_ref::<Q>()
                .cloned()
                .map(Some)
                .ok_or_else(|| QueryError::TypeMismatch(key.to_string())),
            None => Ok(None),
        }
    }

    /// Removes `key` from the registry if it still maps to the query `id`.
    pub(crate) fn unregister(&self, key: &str, id: usize) {
        let removed = {
            let mut queries = self.inner.queries.write();
            if queries.get(key).is_some_and(|query| query.id() == id) {
                queries.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            self.notify(CacheEvent::Removed(key.to_string()));
        }
    }

    /// Joins the pending fetch for `key`, or starts `fetch_fn` and shares it.
    ///
    /// The pending entry is removed when the fetch settles, before any caller
    /// observes the result.
    pub(crate) async fn deduplicate_fetch<T, F, Fu>(&self, key: &str, fetch_fn: F) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fu + Send + 'static,
        Fu: Future<Output = QueryResult<T>> + Send + 'static,
    {
        let future = {
            let mut pending = self.inner.pending.lock();
            match pending.get(key) {
                Some(existing) => existing.future.clone(),
                None => {
                    let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                    let weak = Arc::downgrade(&self.inner);
                    let owned_key = key.to_string();
                    let future = async move {
                        let result = fetch_fn()
                            .await
                            .map(|value| Arc::new(value) as ErasedValue);
                        if let Some(inner) = weak.upgrade() {
                            let mut pending = inner.pending.lock();
                            if pending.get(&owned_key).is_some_and(|entry| entry.id == id) {
                                pending.remove(&owned_key);
                            }
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        key.to_string(),
                        PendingFetch {
                            id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        let value = future.await?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| QueryError::TypeMismatch(key.to_string()))
    }

    /// Lets the next fetch of `key` start a new attempt instead of joining.
    pub(crate) fn forget_pending(&self, key: &str) {
        self.inner.pending.lock().remove(key);
    }

    /// Replaces the entry for `key`, with the registered query's `cache_time`
    /// or the default one.
    pub(crate) fn update_cache(&self, key: &str, data: ErasedValue, timestamp: Instant) {
        let registered = self.inner.queries.read().get(key).map(|query| query.cache_time());
        let ttl = registered.unwrap_or(self.inner.config.default_config.cache_time);
        self.inner.store.insert(key, data, timestamp, ttl);
    }

    pub(crate) fn notify(&self, event: CacheEvent) {
        let observers = self
            .inner
            .observers
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for observer in observers {
            observer.process_cache_event(&event);
        }
    }

    /// Deletes the stored copy of `key` in the background. Until the delete
    /// has run, hydration treats the key as missing. A later write of the key
    /// supersedes the delete.
    pub(crate) fn forget_persisted(&self, key: &str) {
        let Some(persister) = self.persister() else {
            return;
        };
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending_deletes.lock().insert(key.to_string(), id);

        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let task = async move {
            let still_wanted = weak
                .upgrade()
                .is_some_and(|inner| inner.pending_deletes.lock().get(&owned_key) == Some(&id));
            if !still_wanted {
                return;
            }
            if let Err(error) = persister.delete(&owned_key).await {
                tracing::warn!(key = %owned_key, %error, "failed to delete persisted query");
            }
            if let Some(inner) = weak.upgrade() {
                let mut pending = inner.pending_deletes.lock();
                if pending.get(&owned_key) == Some(&id) {
                    pending.remove(&owned_key);
                }
            }
        };
        if util::spawn(task).is_none() {
            tracing::debug!(key, "no runtime, persisted query left for a later delete");
        }
    }

    /// Whether the stored copy of `key` is being deleted.
    pub(crate) fn is_forgotten(&self, key: &str) -> bool {
        self.inner.pending_deletes.lock().contains_key(key)
    }

    /// Called before writing `key` to storage.
    pub(crate) fn remember_persisted(&self, key: &str) {
        self.inner.pending_deletes.lock().remove(key);
    }

    fn remove_normalized(&self, key: &str) -> bool {
        let query = self.inner.queries.write().remove(key);
        let had_entry = self.inner.store.remove(key).is_some();
        self.forget_pending(key);
        self.forget_persisted(key);
        if let Some(query) = &query {
            query.dispose();
        }
        let removed = query.is_some() || had_entry;
        if removed {
            tracing::debug!(key, "query removed");
            self.notify(CacheEvent::Removed(key.to_string()));
        }
        removed
    }

    fn registered_matching(
        &self,
        predicate: impl Fn(&dyn CachedQuery) -> bool,
    ) -> Vec<Arc<dyn CachedQuery>> {
        let queries = self
            .inner
            .queries
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        queries
            .into_iter()
            .filter(|query| predicate(query.as_ref()))
            .collect()
    }

    async fn sweep(&self, trigger: RefetchTrigger) -> usize {
        let queries = self.registered_matching(|query| query.wants_refetch(trigger));
        let label = match trigger {
            RefetchTrigger::Reconnect => "reconnect refetch",
            RefetchTrigger::Focus => "focus refetch",
        };
        refetch_all(queries, label).await
    }

    fn spawn_binding(&self, task: impl Future<Output = ()> + Send + 'static) -> QueryResult<()> {
        let handle = util::spawn(task).ok_or(QueryError::NoRuntime)?;
        self.inner.tasks.lock().push(handle);
        Ok(())
    }
}

async fn refetch_all(queries: Vec<Arc<dyn CachedQuery>>, label: &str) -> usize {
    let results = join_all(queries.iter().map(|query| query.force_fetch())).await;
    let mut succeeded = 0;
    for (query, result) in queries.iter().zip(results) {
        match result {
            Ok(()) => succeeded += 1,
            Err(error) => tracing::warn!(key = query.key(), %error, "{label} failed"),
        }
    }
    succeeded
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.inner.queries.read().len())
            .field("entries", &self.inner.store.len())
            .field("online", &self.is_online())
            .finish()
    }
}
