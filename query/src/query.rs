use std::{
    any::Any,
    fmt::Debug,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::AbortHandle;

use crate::{
    cache_observer::CacheEvent,
    clock::{instant_from_unix, unix_from_instant, SharedClock},
    query_cache::{CachedQuery, QuerySnapshot, WeakQueryCache},
    query_persister::{self, PersistedQuery},
    retry::{self, RetryError},
    util, BoxError, CancelToken, FetchStatus, ListenerKey, Observable, QueryCache, QueryConfig,
    QueryError, QueryOptions, QueryResult, QueryState, QueryStatus,
};

/// Convenience trait alias for values a query can hold.
pub trait QueryValue: Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<V> QueryValue for V where V: Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

pub(crate) type Fetcher<T> =
    Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

pub(crate) fn boxed_fetcher<T, F, Fu>(fetcher: F) -> Fetcher<T>
where
    F: Fn(CancelToken) -> Fu + Send + Sync + 'static,
    Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move |token: CancelToken| fetcher(token).boxed())
}

/// A wrapper that keeps its own state in step with the query's data.
pub(crate) trait QueryOwner<T>: Send + Sync {
    /// A full attempt is about to replace the data.
    fn attempt_started(&self);
    /// New data was committed, fetched or restored.
    fn data_committed(&self, data: &T);
}

/// A keyed, cached piece of remote data.
///
/// Obtained from [`QueryCache::query`]. Clones share the same state.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

struct QueryInner<T> {
    key: String,
    scope: Option<String>,
    cache: WeakQueryCache,
    clock: SharedClock,
    fetcher: Fetcher<T>,
    config: QueryConfig,
    initial_data: Option<T>,
    state: Observable<QueryState<T>>,
    current: Mutex<Option<InFlight>>,
    enabled: AtomicBool,
    hydrated: AtomicBool,
    disposed: AtomicBool,
    refetch_timer: Mutex<Option<AbortHandle>>,
    owner: Mutex<Option<Weak<dyn QueryOwner<T>>>>,
}

/// The attempt allowed to commit.
struct InFlight {
    token: CancelToken,
    // Restored by an explicit cancel.
    previous_status: QueryStatus,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for QueryInner<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.refetch_timer.get_mut().take() {
            timer.abort();
        }
    }
}

impl<T> Query<T>
where
    T: QueryValue,
{
    pub(crate) fn new(
        cache: &QueryCache,
        key: String,
        scope: Option<String>,
        fetcher: Fetcher<T>,
        options: QueryOptions<T>,
    ) -> Self {
        let config = cache.default_config().merge(&options).validate();
        let initial_data = options.initial_data;

        // Data written before the query existed (prefetch, set_query_data) seeds the state.
        let state = match cache.cached_entry::<T>(&key) {
            Some((data, timestamp)) => QueryState {
                status: QueryStatus::Success,
                data: Some(data),
                last_fetch_time: Some(timestamp),
                ..QueryState::default()
            },
            None => QueryState::new(initial_data.clone()),
        };

        Query {
            inner: Arc::new(QueryInner {
                key,
                scope,
                cache: cache.downgrade(),
                clock: cache.clock(),
                fetcher,
                enabled: AtomicBool::new(config.enabled),
                config,
                initial_data,
                state: Observable::new(state),
                current: Mutex::new(None),
                hydrated: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                refetch_timer: Mutex::new(None),
                owner: Mutex::new(None),
            }),
        }
    }

    /// Normalized key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Scope the query was registered in.
    pub fn scope(&self) -> Option<&str> {
        self.inner.scope.as_deref()
    }

    /// Resolved configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Snapshot of the state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.get()
    }

    /// Latest data.
    pub fn data(&self) -> Option<T> {
        self.inner.state.with(|state| state.data.clone())
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.inner.state.with(|state| state.status)
    }

    /// Error of the last settled attempt.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.with(|state| state.error.clone())
    }

    /// Whether the data is older than `stale_time`, or was invalidated.
    pub fn is_stale(&self) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .state
            .with(|state| state.is_stale(now, self.inner.config.stale_time))
    }

    /// A request is in flight.
    pub fn is_fetching(&self) -> bool {
        self.inner.state.with(|state| state.is_fetching())
    }

    /// The observable container backing this query.
    pub fn observe(&self) -> Observable<QueryState<T>> {
        self.inner.state.clone()
    }

    /// Calls `listener` after every state change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryState<T>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.state.add_listener(listener)
    }

    /// Removes a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.state.remove_listener(key)
    }

    /// Whether automatic refetches (mount, focus, reconnect, interval) apply.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables automatic refetches.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Returns fresh data without calling the fetcher, joins a pending fetch,
    /// or starts a new attempt.
    ///
    /// `force` skips the freshness check. A cancelled attempt resolves with the
    /// previous data when there is some, otherwise with [`QueryError::Cancelled`].
    pub async fn fetch(&self, force: bool) -> QueryResult<T> {
        self.ensure_active()?;
        if self.inner.config.persist && !self.inner.hydrated.load(Ordering::Acquire) {
            self.hydrate().await?;
        }
        self.ensure_refetch_interval();

        if !force {
            if let Some(data) = self.fresh_data() {
                return Ok(data);
            }
        }

        let cache = self.cache()?;
        let query = self.clone();
        let started = Arc::new(AtomicBool::new(false));
        let owner = started.clone();
        let result = cache
            .deduplicate_fetch(&self.inner.key, move || {
                owner.store(true, Ordering::Release);
                query.run_attempt()
            })
            .await;
        if started.load(Ordering::Acquire) {
            result
        } else {
            self.adopt_joined(&cache, result).await
        }
    }

    /// Cancels the in-flight attempt, if any, and starts a new one.
    pub async fn refetch(&self) -> QueryResult<T> {
        self.ensure_active()?;
        self.cache()?.forget_pending(&self.inner.key);
        self.fetch(true).await
    }

    /// Cancels the in-flight attempt and restores the status it replaced.
    ///
    /// Returns false when nothing was in flight.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut current = self.inner.current.lock();
            match current.take() {
                Some(in_flight) => {
                    in_flight.token.cancel("cancelled");
                    self.inner.state.update_quiet(|state| {
                        state.status = in_flight.previous_status;
                        state.fetch_status = FetchStatus::Idle;
                    });
                    true
                }
                None => false,
            }
        };
        if cancelled {
            tracing::debug!(key = %self.inner.key, "query cancelled");
            if let Ok(cache) = self.cache() {
                cache.forget_pending(&self.inner.key);
            }
            self.inner.state.notify();
        }
        cancelled
    }

    /// Overrides the data. An idle query becomes successful. The data counts as just fetched.
    pub fn set_data(&self, data: T) -> QueryResult<()> {
        self.ensure_active()?;
        let now = self.inner.clock.now();
        self.inner.state.update(|state| {
            state.data = Some(data.clone());
            if state.is_idle() {
                state.status = QueryStatus::Success;
            }
            state.last_fetch_time = Some(now);
        });
        self.write_through(&data, now);
        if self.inner.config.persist {
            let query = self.clone();
            util::spawn(async move { query.write_persisted(&data, now).await });
        }
        Ok(())
    }

    /// Marks the data stale. Status and data are untouched.
    pub fn invalidate(&self) -> QueryResult<()> {
        self.ensure_active()?;
        self.inner.state.update(|state| state.last_fetch_time = None);
        if let Ok(cache) = self.cache() {
            cache.notify(CacheEvent::Invalidated(self.inner.key.clone()));
        }
        Ok(())
    }

    /// Drops the data without touching a fetch in progress. The query becomes idle.
    pub(crate) fn clear_data(&self) -> QueryResult<()> {
        self.ensure_active()?;
        self.inner.state.update(|state| {
            state.data = None;
            state.status = QueryStatus::Idle;
            state.last_fetch_time = None;
        });
        Ok(())
    }

    /// Cancels any pending fetch and restores the initial state.
    pub fn reset(&self) -> QueryResult<()> {
        self.ensure_active()?;
        {
            let mut current = self.inner.current.lock();
            if let Some(in_flight) = current.take() {
                in_flight.token.cancel("reset");
            }
            self.inner
                .state
                .update_quiet(|state| *state = QueryState::new(self.inner.initial_data.clone()));
        }
        if let Ok(cache) = self.cache() {
            cache.forget_pending(&self.inner.key);
        }
        self.inner.state.notify();
        Ok(())
    }

    /// Called when a consumer starts using the query.
    ///
    /// Fetches when there is no data yet, or when the data is stale and
    /// `refetch_on_mount` is set. Disabled queries only return what they have.
    pub async fn mount(&self) -> QueryResult<Option<T>> {
        self.ensure_active()?;
        self.ensure_refetch_interval();
        let has_data = self.inner.state.with(|state| state.data.is_some());
        let should_fetch = self.is_enabled()
            && (!has_data || (self.inner.config.refetch_on_mount && self.is_stale()));
        if should_fetch {
            self.fetch(false).await.map(Some)
        } else {
            Ok(self.data())
        }
    }

    /// Restores persisted data, when the query persists and nothing newer is known.
    ///
    /// Storage failures are logged and treated as a miss. Returns whether data was restored.
    pub async fn hydrate(&self) -> QueryResult<bool> {
        self.ensure_active()?;
        self.inner.hydrated.store(true, Ordering::Release);
        if !self.inner.config.persist {
            return Ok(false);
        }
        let cache = self.cache()?;
        let Some(persister) = cache.persister() else {
            return Ok(false);
        };
        let key = &self.inner.key;
        if cache.is_forgotten(key) {
            return Ok(false);
        }

        let entry = match persister.read(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(false),
            Err(error) => {
                tracing::warn!(key, %error, "failed to read persisted query");
                return Ok(false);
            }
        };
        let (data, timestamp) =
            match query_persister::decode::<T>(key, entry, cache.persist_version()) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::warn!(key, %error, "discarding persisted query");
                    return Ok(false);
                }
            };
        self.ensure_active()?;

        let fetched_at = instant_from_unix(&*self.inner.clock, timestamp);
        let restored = self.inner.state.update_if(|state| {
            if state.last_fetch_time.is_some_and(|known| known >= fetched_at) {
                return false;
            }
            state.data = Some(data.clone());
            state.last_fetch_time = Some(fetched_at);
            if state.is_idle() {
                state.status = QueryStatus::Success;
            }
            true
        });
        if restored {
            tracing::debug!(key, "query hydrated from storage");
            self.write_through(&data, fetched_at);
            if let Some(owner) = self.owner() {
                owner.data_committed(&data);
            }
        }
        Ok(restored)
    }

    /// Cancels pending work, stops timers, releases listeners and unregisters
    /// the query. Every later operation fails with [`QueryError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(in_flight) = self.inner.current.lock().take() {
            in_flight.token.cancel("disposed");
        }
        if let Some(timer) = self.inner.refetch_timer.lock().take() {
            timer.abort();
        }
        self.inner.state.clear_listeners();
        if let Ok(cache) = self.cache() {
            cache.forget_pending(&self.inner.key);
            cache.unregister(&self.inner.key, self.id());
        }
        tracing::debug!(key = %self.inner.key, "query disposed");
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn ensure_active(&self) -> QueryResult<()> {
        if self.is_disposed() {
            Err(QueryError::Disposed(self.inner.key.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn cache(&self) -> QueryResult<QueryCache> {
        self.inner
            .cache
            .upgrade()
            .ok_or_else(|| QueryError::Disposed(self.inner.key.clone()))
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn QueryOwner<T>>) {
        *self.inner.owner.lock() = Some(owner);
    }

    fn owner(&self) -> Option<Arc<dyn QueryOwner<T>>> {
        self.inner.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Writes committed data to the cache store and, when the query persists,
    /// to storage.
    pub(crate) async fn store_committed(&self, data: &T, fetched_at: Instant) {
        self.write_through(data, fetched_at);
        if self.inner.config.persist {
            self.write_persisted(data, fetched_at).await;
        }
    }

    fn fresh_data(&self) -> Option<T> {
        let now = self.inner.clock.now();
        self.inner.state.with(|state| {
            if state.is_stale(now, self.inner.config.stale_time) {
                None
            } else {
                state.data.clone()
            }
        })
    }

    /// Supersedes the previous attempt and moves to loading.
    fn begin_attempt(&self) -> CancelToken {
        let token = CancelToken::new();
        {
            let mut current = self.inner.current.lock();
            let superseded = current.take();
            let status = self.inner.state.update_quiet(|state| {
                let status = state.status;
                state.status = QueryStatus::Loading;
                state.fetch_status = FetchStatus::Fetching;
                state.error = None;
                status
            });
            let previous_status = match superseded {
                Some(previous) => {
                    previous.token.cancel("superseded");
                    previous.previous_status
                }
                None => status,
            };
            *current = Some(InFlight {
                token: token.clone(),
                previous_status,
            });
        }
        self.inner.state.notify();
        if let Some(owner) = self.owner() {
            owner.attempt_started();
        }
        token
    }

    async fn run_attempt(self) -> QueryResult<T> {
        let token = self.begin_attempt();
        let policy = self.inner.config.retry_policy();
        let fetcher = self.inner.fetcher.clone();
        let result = retry::run_with_retry(
            &policy,
            &*self.inner.clock,
            &token,
            &self.inner.key,
            || fetcher(token.clone()),
        )
        .await;

        match result {
            Ok(data) => self.commit_success(&token, data).await,
            Err(RetryError::Cancelled) => self.cancelled_outcome(&token),
            Err(RetryError::Exhausted(error)) => {
                self.commit_failure(&token, QueryError::fetch_failed(error))
            }
        }
    }

    /// Commits the outcome of a pending fetch started outside this query, such
    /// as a prefetch. An attempt of the query's own takes precedence.
    async fn adopt_joined(&self, cache: &QueryCache, result: QueryResult<T>) -> QueryResult<T> {
        let fetched_at = cache
            .cached_entry::<T>(&self.inner.key)
            .map_or_else(|| self.inner.clock.now(), |(_, timestamp)| timestamp);
        let adopted = {
            let current = self.inner.current.lock();
            current.is_none()
                && self.inner.state.update_quiet(|state| match &result {
                    Ok(data) => {
                        if state.last_fetch_time.is_some_and(|known| known > fetched_at) {
                            return false;
                        }
                        state.status = QueryStatus::Success;
                        state.data = Some(data.clone());
                        state.error = None;
                        state.last_fetch_time = Some(fetched_at);
                        true
                    }
                    Err(QueryError::Cancelled { .. }) => false,
                    Err(error) => {
                        state.status = QueryStatus::Error;
                        state.error = Some(error.clone());
                        true
                    }
                })
        };
        if adopted {
            self.inner.state.notify();
            if let Ok(data) = &result {
                if let Some(owner) = self.owner() {
                    owner.data_committed(data);
                }
                if self.inner.config.persist {
                    self.write_persisted(data, fetched_at).await;
                }
            }
        }
        result
    }

    /// Runs `commit` on the state if `token` still owns the query.
    fn commit_if_current(
        &self,
        token: &CancelToken,
        commit: impl FnOnce(&mut QueryState<T>),
    ) -> bool {
        let committed = {
            let mut current = self.inner.current.lock();
            let owns = current
                .as_ref()
                .is_some_and(|in_flight| in_flight.token.same_as(token))
                && !token.is_cancelled();
            if owns {
                *current = None;
                self.inner.state.update_quiet(commit);
            }
            owns
        };
        if committed {
            self.inner.state.notify();
        }
        committed
    }

    async fn commit_success(&self, token: &CancelToken, data: T) -> QueryResult<T> {
        let now = self.inner.clock.now();
        let committed = self.commit_if_current(token, |state| {
            state.status = QueryStatus::Success;
            state.fetch_status = FetchStatus::Idle;
            state.data = Some(data.clone());
            state.error = None;
            state.last_fetch_time = Some(now);
        });
        if !committed {
            return self.cancelled_outcome(token);
        }

        if let Some(owner) = self.owner() {
            owner.data_committed(&data);
        }
        self.store_committed(&data, now).await;
        Ok(data)
    }

    fn commit_failure(&self, token: &CancelToken, error: QueryError) -> QueryResult<T> {
        let committed = self.commit_if_current(token, |state| {
            state.status = QueryStatus::Error;
            state.fetch_status = FetchStatus::Idle;
            state.error = Some(error.clone());
        });
        if committed {
            tracing::debug!(key = %self.inner.key, %error, "query failed");
            Err(error)
        } else {
            self.cancelled_outcome(token)
        }
    }

    fn cancelled_outcome(&self, token: &CancelToken) -> QueryResult<T> {
        match self.data() {
            Some(data) => Ok(data),
            None => Err(QueryError::Cancelled {
                reason: token.reason(),
            }),
        }
    }

    fn write_through(&self, data: &T, timestamp: Instant) {
        if let Ok(cache) = self.cache() {
            cache.update_cache(&self.inner.key, Arc::new(data.clone()), timestamp);
            cache.notify(CacheEvent::Updated(self.inner.key.clone()));
        }
    }

    async fn write_persisted(&self, data: &T, fetched_at: Instant) {
        let Ok(cache) = self.cache() else {
            return;
        };
        let Some(persister) = cache.persister() else {
            return;
        };
        let key = &self.inner.key;
        let timestamp = unix_from_instant(&*self.inner.clock, fetched_at);
        let entry = match query_persister::encode(data, timestamp, cache.persist_version()) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(key, %error, "failed to encode query for storage");
                return;
            }
        };
        cache.remember_persisted(key);
        if let Err(error) = persister.write(key, entry).await {
            tracing::warn!(key, %error, "failed to persist query");
        }
    }

    fn ensure_refetch_interval(&self) {
        let Some(interval) = self.inner.config.refetch_interval else {
            return;
        };
        if self.inner.clock.is_virtual() {
            return;
        }
        let mut timer = self.inner.refetch_timer.lock();
        if timer.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let clock = self.inner.clock.clone();
        *timer = util::spawn(async move {
            loop {
                clock.sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let query = Query { inner };
                if query.is_disposed() {
                    break;
                }
                let eligible = query.is_enabled()
                    && query
                        .inner
                        .state
                        .with(|state| state.data.is_some() && !state.is_loading());
                if eligible {
                    if let Err(error) = query.fetch(true).await {
                        tracing::warn!(key = %query.inner.key, %error, "interval refetch failed");
                    }
                }
            }
        });
    }

    fn dehydrate_entry(&self, version: u32) -> Option<QueryResult<PersistedQuery>> {
        if !self.inner.config.persist {
            return None;
        }
        let (data, fetched_at) = self
            .inner
            .state
            .with(|state| Some((state.data.clone()?, state.last_fetch_time)))?;
        let fetched_at = fetched_at.unwrap_or_else(|| self.inner.clock.now());
        let timestamp = unix_from_instant(&*self.inner.clock, fetched_at);
        Some(query_persister::encode(&data, timestamp, version))
    }
}

impl<T> CachedQuery for Query<T>
where
    T: QueryValue,
{
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn scope(&self) -> Option<&str> {
        self.inner.scope.as_deref()
    }

    fn id(&self) -> usize {
        Query::id(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cache_time(&self) -> Option<Duration> {
        self.inner.config.cache_time
    }

    fn snapshot(&self) -> QuerySnapshot {
        let now = self.inner.clock.now();
        let config = &self.inner.config;
        self.inner.state.with(|state| QuerySnapshot {
            status: state.status,
            fetch_status: state.fetch_status,
            is_stale: state.is_stale(now, config.stale_time),
            enabled: self.is_enabled(),
            refetch_on_focus: config.refetch_on_focus,
            refetch_on_reconnect: config.refetch_on_reconnect,
        })
    }

    fn invalidate(&self) -> bool {
        Query::invalidate(self).is_ok()
    }

    fn force_fetch(&self) -> BoxFuture<'static, QueryResult<()>> {
        let query = self.clone();
        async move { query.fetch(true).await.map(|_| ()) }.boxed()
    }

    fn cancel(&self) -> bool {
        Query::cancel(self)
    }

    fn dispose(&self) {
        Query::dispose(self)
    }

    fn hydrate(&self) -> BoxFuture<'static, QueryResult<bool>> {
        let query = self.clone();
        async move { query.hydrate().await }.boxed()
    }

    fn dehydrate(&self, version: u32) -> Option<QueryResult<PersistedQuery>> {
        self.dehydrate_entry(version)
    }
}

impl<T> Debug for Query<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("scope", &self.inner.scope)
            .field("state", &self.inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::future::join_all;
    use futures_channel::oneshot;

    use super::*;
    use crate::{
        clock::Clock, query_persister::QueryPersister, ManualClock, MemoryPersister,
        QueryCacheConfig,
    };

    fn manual_cache() -> (QueryCache, ManualClock) {
        let clock = ManualClock::new();
        let config = QueryCacheConfig {
            default_config: QueryConfig::default()
                .with_retry_count(0)
                .with_jitter(false),
            ..QueryCacheConfig::default()
        };
        let cache = QueryCache::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build();
        (cache, clock)
    }

    fn counting_fetcher(
        calls: Arc<AtomicU32>,
    ) -> impl Fn(CancelToken) -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync {
        move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("value {n}"))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn fresh_data_skips_fetcher() {
        let (cache, clock) = manual_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let query = cache
            .query(
                &"todos",
                counting_fetcher(calls.clone()),
                QueryOptions::default().set_stale_time(Duration::from_secs(30)),
            )
            .expect("query");

        assert_eq!(query.fetch(false).await.expect("first"), "value 1");
        assert!(!query.is_stale());

        clock.advance(Duration::from_secs(10));
        assert_eq!(query.fetch(false).await.expect("fresh"), "value 1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(21));
        assert!(query.is_stale());
        assert_eq!(query.fetch(false).await.expect("stale"), "value 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let clock = ManualClock::new();
        let cache = QueryCache::builder().clock(Arc::new(clock.clone())).build();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: CancelToken| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err::<String, BoxError>("unavailable".into())
                    } else {
                        Ok("ok".to_string())
                    }
                }
            }
        };
        let options = QueryOptions::default()
            .set_retry_count(3)
            .set_retry_delay(Duration::from_millis(200))
            .set_exponential_backoff(true)
            .set_jitter(false);
        let query = cache.query(&"flaky", fetcher, options).expect("query");

        let start = clock.now();
        assert_eq!(query.fetch(false).await.expect("succeeds"), "ok");
        assert!(clock.now() - start >= Duration::from_millis(600));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.status(), QueryStatus::Success);
        assert!(query.error().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let (cache, _clock) = manual_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: CancelToken| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<u32, BoxError>(format!("attempt {n}").into()) }
            }
        };
        let options = QueryOptions::default()
            .set_retry_count(2)
            .set_retry_delay(Duration::from_millis(10));
        let query = cache.query(&"broken", fetcher, options).expect("query");

        let error = query.fetch(false).await.expect_err("fails");
        assert_eq!(error.to_string(), "fetch failed: attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.status(), QueryStatus::Error);
        assert_eq!(query.state().fetch_status, FetchStatus::Idle);
        assert!(matches!(query.error(), Some(QueryError::FetchFailed(_))));
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_call() {
        let (cache, _clock) = manual_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let query = cache
            .query(&("user", 7), counting_fetcher(calls.clone()), QueryOptions::default())
            .expect("query");

        let results = join_all((0..5).map(|_| query.fetch(false))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.expect("shared value"), "value 1");
        }
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_call_and_error() {
        let (cache, _clock) = manual_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: CancelToken| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::task::yield_now().await;
                    Err::<String, BoxError>(format!("outage {n}").into())
                }
            }
        };
        let query = cache
            .query(&"status", fetcher, QueryOptions::default())
            .expect("query");

        let results = join_all((0..4).map(|_| query.fetch(false))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let errors = results
            .into_iter()
            .map(|result| match result {
                Err(QueryError::FetchFailed(error)) => error,
                other => panic!("expected a fetch failure, got {other:?}"),
            })
            .collect::<Vec<_>>();
        for error in &errors {
            assert!(Arc::ptr_eq(error, &errors[0]));
            assert_eq!(error.to_string(), "outage 0");
        }
        assert_eq!(query.status(), QueryStatus::Error);
    }

    #[tokio::test]
    async fn joining_a_prefetch_commits_its_value() {
        let (cache, _clock) = manual_cache();
        let (release, gate) = oneshot::channel::<()>();
        let prefetch = {
            let cache = cache.clone();
            let gate = Arc::new(Mutex::new(Some(gate)));
            tokio::spawn(async move {
                cache
                    .prefetch(&"profile", move |_| {
                        let gate = gate.lock().take();
                        async move {
                            if let Some(gate) = gate {
                                let _ = gate.await;
                            }
                            Ok::<_, BoxError>("prefetched".to_string())
                        }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let calls = Arc::new(AtomicU32::new(0));
        let query = cache
            .query(
                &"profile",
                counting_fetcher(calls.clone()),
                QueryOptions::default().set_stale_time(Duration::from_secs(60)),
            )
            .expect("query");
        assert!(query.data().is_none());

        let joined = {
            let query = query.clone();
            tokio::spawn(async move { query.fetch(false).await })
        };
        tokio::task::yield_now().await;
        let _ = release.send(());

        assert_eq!(joined.await.expect("join").expect("fetch"), "prefetched");
        prefetch.await.expect("join").expect("prefetch");
        assert_eq!(query.status(), QueryStatus::Success);
        assert_eq!(query.data().as_deref(), Some("prefetched"));
        assert!(query.state().last_fetch_time.is_some());

        assert_eq!(query.fetch(false).await.expect("fresh"), "prefetched");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn superseded_attempt_has_no_effect() {
        let (cache, _clock) = manual_cache();
        let (release_first, first_gate) = oneshot::channel::<()>();
        let first_gate = Arc::new(Mutex::new(Some(first_gate)));
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: CancelToken| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let gate = first_gate.lock().take();
                async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                        Err::<String, BoxError>(format!("stale failure {n}").into())
                    } else {
                        Ok(format!("fresh {n}"))
                    }
                }
            }
        };
        let query = cache
            .query(&"race", fetcher, QueryOptions::default())
            .expect("query");

        let first = {
            let query = query.clone();
            tokio::spawn(async move { query.fetch(false).await })
        };
        tokio::task::yield_now().await;
        assert!(query.is_fetching());

        assert_eq!(query.refetch().await.expect("second"), "fresh 1");
        let _ = release_first.send(());
        let first = first.await.expect("joined");

        // The superseded call resolves with whatever data is current.
        assert_eq!(first.expect("falls back to data"), "fresh 1");
        assert_eq!(query.data().as_deref(), Some("fresh 1"));
        assert_eq!(query.status(), QueryStatus::Success);
        assert!(query.error().is_none());
    }

    #[tokio::test]
    async fn cancel_restores_previous_status() {
        let (cache, _clock) = manual_cache();
        let (sender, gate) = oneshot::channel::<()>();
        let gate = futures::FutureExt::shared(gate);
        let query = cache
            .query(
                &"slow",
                move |_| {
                    let gate = gate.clone();
                    async move {
                        let _ = gate.await;
                        Ok::<u8, BoxError>(1)
                    }
                },
                QueryOptions::default(),
            )
            .expect("query");

        let pending = {
            let query = query.clone();
            tokio::spawn(async move { query.fetch(false).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(query.status(), QueryStatus::Loading);

        assert!(query.cancel());
        assert!(!query.cancel());
        assert_eq!(query.status(), QueryStatus::Idle);
        assert!(!query.is_fetching());

        drop(sender);
        let outcome = pending.await.expect("joined");
        assert!(matches!(outcome, Err(QueryError::Cancelled { .. })));
        assert_eq!(query.status(), QueryStatus::Idle);
    }

    #[tokio::test]
    async fn set_data_promotes_idle_and_writes_through() {
        let (cache, clock) = manual_cache();
        let query = cache
            .query(
                &"profile",
                |_| async { Ok::<String, BoxError>("remote".into()) },
                QueryOptions::default().set_stale_time(Duration::from_secs(5)),
            )
            .expect("query");

        query.set_data("local".to_string()).expect("set");
        assert_eq!(query.status(), QueryStatus::Success);
        assert!(!query.is_stale());
        assert_eq!(
            cache.get_cached_data::<_, String>(&"profile").as_deref(),
            Some("local")
        );

        query.invalidate().expect("invalidate");
        assert!(query.is_stale());
        assert_eq!(query.status(), QueryStatus::Success);
        assert_eq!(query.data().as_deref(), Some("local"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(query.fetch(false).await.expect("refetched"), "remote");
    }

    #[tokio::test]
    async fn reset_restores_initial_data() {
        let (cache, _clock) = manual_cache();
        let query = cache
            .query(
                &"counter",
                |_| async { Ok::<i32, BoxError>(10) },
                QueryOptions::default().set_initial_data(0),
            )
            .expect("query");
        assert_eq!(query.data(), Some(0));
        assert!(query.is_stale());

        query.fetch(false).await.expect("fetch");
        assert_eq!(query.data(), Some(10));

        query.reset().expect("reset");
        assert_eq!(query.data(), Some(0));
        assert_eq!(query.status(), QueryStatus::Idle);
        assert!(query.state().last_fetch_time.is_none());
    }

    #[tokio::test]
    async fn disposed_query_fails_fast() {
        let (cache, _clock) = manual_cache();
        let query = cache
            .query(&"gone", |_| async { Ok::<u8, BoxError>(1) }, QueryOptions::default())
            .expect("query");
        query.dispose();

        assert!(matches!(query.fetch(false).await, Err(QueryError::Disposed(_))));
        assert!(matches!(query.set_data(2), Err(QueryError::Disposed(_))));
        assert!(matches!(query.invalidate(), Err(QueryError::Disposed(_))));
        assert_eq!(cache.get_stats().total_queries, 0);
    }

    #[tokio::test]
    async fn mount_respects_enabled_and_staleness() {
        let (cache, _clock) = manual_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let query = cache
            .query(
                &"mounted",
                counting_fetcher(calls.clone()),
                QueryOptions::default()
                    .set_enabled(false)
                    .set_stale_time(Duration::from_secs(60)),
            )
            .expect("query");

        assert_eq!(query.mount().await.expect("disabled"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        query.set_enabled(true);
        assert_eq!(query.mount().await.expect("fetches").as_deref(), Some("value 1"));
        assert_eq!(query.mount().await.expect("fresh").as_deref(), Some("value 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persisted_data_is_restored_by_a_new_cache() {
        let persister = MemoryPersister::new();
        let options = || {
            QueryOptions::default()
                .set_persist(true)
                .set_stale_time(Duration::from_secs(60))
        };

        let clock = ManualClock::new();
        let cache = QueryCache::builder()
            .clock(Arc::new(clock.clone()))
            .persister(Arc::new(persister.clone()))
            .build();
        let query = cache
            .query(&"settings", |_| async { Ok::<Vec<u8>, BoxError>(vec![1, 2]) }, options())
            .expect("query");
        query.fetch(false).await.expect("fetch");
        assert!(persister.get("settings").is_some());

        let calls = Arc::new(AtomicU32::new(0));
        let restored_cache = QueryCache::builder()
            .clock(Arc::new(clock.clone()))
            .persister(Arc::new(persister.clone()))
            .build();
        let restored = restored_cache
            .query(
                &"settings",
                {
                    let calls = calls.clone();
                    move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<Vec<u8>, BoxError>(vec![9]) }
                    }
                },
                options(),
            )
            .expect("query");

        assert_eq!(restored.fetch(false).await.expect("hydrated"), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(restored.status(), QueryStatus::Success);
    }

    #[tokio::test]
    async fn corrupt_persisted_entry_is_a_miss() {
        let persister = MemoryPersister::new();
        persister
            .write(
                "numbers",
                PersistedQuery {
                    data: serde_json::json!("not a list"),
                    timestamp: 0,
                    version: 1,
                },
            )
            .await
            .expect("write");
        let cache = QueryCache::builder()
            .clock(Arc::new(ManualClock::new()))
            .persister(Arc::new(persister))
            .build();
        let query = cache
            .query(
                &"numbers",
                |_| async { Ok::<Vec<u32>, BoxError>(vec![3]) },
                QueryOptions::default().set_persist(true),
            )
            .expect("query");

        assert!(!query.hydrate().await.expect("miss"));
        assert_eq!(query.fetch(false).await.expect("network"), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_interval_refreshes_data() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let query = cache
            .query(
                &"ticker",
                counting_fetcher(calls.clone()),
                QueryOptions::default().set_refetch_interval(Some(Duration::from_secs(10))),
            )
            .expect("query");

        query.fetch(false).await.expect("first");
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.data().as_deref(), Some("value 3"));

        query.dispose();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
