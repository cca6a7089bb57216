use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::{
    future::BoxFuture,
    stream::{BoxStream, Stream},
    FutureExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::{
    cache_observer::CacheEvent,
    clock::SharedClock,
    lifecycle::RefetchTrigger,
    query_cache::{CachedQuery, QuerySnapshot, WeakQueryCache},
    query_persister::PersistedQuery,
    util, AppLifecycle, BoxError, FetchStatus, ListenerKey, Observable, QueryCache, QueryError,
    QueryKey, QueryResult, QueryScope, QueryState, QueryStatus, QueryValue,
};

type StreamFactory<T> = Arc<dyn Fn() -> BoxStream<'static, Result<T, BoxError>> + Send + Sync>;

/// Options of a [`StreamQuery`].
#[derive(Debug, Clone)]
pub struct StreamQueryOptions<T> {
    initial_data: Option<T>,
    keep_alive_in_background: bool,
}

impl<T> Default for StreamQueryOptions<T> {
    fn default() -> Self {
        Self {
            initial_data: None,
            keep_alive_in_background: false,
        }
    }
}

impl<T> StreamQueryOptions<T> {
    /// Data shown before the first item arrives.
    pub fn set_initial_data(mut self, initial_data: T) -> Self {
        self.initial_data = Some(initial_data);
        self
    }

    /// Keep the subscription running while the app is in the background.
    pub fn set_keep_alive_in_background(mut self, keep_alive: bool) -> Self {
        self.keep_alive_in_background = keep_alive;
        self
    }
}

/// A query fed by a long lived stream instead of a one-shot fetcher.
///
/// Every item becomes the new data. Stream errors set the error state, but the
/// subscription keeps running until the stream ends or
/// [`unsubscribe`](Self::unsubscribe) is called. The subscription is paused
/// while the app is in the background.
pub struct StreamQuery<T> {
    inner: Arc<StreamInner<T>>,
}

struct StreamInner<T> {
    key: String,
    scope: Option<String>,
    cache: WeakQueryCache,
    clock: SharedClock,
    cache_time: Option<Duration>,
    factory: StreamFactory<T>,
    initial_data: Option<T>,
    keep_alive_in_background: bool,
    state: Observable<QueryState<T>>,
    subscription: Mutex<Subscription>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct Subscription {
    task: Option<AbortHandle>,
    // Bumped on every start and stop; items from older tasks are dropped.
    generation: u64,
    paused: bool,
}

impl Subscription {
    fn stop(&mut self) -> bool {
        self.generation += 1;
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl<T> Drop for StreamInner<T> {
    fn drop(&mut self) {
        self.subscription.get_mut().stop();
    }
}

impl<T> Clone for StreamQuery<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl QueryCache {
    /// Returns the stream query registered under `key`, or creates one.
    ///
    /// `factory` opens a new subscription. It is called on every
    /// [`subscribe`](StreamQuery::subscribe) after the previous one ended.
    pub fn stream_query<K, T, F, S>(
        &self,
        key: &K,
        factory: F,
        options: StreamQueryOptions<T>,
    ) -> QueryResult<StreamQuery<T>>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, BoxError>> + Send + 'static,
    {
        self.stream_query_in_scope(None, crate::normalize(key), boxed_factory(factory), options)
    }

    fn stream_query_in_scope<T: QueryValue>(
        &self,
        scope: Option<&str>,
        key: String,
        factory: StreamFactory<T>,
        options: StreamQueryOptions<T>,
    ) -> QueryResult<StreamQuery<T>> {
        self.get_or_insert(&key, || StreamQuery::new(self, key.clone(), scope, factory, options))
    }
}

impl QueryScope {
    /// Like [`QueryCache::stream_query`], registering the query in this scope.
    pub fn stream_query<K, T, F, S>(
        &self,
        key: &K,
        factory: F,
        options: StreamQueryOptions<T>,
    ) -> QueryResult<StreamQuery<T>>
    where
        K: QueryKey + ?Sized,
        T: QueryValue,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, BoxError>> + Send + 'static,
    {
        self.ensure_active()?;
        self.cache().stream_query_in_scope(
            Some(self.id()),
            crate::normalize(key),
            boxed_factory(factory),
            options,
        )
    }
}

fn boxed_factory<T, F, S>(factory: F) -> StreamFactory<T>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move || factory().boxed())
}

impl<T> StreamQuery<T>
where
    T: QueryValue,
{
    fn new(
        cache: &QueryCache,
        key: String,
        scope: Option<&str>,
        factory: StreamFactory<T>,
        options: StreamQueryOptions<T>,
    ) -> Self {
        let state = match cache.cached_entry::<T>(&key) {
            Some((data, timestamp)) => QueryState {
                status: QueryStatus::Success,
                data: Some(data),
                last_fetch_time: Some(timestamp),
                ..QueryState::default()
            },
            None => QueryState::new(options.initial_data.clone()),
        };
        StreamQuery {
            inner: Arc::new(StreamInner {
                key,
                scope: scope.map(str::to_string),
                cache: cache.downgrade(),
                clock: cache.clock(),
                cache_time: cache.default_config().cache_time,
                factory,
                initial_data: options.initial_data,
                keep_alive_in_background: options.keep_alive_in_background,
                state: Observable::new(state),
                subscription: Mutex::new(Subscription::default()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Normalized key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.get()
    }

    /// Latest item.
    pub fn data(&self) -> Option<T> {
        self.inner.state.with(|state| state.data.clone())
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.inner.state.with(|state| state.status)
    }

    /// Last stream error, cleared by the next item.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.with(|state| state.error.clone())
    }

    /// The observable container backing this query.
    pub fn observe(&self) -> Observable<QueryState<T>> {
        self.inner.state.clone()
    }

    /// Calls `listener` after every state change.
    pub fn add_listener(
        &self,
        listener: impl Fn(&QueryState<T>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.state.add_listener(listener)
    }

    /// Removes a listener added with [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.inner.state.remove_listener(key)
    }

    /// Whether a subscription is running.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscription.lock().task.is_some()
    }

    /// Whether the subscription is paused by the app lifecycle.
    pub fn is_paused(&self) -> bool {
        self.inner.subscription.lock().paused
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Opens the subscription. Does nothing when one is already running.
    ///
    /// Fails with [`QueryError::NoRuntime`] outside a tokio runtime.
    pub fn subscribe(&self) -> QueryResult<()> {
        self.ensure_active()?;
        let started = {
            let mut subscription = self.inner.subscription.lock();
            if subscription.task.is_some() {
                return Ok(());
            }
            self.start(&mut subscription)?
        };
        if started {
            self.inner.state.notify();
        }
        Ok(())
    }

    /// Stops the subscription. The last data is kept.
    pub fn unsubscribe(&self) -> bool {
        let stopped = {
            let mut subscription = self.inner.subscription.lock();
            subscription.paused = false;
            let stopped = subscription.stop();
            if stopped {
                self.inner
                    .state
                    .update_quiet(|state| state.fetch_status = FetchStatus::Idle);
            }
            stopped
        };
        if stopped {
            tracing::debug!(key = %self.inner.key, "stream unsubscribed");
            self.inner.state.notify();
        }
        stopped
    }

    /// Closes the running subscription and opens a new one.
    pub fn resubscribe(&self) -> QueryResult<()> {
        self.ensure_active()?;
        {
            let mut subscription = self.inner.subscription.lock();
            subscription.stop();
            subscription.paused = false;
            self.start(&mut subscription)?;
        }
        self.inner.state.notify();
        Ok(())
    }

    /// Suspends a running subscription until [`resume`](Self::resume).
    pub fn pause(&self) -> bool {
        let paused = {
            let mut subscription = self.inner.subscription.lock();
            if !subscription.stop() {
                return false;
            }
            subscription.paused = true;
            self.inner
                .state
                .update_quiet(|state| state.fetch_status = FetchStatus::Paused);
            true
        };
        if paused {
            tracing::debug!(key = %self.inner.key, "stream paused");
            self.inner.state.notify();
        }
        paused
    }

    /// Reopens a subscription suspended by [`pause`](Self::pause).
    pub fn resume(&self) -> QueryResult<bool> {
        self.ensure_active()?;
        {
            let mut subscription = self.inner.subscription.lock();
            if !subscription.paused {
                return Ok(false);
            }
            self.start(&mut subscription)?;
        }
        tracing::debug!(key = %self.inner.key, "stream resumed");
        self.inner.state.notify();
        Ok(true)
    }

    /// Stops the subscription and restores the initial data.
    pub fn reset(&self) -> QueryResult<()> {
        self.ensure_active()?;
        {
            let mut subscription = self.inner.subscription.lock();
            subscription.stop();
            subscription.paused = false;
        }
        self.inner
            .state
            .set(QueryState::new(self.inner.initial_data.clone()));
        Ok(())
    }

    /// Stops the subscription, releases listeners and unregisters the query.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.subscription.lock().stop();
        self.inner.state.clear_listeners();
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.unregister(&self.inner.key, self.id());
        }
        tracing::debug!(key = %self.inner.key, "stream query disposed");
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    fn ensure_active(&self) -> QueryResult<()> {
        if self.is_disposed() {
            Err(QueryError::Disposed(self.inner.key.clone()))
        } else {
            Ok(())
        }
    }

    /// Spawns the subscription task. The state is updated without notifying;
    /// callers notify once the lock is released.
    fn start(&self, subscription: &mut Subscription) -> QueryResult<bool> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(QueryError::NoRuntime);
        }
        subscription.generation += 1;
        subscription.paused = false;
        let generation = subscription.generation;

        self.inner.state.update_quiet(|state| {
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
            state.fetch_status = FetchStatus::Fetching;
        });

        let weak = Arc::downgrade(&self.inner);
        let factory = self.inner.factory.clone();
        subscription.task = util::spawn(async move {
            let mut stream = factory();
            while let Some(item) = stream.next().await {
                if !deliver(&weak, generation, item) {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                StreamQuery { inner }.finish(generation);
            }
        });
        tracing::debug!(key = %self.inner.key, "stream subscribed");
        Ok(subscription.task.is_some())
    }

    /// Commits one item. Returns `false` once the subscription is stale.
    fn accept(&self, generation: u64, item: Result<T, BoxError>) -> bool {
        let now = self.inner.clock.now();
        let committed = {
            let subscription = self.inner.subscription.lock();
            if subscription.generation != generation {
                return false;
            }
            self.inner.state.update_quiet(|state| match item {
                Ok(data) => {
                    state.status = QueryStatus::Success;
                    state.data = Some(data.clone());
                    state.error = None;
                    state.last_fetch_time = Some(now);
                    Some(data)
                }
                Err(error) => {
                    tracing::debug!(key = %self.inner.key, %error, "stream emitted an error");
                    state.status = QueryStatus::Error;
                    state.error = Some(QueryError::fetch_failed(error));
                    None
                }
            })
        };

        if let Some(data) = committed {
            if let Some(cache) = self.inner.cache.upgrade() {
                cache.update_cache(&self.inner.key, Arc::new(data), now);
                cache.notify(CacheEvent::Updated(self.inner.key.clone()));
            }
        }
        self.inner.state.notify();
        true
    }

    fn finish(&self, generation: u64) {
        {
            let mut subscription = self.inner.subscription.lock();
            if subscription.generation != generation {
                return;
            }
            subscription.task = None;
            self.inner
                .state
                .update_quiet(|state| state.fetch_status = FetchStatus::Idle);
        }
        tracing::debug!(key = %self.inner.key, "stream ended");
        self.inner.state.notify();
    }
}

fn deliver<T: QueryValue>(
    weak: &Weak<StreamInner<T>>,
    generation: u64,
    item: Result<T, BoxError>,
) -> bool {
    match weak.upgrade() {
        Some(inner) => StreamQuery { inner }.accept(generation, item),
        None => false,
    }
}

impl<T> CachedQuery for StreamQuery<T>
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
        StreamQuery::id(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cache_time(&self) -> Option<Duration> {
        self.inner.cache_time
    }

    fn snapshot(&self) -> QuerySnapshot {
        self.inner.state.with(|state| QuerySnapshot {
            status: state.status,
            fetch_status: state.fetch_status,
            is_stale: false,
            enabled: true,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        })
    }

    fn invalidate(&self) -> bool {
        false
    }

    fn force_fetch(&self) -> BoxFuture<'static, QueryResult<()>> {
        let result = self.resubscribe();
        async move { result }.boxed()
    }

    fn cancel(&self) -> bool {
        self.unsubscribe()
    }

    fn dispose(&self) {
        StreamQuery::dispose(self)
    }

    fn hydrate(&self) -> BoxFuture<'static, QueryResult<bool>> {
        async { Ok(false) }.boxed()
    }

    fn dehydrate(&self, _version: u32) -> Option<QueryResult<PersistedQuery>> {
        None
    }

    fn on_app_lifecycle(&self, lifecycle: AppLifecycle) {
        if self.inner.keep_alive_in_background {
            return;
        }
        match lifecycle {
            AppLifecycle::Background => {
                self.pause();
            }
            AppLifecycle::Foreground => {
                if let Err(error) = self.resume() {
                    tracing::warn!(key = %self.inner.key, %error, "failed to resume stream");
                }
            }
            AppLifecycle::Inactive => {}
        }
    }

    fn wants_refetch(&self, _trigger: RefetchTrigger) -> bool {
        false
    }
}

impl<T> std::fmt::Debug for StreamQuery<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQuery")
            .field("key", &self.inner.key)
            .field("state", &self.inner.state)
            .finish()
    }
}
