use std::{
    any::Any,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    query::{Fetcher, QueryOwner},
    query_cache::{CachedQuery, QuerySnapshot},
    query_persister::PersistedQuery,
    retry::{self, RetryError},
    BoxError, CancelToken, ListenerKey, Observable, Query, QueryCache, QueryError,
    QueryKey, QueryOptions, QueryResult, QueryScope, QueryState, QueryStatus, QueryValue,
};

/// Pages loaded so far, with the cursor each page was fetched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfiniteData<P, T> {
    /// Pages in display order.
    pub pages: Vec<T>,
    /// `page_params[i]` produced `pages[i]`.
    pub page_params: Vec<P>,
}

impl<P, T> Default for InfiniteData<P, T> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

type PageParamFn<P, T> = Arc<dyn Fn(&T, &[T]) -> Option<P> + Send + Sync>;
type PageFetcher<P, T> =
    Arc<dyn Fn(P, CancelToken) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// Cursor functions and query options of an [`InfiniteQuery`].
pub struct InfiniteQueryOptions<P, T> {
    initial_page_param: P,
    get_next_page_param: PageParamFn<P, T>,
    get_previous_page_param: Option<PageParamFn<P, T>>,
    query_options: QueryOptions<InfiniteData<P, T>>,
}

impl<P, T> InfiniteQueryOptions<P, T> {
    /// `get_next_page_param` receives the last page and all pages, and returns
    /// `None` when there is nothing after it.
    pub fn new(
        initial_page_param: P,
        get_next_page_param: impl Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            get_previous_page_param: None,
            query_options: QueryOptions::default(),
        }
    }

    /// Enables backwards paging. Receives the first page and all pages.
    pub fn with_previous_page_param(
        mut self,
        get_previous_page_param: impl Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        self.get_previous_page_param = Some(Arc::new(get_previous_page_param));
        self
    }

    /// Options of the underlying query.
    pub fn with_query_options(mut self, query_options: QueryOptions<InfiniteData<P, T>>) -> Self {
        self.query_options = query_options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Previous,
}

/// A query whose data grows page by page.
///
/// A full fetch loads the first page from the initial cursor. Pages before and
/// after it are loaded with [`fetch_previous_page`](Self::fetch_previous_page) and
/// [`fetch_next_page`](Self::fetch_next_page), each direction with its own
/// cancel token. A failed page keeps the loaded pages and the status; only
/// `error` is set.
pub struct InfiniteQuery<P, T> {
    inner: Arc<InfiniteInner<P, T>>,
}

struct InfiniteInner<P, T> {
    query: Query<InfiniteData<P, T>>,
    page_fetcher: PageFetcher<P, T>,
    initial_page_param: P,
    get_next_page_param: PageParamFn<P, T>,
    get_previous_page_param: Option<PageParamFn<P, T>>,
    paging: Mutex<Paging<P>>,
}

struct Paging<P> {
    next: Option<P>,
    previous: Option<P>,
    next_token: Option<CancelToken>,
    previous_token: Option<CancelToken>,
}

impl<P: Clone> Paging<P> {
    fn initial(initial_page_param: &P) -> Self {
        Self {
            next: Some(initial_page_param.clone()),
            previous: None,
            next_token: None,
            previous_token: None,
        }
    }

    fn token(&mut self, direction: Direction) -> &mut Option<CancelToken> {
        match direction {
            Direction::Next => &mut self.next_token,
            Direction::Previous => &mut self.previous_token,
        }
    }

    fn cursor(&self, direction: Direction) -> Option<&P> {
        match direction {
            Direction::Next => self.next.as_ref(),
            Direction::Previous => self.previous.as_ref(),
        }
    }

    /// Cancels page fetches in both directions.
    fn cancel_all(&mut self, reason: &str) -> bool {
        let mut cancelled = false;
        for token in [self.next_token.take(), self.previous_token.take()]
            .into_iter()
            .flatten()
        {
            cancelled |= token.cancel(reason);
        }
        cancelled
    }
}

impl<P, T> Clone for InfiniteQuery<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl QueryCache {
    /// Returns the infinite query registered under `key`, or creates one.
    ///
    /// `fetcher` receives the cursor of the page to load.
    pub fn infinite_query<K, P, T, F, Fu>(
        &self,
        key: &K,
        fetcher: F,
        options: InfiniteQueryOptions<P, T>,
    ) -> QueryResult<InfiniteQuery<P, T>>
    where
        K: QueryKey + ?Sized,
        P: QueryValue,
        T: QueryValue,
        F: Fn(P, CancelToken) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.infinite_query_in_scope(None, crate::normalize(key), boxed_page_fetcher(fetcher), options)
    }

    pub(crate) fn infinite_query_in_scope<P, T>(
        &self,
        scope: Option<&str>,
        key: String,
        page_fetcher: PageFetcher<P, T>,
        options: InfiniteQueryOptions<P, T>,
    ) -> QueryResult<InfiniteQuery<P, T>>
    where
        P: QueryValue,
        T: QueryValue,
    {
        self.get_or_insert(&key, || InfiniteQuery::new(self, key.clone(), scope, page_fetcher, options))
    }
}

impl QueryScope {
    /// Like [`QueryCache::infinite_query`], registering the query in this scope.
    pub fn infinite_query<K, P, T, F, Fu>(
        &self,
        key: &K,
        fetcher: F,
        options: InfiniteQueryOptions<P, T>,
    ) -> QueryResult<InfiniteQuery<P, T>>
    where
        K: QueryKey + ?Sized,
        P: QueryValue,
        T: QueryValue,
        F: Fn(P, CancelToken) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.ensure_active()?;
        self.cache().infinite_query_in_scope(
            Some(self.id()),
            crate::normalize(key),
            boxed_page_fetcher(fetcher),
            options,
        )
    }
}

fn boxed_page_fetcher<P, T, F, Fu>(fetcher: F) -> PageFetcher<P, T>
where
    F: Fn(P, CancelToken) -> Fu + Send + Sync + 'static,
    Fu: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move |param: P, token: CancelToken| fetcher(param, token).boxed())
}

impl<P, T> InfiniteQuery<P, T>
where
    P: QueryValue,
    T: QueryValue,
{
    fn new(
        cache: &QueryCache,
        key: String,
        scope: Option<&str>,
        page_fetcher: PageFetcher<P, T>,
        options: InfiniteQueryOptions<P, T>,
    ) -> Self {
        let first_page: Fetcher<InfiniteData<P, T>> = {
            let page_fetcher = page_fetcher.clone();
            let initial = options.initial_page_param.clone();
            Arc::new(move |token: CancelToken| {
                let page = page_fetcher(initial.clone(), token);
                let param = initial.clone();
                async move {
                    Ok::<_, BoxError>(InfiniteData {
                        pages: vec![page.await?],
                        page_params: vec![param],
                    })
                }
                .boxed()
            })
        };
        let query = Query::new(
            cache,
            key,
            scope.map(str::to_string),
            first_page,
            options.query_options,
        );

        let infinite = InfiniteQuery {
            inner: Arc::new(InfiniteInner {
                query,
                page_fetcher,
                paging: Mutex::new(Paging::initial(&options.initial_page_param)),
                initial_page_param: options.initial_page_param,
                get_next_page_param: options.get_next_page_param,
                get_previous_page_param: options.get_previous_page_param,
            }),
        };
        let owner: Weak<dyn QueryOwner<InfiniteData<P, T>>> =
            Arc::downgrade(&infinite.inner) as Weak<InfiniteInner<P, T>>;
        infinite.inner.query.set_owner(owner);
        // Seeded data (prefetch, hydration) already determines the cursors.
        if let Some(data) = infinite.inner.query.data() {
            infinite.inner.recompute_cursors(&data);
        }
        infinite
    }

    /// Normalized key.
    pub fn key(&self) -> &str {
        self.inner.query.key()
    }

    /// Snapshot of the state.
    pub fn state(&self) -> QueryState<InfiniteData<P, T>> {
        self.inner.query.state()
    }

    /// Pages loaded so far.
    pub fn data(&self) -> Option<InfiniteData<P, T>> {
        self.inner.query.data()
    }

    /// Pages loaded so far, without their cursors.
    pub fn pages(&self) -> Vec<T> {
        self.inner
            .query
            .observe()
            .with(|state| state.data.as_ref().map(|data| data.pages.clone()))
            .unwrap_or_default()
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.inner.query.status()
    }

    /// Error of the last full fetch or page fetch.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.query.error()
    }

    /// The observable container backing this query.
    pub fn observe(&self) -> Observable<QueryState<InfiniteData<P, T>>> {
        self.inner.query.observe()
    }

    /// Calls `listener` after every state change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryState<InfiniteData<P, T>>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.query.subscribe(listener)
    }

    /// Removes a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.query.unsubscribe(key)
    }

    /// A cursor for the next page exists.
    pub fn has_next_page(&self) -> bool {
        self.inner.paging.lock().next.is_some()
    }

    /// A cursor for the previous page exists.
    pub fn has_previous_page(&self) -> bool {
        self.inner.paging.lock().previous.is_some()
    }

    /// A next page fetch is in flight.
    pub fn is_fetching_next_page(&self) -> bool {
        self.inner.paging.lock().next_token.is_some()
    }

    /// A previous page fetch is in flight.
    pub fn is_fetching_previous_page(&self) -> bool {
        self.inner.paging.lock().previous_token.is_some()
    }

    /// Fetches the first page, unless the data is fresh and `force` is false.
    ///
    /// A full fetch, including an interval refetch, drops the loaded pages,
    /// cancels page fetches in flight and starts over from the initial cursor.
    pub async fn fetch(&self, force: bool) -> QueryResult<InfiniteData<P, T>> {
        self.inner.query.fetch(force).await
    }

    /// Cancels the in-flight full fetch and starts over from the initial cursor.
    pub async fn refetch(&self) -> QueryResult<InfiniteData<P, T>> {
        self.inner.query.refetch().await
    }

    /// Loads the page after the last one.
    ///
    /// Without any data this loads the first page. Returns false, without
    /// fetching, when a next page fetch is already running, there is no next
    /// page or the query is disposed.
    pub async fn fetch_next_page(&self) -> QueryResult<bool> {
        self.fetch_page(Direction::Next).await
    }

    /// Loads the page before the first one. See [`fetch_next_page`](Self::fetch_next_page).
    pub async fn fetch_previous_page(&self) -> QueryResult<bool> {
        self.fetch_page(Direction::Previous).await
    }

    /// Marks the pages stale. The next fetch starts over.
    pub fn invalidate(&self) -> QueryResult<()> {
        self.inner.query.invalidate()
    }

    /// Cancels the full fetch and every page fetch in flight.
    pub fn cancel(&self) -> bool {
        let pages = self.inner.paging.lock().cancel_all("cancelled");
        let full = self.inner.query.cancel();
        // A cancelled refresh leaves the previous pages in place.
        if let Some(data) = self.inner.query.data() {
            self.inner.recompute_cursors(&data);
        }
        pages || full
    }

    /// Restores the initial state and cursors.
    pub fn reset(&self) -> QueryResult<()> {
        self.inner.reset_paging("reset");
        self.inner.query.reset()
    }

    /// Cancels everything and unregisters the query.
    pub fn dispose(&self) {
        self.inner.paging.lock().cancel_all("disposed");
        self.inner.query.dispose();
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.query.is_disposed()
    }

    async fn fetch_page(&self, direction: Direction) -> QueryResult<bool> {
        if self.is_disposed() {
            return Ok(false);
        }
        if self.inner.query.data().is_none() {
            if direction == Direction::Previous {
                return Ok(false);
            }
            return self.fetch(false).await.map(|_| true);
        }
        if self.inner.query.is_fetching() {
            return Ok(false);
        }

        let (param, token) = {
            let mut paging = self.inner.paging.lock();
            if paging.token(direction).is_some() {
                return Ok(false);
            }
            let Some(param) = paging.cursor(direction).cloned() else {
                return Ok(false);
            };
            let token = CancelToken::new();
            *paging.token(direction) = Some(token.clone());
            (param, token)
        };

        let key = self.inner.query.key();
        let policy = self.inner.query.config().retry_policy();
        let fetcher = self.inner.page_fetcher.clone();
        let result = retry::run_with_retry(
            &policy,
            &**self.inner.query.clock(),
            &token,
            key,
            || fetcher(param.clone(), token.clone()),
        )
        .await;

        let state = self.inner.query.observe();
        let now = self.inner.query.clock().now();
        let committed = {
            let mut paging = self.inner.paging.lock();
            let slot = paging.token(direction);
            let owns = slot.as_ref().is_some_and(|current| current.same_as(&token));
            if owns {
                *slot = None;
            }
            if owns && !token.is_cancelled() {
                match result {
                    Ok(page) => {
                        let data = state.update_quiet(|state| {
                            let data = state.data.get_or_insert_with(InfiniteData::default);
                            match direction {
                                Direction::Next => {
                                    data.pages.push(page);
                                    data.page_params.push(param);
                                }
                                Direction::Previous => {
                                    data.pages.insert(0, page);
                                    data.page_params.insert(0, param);
                                }
                            }
                            state.error = None;
                            state.last_fetch_time = Some(now);
                            data.clone()
                        });
                        self.inner.cursors_into(&mut paging, &data);
                        Some(Ok(data))
                    }
                    Err(RetryError::Exhausted(error)) => {
                        let error = QueryError::fetch_failed(error);
                        state.update_quiet(|state| state.error = Some(error.clone()));
                        Some(Err(error))
                    }
                    Err(RetryError::Cancelled) => None,
                }
            } else {
                None
            }
        };

        match committed {
            Some(Ok(data)) => {
                state.notify();
                self.inner.query.store_committed(&data, now).await;
                Ok(true)
            }
            Some(Err(error)) => {
                state.notify();
                tracing::debug!(key, ?direction, %error, "page fetch failed");
                Err(error)
            }
            None => {
                tracing::debug!(key, ?direction, "page fetch discarded");
                Ok(false)
            }
        }
    }

}

impl<P, T> InfiniteInner<P, T>
where
    P: QueryValue,
    T: QueryValue,
{
    fn reset_paging(&self, reason: &str) {
        let mut paging = self.paging.lock();
        paging.cancel_all(reason);
        *paging = Paging::initial(&self.initial_page_param);
    }

    fn recompute_cursors(&self, data: &InfiniteData<P, T>) {
        let mut paging = self.paging.lock();
        self.cursors_into(&mut paging, data);
    }

    fn cursors_into(&self, paging: &mut Paging<P>, data: &InfiniteData<P, T>) {
        let pages = data.pages.as_slice();
        paging.next = pages
            .last()
            .and_then(|last| (self.get_next_page_param)(last, pages));
        paging.previous = match (&self.get_previous_page_param, pages.first()) {
            (Some(get_previous), Some(first)) => get_previous(first, pages),
            _ => None,
        };
    }
}

impl<P, T> QueryOwner<InfiniteData<P, T>> for InfiniteInner<P, T>
where
    P: QueryValue,
    T: QueryValue,
{
    fn attempt_started(&self) {
        self.reset_paging("refresh");
    }

    fn data_committed(&self, data: &InfiniteData<P, T>) {
        self.recompute_cursors(data);
    }
}

impl<P, T> CachedQuery for InfiniteQuery<P, T>
where
    P: QueryValue,
    T: QueryValue,
{
    fn key(&self) -> &str {
        self.inner.query.key()
    }

    fn scope(&self) -> Option<&str> {
        self.inner.query.scope()
    }

    fn id(&self) -> usize {
        self.inner.query.id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cache_time(&self) -> Option<Duration> {
        self.inner.query.config().cache_time
    }

    fn snapshot(&self) -> QuerySnapshot {
        CachedQuery::snapshot(&self.inner.query)
    }

    fn invalidate(&self) -> bool {
        InfiniteQuery::invalidate(self).is_ok()
    }

    fn force_fetch(&self) -> BoxFuture<'static, QueryResult<()>> {
        let query = self.clone();
        async move { query.fetch(true).await.map(|_| ()) }.boxed()
    }

    fn cancel(&self) -> bool {
        InfiniteQuery::cancel(self)
    }

    fn dispose(&self) {
        InfiniteQuery::dispose(self)
    }

    fn hydrate(&self) -> BoxFuture<'static, QueryResult<bool>> {
        let query = self.clone();
        async move { query.inner.query.hydrate().await }.boxed()
    }

    fn dehydrate(&self, version: u32) -> Option<QueryResult<PersistedQuery>> {
        CachedQuery::dehydrate(&self.inner.query, version)
    }
}

impl<P, T> std::fmt::Debug for InfiniteQuery<P, T>
where
    P: std::fmt::Debug,
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQuery")
            .field("query", &self.inner.query)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_channel::oneshot;

    use super::*;
    use crate::{clock::Clock, ManualClock, MemoryPersister, QueryCacheConfig, QueryConfig};

    fn cache() -> QueryCache {
        let config = QueryCacheConfig {
            default_config: QueryConfig::default().with_retry_count(0),
            ..QueryCacheConfig::default()
        };
        QueryCache::builder()
            .config(config)
            .clock(Arc::new(ManualClock::new()))
            .build()
    }

    fn page_of(index: u32) -> Vec<String> {
        vec![format!("item {index}a"), format!("item {index}b")]
    }

    fn three_pages() -> InfiniteQueryOptions<u32, Vec<String>> {
        InfiniteQueryOptions::new(1, |_last: &Vec<String>, pages: &[Vec<String>]| {
            let loaded = pages.len() as u32;
            (loaded < 3).then_some(loaded + 1)
        })
    }

    #[tokio::test]
    async fn pages_until_cursor_runs_out() {
        let cache = cache();
        let feed = cache
            .infinite_query(
                &"feed",
                |page: u32, _| async move { Ok::<_, BoxError>(page_of(page)) },
                three_pages(),
            )
            .expect("query");
        assert!(feed.has_next_page());

        assert!(feed.fetch_next_page().await.expect("page 1"));
        assert!(feed.has_next_page());
        assert!(feed.fetch_next_page().await.expect("page 2"));
        assert!(feed.has_next_page());
        assert!(feed.fetch_next_page().await.expect("page 3"));
        assert!(!feed.has_next_page());
        assert!(!feed.fetch_next_page().await.expect("no more pages"));

        let data = feed.data().expect("data");
        assert_eq!(data.pages.len(), 3);
        assert_eq!(data.page_params, vec![1, 2, 3]);
        assert_eq!(data.pages[2], page_of(3));
        assert_eq!(feed.status(), QueryStatus::Success);
    }

    #[tokio::test]
    async fn previous_pages_are_prepended() {
        let cache = cache();
        let options = InfiniteQueryOptions::new(10_i32, |_: &i32, _: &[i32]| None)
            .with_previous_page_param(|first: &i32, _: &[i32]| (*first > 8).then_some(first - 1));
        let numbers = cache
            .infinite_query(&"numbers", |page: i32, _| async move { Ok::<_, BoxError>(page) }, options)
            .expect("query");

        assert!(!numbers.fetch_previous_page().await.expect("needs first page"));
        numbers.fetch(false).await.expect("first page");
        assert!(!numbers.has_next_page());
        assert!(numbers.has_previous_page());

        assert!(numbers.fetch_previous_page().await.expect("page 9"));
        assert!(numbers.fetch_previous_page().await.expect("page 8"));
        assert!(!numbers.has_previous_page());
        assert_eq!(numbers.pages(), vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn page_error_keeps_status_and_pages() {
        let cache = cache();
        let feed = cache
            .infinite_query(
                &"feed",
                |page: u32, _| async move {
                    if page == 2 {
                        Err::<Vec<String>, BoxError>("page 2 unavailable".into())
                    } else {
                        Ok(page_of(page))
                    }
                },
                three_pages(),
            )
            .expect("query");

        feed.fetch(false).await.expect("first page");
        let error = feed.fetch_next_page().await.expect_err("page 2 fails");
        assert!(matches!(error, QueryError::FetchFailed(_)));

        assert_eq!(feed.status(), QueryStatus::Success);
        assert!(feed.error().is_some());
        assert_eq!(feed.pages().len(), 1);
        assert!(feed.has_next_page());
        assert!(!feed.is_fetching_next_page());
    }

    #[tokio::test]
    async fn forced_refresh_cancels_page_fetch() {
        let cache = cache();
        let (release, gate) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate)));
        let first_page_loads = Arc::new(AtomicU32::new(0));
        let feed = cache
            .infinite_query(
                &"feed",
                {
                    let first_page_loads = first_page_loads.clone();
                    move |page: u32, _: CancelToken| {
                        let gate = if page == 2 { gate.lock().take() } else { None };
                        if page == 1 {
                            first_page_loads.fetch_add(1, Ordering::SeqCst);
                        }
                        async move {
                            if let Some(gate) = gate {
                                let _ = gate.await;
                            }
                            Ok::<_, BoxError>(page_of(page))
                        }
                    }
                },
                three_pages(),
            )
            .expect("query");
        feed.fetch(false).await.expect("first page");

        let next = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.fetch_next_page().await })
        };
        tokio::task::yield_now().await;
        assert!(feed.is_fetching_next_page());
        assert!(!feed.fetch_next_page().await.expect("already fetching"));

        let refreshed = feed.fetch(true).await.expect("refresh");
        assert_eq!(refreshed.page_params, vec![1]);
        assert!(!feed.is_fetching_next_page());

        let _ = release.send(());
        assert!(!next.await.expect("joined").expect("discarded"));
        assert_eq!(feed.pages().len(), 1);
        assert_eq!(first_page_loads.load(Ordering::SeqCst), 2);
        assert!(feed.has_next_page());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_refresh_restarts_paging() {
        let config = QueryCacheConfig {
            default_config: QueryConfig::default().with_retry_count(0),
            ..QueryCacheConfig::default()
        };
        let cache = QueryCache::builder().config(config).build();
        let options = three_pages().with_query_options(
            QueryOptions::default().set_refetch_interval(Some(Duration::from_secs(60))),
        );
        let feed = cache
            .infinite_query(
                &"feed",
                |page: u32, _| async move { Ok::<_, BoxError>(page_of(page)) },
                options,
            )
            .expect("query");
        for _ in 0..3 {
            assert!(feed.fetch_next_page().await.expect("page"));
        }
        assert!(!feed.has_next_page());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(feed.pages(), vec![page_of(1)]);
        assert!(feed.has_next_page());

        assert!(feed.fetch_next_page().await.expect("page 2 again"));
        assert_eq!(feed.data().expect("data").page_params, vec![1, 2]);
        feed.dispose();
    }

    #[tokio::test]
    async fn forced_refresh_through_cache_restarts_paging() {
        let cache = cache();
        let feed = cache
            .infinite_query(
                &"feed",
                |page: u32, _| async move { Ok::<_, BoxError>(page_of(page)) },
                three_pages(),
            )
            .expect("query");
        for _ in 0..3 {
            feed.fetch_next_page().await.expect("page");
        }

        assert!(cache.refetch_query(&"feed").await);
        assert_eq!(feed.pages().len(), 1);
        assert!(feed.has_next_page());
        assert!(feed.fetch_next_page().await.expect("page 2"));
        assert_eq!(feed.pages().len(), 2);
    }

    #[tokio::test]
    async fn pages_are_persisted_and_count_as_fetched() {
        let storage = MemoryPersister::new();
        let clock = ManualClock::new();
        let build = |clock: ManualClock| {
            let config = QueryCacheConfig {
                default_config: QueryConfig::default().with_retry_count(0),
                ..QueryCacheConfig::default()
            };
            QueryCache::builder()
                .config(config)
                .clock(Arc::new(clock))
                .persister(Arc::new(storage.clone()))
                .build()
        };
        let options =
            || three_pages().with_query_options(QueryOptions::default().set_persist(true));
        let fetcher = |page: u32, _: CancelToken| async move { Ok::<_, BoxError>(page_of(page)) };

        let cache = build(clock.clone());
        let feed = cache.infinite_query(&"feed", fetcher, options()).expect("query");
        feed.fetch(false).await.expect("page 1");
        clock.advance(Duration::from_secs(5));
        assert!(feed.fetch_next_page().await.expect("page 2"));
        assert_eq!(feed.state().last_fetch_time, Some(clock.now()));

        let restarted = build(ManualClock::new());
        let feed = restarted
            .infinite_query(&"feed", fetcher, options())
            .expect("query");
        assert_eq!(restarted.hydrate().await, 1);
        assert_eq!(feed.data().expect("restored").page_params, vec![1, 2]);
        assert!(feed.has_next_page());
    }

    #[tokio::test]
    async fn registered_like_any_query() {
        let cache = cache();
        let feed = cache
            .infinite_query(
                &"feed",
                |page: u32, _| async move { Ok::<_, BoxError>(page_of(page)) },
                three_pages(),
            )
            .expect("query");
        feed.fetch_next_page().await.expect("page 1");
        feed.fetch_next_page().await.expect("page 2");

        assert_eq!(cache.invalidate_queries(|key| key == "feed"), 1);
        assert_eq!(cache.refetch_queries(|key| key == "feed").await, 1);
        assert_eq!(feed.pages().len(), 1);

        let cached = cache
            .get_cached_data::<_, InfiniteData<u32, Vec<String>>>(&"feed")
            .expect("cached");
        assert_eq!(cached.page_params, vec![1]);

        assert!(cache.remove_query(&"feed"));
        assert!(feed.is_disposed());
        assert!(!feed.fetch_next_page().await.expect("disposed is a no-op"));
    }
}
