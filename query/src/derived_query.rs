use std::sync::Arc;

use crate::{
    BoxError, FetchStatus, ListenerKey, Observable, Query, QueryError, QueryResult, QueryState,
    QueryStatus, QueryValue,
};

type Selector<S, R> = Arc<dyn Fn(&S) -> Result<R, BoxError> + Send + Sync>;

/// A projection of another query's data.
///
/// Follows the source through a listener: loading and errors are mirrored, data
/// is passed through the selector, and listeners of the derived query are only
/// notified when the projected value (or the status) actually changes. A derived
/// query never fetches on its own; [`fetch`](Self::fetch), [`refetch`](Self::refetch)
/// and [`invalidate`](Self::invalidate) go to the source.
pub struct DerivedQuery<S, R> {
    inner: Arc<DerivedInner<S, R>>,
}

struct DerivedInner<S, R> {
    source: Query<S>,
    selector: Selector<S, R>,
    state: Observable<QueryState<R>>,
    release: Box<dyn Fn() + Send + Sync>,
}

impl<S, R> Drop for DerivedInner<S, R> {
    fn drop(&mut self) {
        (self.release)();
    }
}

impl<S, R> Clone for DerivedQuery<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Query<T>
where
    T: QueryValue,
{
    /// Derives a query that holds `selector(data)`.
    pub fn select<R>(
        &self,
        selector: impl Fn(&T) -> R + Send + Sync + 'static,
    ) -> DerivedQuery<T, R>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        DerivedQuery::new(self.clone(), Arc::new(move |data: &T| Ok(selector(data))))
    }

    /// Like [`select`](Self::select), for selectors that can fail.
    ///
    /// A failure becomes the derived query's error as [`QueryError::SelectFailed`].
    pub fn try_select<R>(
        &self,
        selector: impl Fn(&T) -> Result<R, BoxError> + Send + Sync + 'static,
    ) -> DerivedQuery<T, R>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        DerivedQuery::new(self.clone(), Arc::new(selector))
    }
}

impl<S, R> DerivedQuery<S, R>
where
    S: QueryValue,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    fn new(source: Query<S>, selector: Selector<S, R>) -> Self {
        let state = Observable::new(QueryState::default());
        propagate(&state, &source.state(), &*selector);

        let listener = {
            let state = state.clone();
            let selector = selector.clone();
            source.subscribe(move |source_state| propagate(&state, source_state, &*selector))
        };
        let release = {
            let source_state = source.observe();
            Box::new(move || {
                source_state.remove_listener(listener);
            })
        };

        DerivedQuery {
            inner: Arc::new(DerivedInner {
                source,
                selector,
                state,
                release,
            }),
        }
    }

    /// Snapshot of the derived state.
    pub fn state(&self) -> QueryState<R> {
        self.inner.state.get()
    }

    /// Latest projected value.
    pub fn data(&self) -> Option<R> {
        self.inner.state.with(|state| state.data.clone())
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.inner.state.with(|state| state.status)
    }

    /// Source error, or the selector's failure.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.with(|state| state.error.clone())
    }

    /// The observable container backing this query.
    pub fn observe(&self) -> Observable<QueryState<R>> {
        self.inner.state.clone()
    }

    /// Calls `listener` after every change of the derived state.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryState<R>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.state.add_listener(listener)
    }

    /// Removes a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.state.remove_listener(key)
    }

    /// The query this one is derived from.
    pub fn source(&self) -> &Query<S> {
        &self.inner.source
    }

    /// Fetches the source and projects the result.
    pub async fn fetch(&self, force: bool) -> QueryResult<R> {
        let data = self.inner.source.fetch(force).await?;
        self.project(&data)
    }

    /// Refetches the source and projects the result.
    pub async fn refetch(&self) -> QueryResult<R> {
        let data = self.inner.source.refetch().await?;
        self.project(&data)
    }

    /// Invalidates the source.
    pub fn invalidate(&self) -> QueryResult<()> {
        self.inner.source.invalidate()
    }

    fn project(&self, data: &S) -> QueryResult<R> {
        (self.inner.selector)(data).map_err(QueryError::select_failed)
    }
}

/// Mirrors `source` into `derived`, notifying only on a visible change.
fn propagate<S, R>(
    derived: &Observable<QueryState<R>>,
    source: &QueryState<S>,
    selector: &(dyn Fn(&S) -> Result<R, BoxError> + Send + Sync),
) where
    R: Clone + PartialEq + Send + Sync + 'static,
{
    // The selector runs before the derived state is locked.
    let projected = match source.status {
        QueryStatus::Loading | QueryStatus::Error => None,
        QueryStatus::Idle | QueryStatus::Success => source
            .data
            .as_ref()
            .map(|data| selector(data).map_err(QueryError::select_failed)),
    };

    derived.update_if(|state| {
        let mut changed = false;
        state.last_fetch_time = source.last_fetch_time;

        let (status, fetch_status) = match (&source.status, &projected) {
            (_, Some(Err(_))) => (QueryStatus::Error, FetchStatus::Idle),
            (status, _) => (*status, source.fetch_status),
        };
        if state.status != status || state.fetch_status != fetch_status {
            state.status = status;
            state.fetch_status = fetch_status;
            changed = true;
        }

        let error = match &projected {
            Some(Err(error)) => Some(error.clone()),
            _ if source.status == QueryStatus::Error => source.error.clone(),
            _ => None,
        };
        let error_changed = match (&state.error, &error) {
            (None, None) => false,
            (Some(current), Some(next)) => current.to_string() != next.to_string(),
            _ => true,
        };
        if error_changed {
            state.error = error;
            changed = true;
        }

        if let Some(Ok(value)) = projected {
            if state.data.as_ref() != Some(&value) {
                state.data = Some(value);
                changed = true;
            }
        }
        changed
    });
}

impl<S, R> std::fmt::Debug for DerivedQuery<S, R>
where
    R: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedQuery")
            .field("state", &self.inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, AtomicUsize, Ordering},
        time::Duration,
    };

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{ManualClock, QueryCache, QueryConfig, QueryCacheConfig, QueryOptions};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

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

    fn profile_query(cache: &QueryCache, calls: &Arc<AtomicU32>) -> Query<Profile> {
        let calls = calls.clone();
        cache
            .query(
                &"profile",
                move |_| {
                    let visits = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok::<_, BoxError>(Profile {
                            name: "ada".into(),
                            visits,
                        })
                    }
                },
                QueryOptions::default().set_stale_time(Duration::from_secs(60)),
            )
            .expect("query")
    }

    #[tokio::test]
    async fn unrelated_changes_do_not_notify() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let profile = profile_query(&cache, &calls);
        let name = profile.select(|profile| profile.name.clone());

        profile.fetch(false).await.expect("fetch");
        assert_eq!(name.data().as_deref(), Some("ada"));
        assert_eq!(name.status(), QueryStatus::Success);

        let notifications = Arc::new(AtomicUsize::new(0));
        {
            let notifications = notifications.clone();
            name.subscribe(move |_| {
                notifications.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Only `visits` changes.
        profile
            .set_data(Profile {
                name: "ada".into(),
                visits: 10,
            })
            .expect("set");
        assert_eq!(notifications.load(Ordering::SeqCst), 0);

        profile
            .set_data(Profile {
                name: "grace".into(),
                visits: 10,
            })
            .expect("set");
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
        assert_eq!(name.data().as_deref(), Some("grace"));
    }

    #[tokio::test]
    async fn mirrors_source_errors() {
        let cache = cache();
        let source = cache
            .query(
                &"failing",
                |_| async { Err::<u32, BoxError>("offline".into()) },
                QueryOptions::default(),
            )
            .expect("query");
        let doubled = source.select(|value| value * 2);

        assert!(doubled.fetch(false).await.is_err());
        assert_eq!(doubled.status(), QueryStatus::Error);
        assert!(matches!(doubled.error(), Some(QueryError::FetchFailed(_))));
    }

    #[tokio::test]
    async fn selector_failure_becomes_error() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let profile = profile_query(&cache, &calls);
        let ratio = profile.try_select(|profile| {
            if profile.visits == 0 {
                Err::<u32, BoxError>("no visits yet".into())
            } else {
                Ok(100 / profile.visits)
            }
        });

        let error = ratio.fetch(false).await.expect_err("selector fails");
        assert!(matches!(error, QueryError::SelectFailed(_)));
        assert_eq!(ratio.status(), QueryStatus::Error);
        assert_eq!(profile.status(), QueryStatus::Success);

        assert_eq!(ratio.refetch().await.expect("second fetch"), 100);
        assert_eq!(ratio.status(), QueryStatus::Success);
        assert!(ratio.error().is_none());
    }

    #[tokio::test]
    async fn delegates_invalidation_and_releases_listener() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));
        let profile = profile_query(&cache, &calls);
        let listeners = profile.observe().listener_count();

        let visits = profile.select(|profile| profile.visits);
        visits.fetch(false).await.expect("fetch");
        visits.invalidate().expect("invalidate");
        assert!(profile.is_stale());
        assert_eq!(profile.observe().listener_count(), listeners + 1);

        drop(visits);
        assert_eq!(profile.observe().listener_count(), listeners);
    }
}
