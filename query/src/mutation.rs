use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    query_cache::WeakQueryCache, query_key::Normalized, BoxError, ListenerKey, MutationAction,
    MutationJob, Observable, QueryCache, QueryError, QueryKey, QueryResult, QueryValue,
};

/// Lifecycle of a [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
    /// Not run yet, or reset.
    #[default]
    Idle,
    /// The mutation function is running.
    Loading,
    /// The last run succeeded.
    Success,
    /// The last run failed.
    Error,
    /// The last run was queued for replay because the network is unavailable.
    Queued,
}

/// Observable state of a [`Mutation`].
#[derive(Debug, Clone)]
pub struct MutationState<D> {
    /// Current status.
    pub status: MutationStatus,
    /// Result of the last successful run.
    pub data: Option<D>,
    /// Error of the last failed run.
    pub error: Option<QueryError>,
}

impl<D> Default for MutationState<D> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<D> MutationState<D> {
    /// Whether the mutation function is running.
    pub fn is_loading(&self) -> bool {
        self.status == MutationStatus::Loading
    }

    /// Whether the last run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// Whether the last run failed.
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }

    /// Whether the last run is waiting in the mutation queue.
    pub fn is_queued(&self) -> bool {
        self.status == MutationStatus::Queued
    }
}

type MutationFn<V, D> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D, BoxError>> + Send + Sync>;
type OnMutate<V, C> = Arc<dyn Fn(&V) -> BoxFuture<'static, C> + Send + Sync>;
type Rollback<C> = Arc<dyn Fn(&C) + Send + Sync>;
type OnSuccess<V, D, C> = Arc<dyn Fn(&D, &V, &C) + Send + Sync>;
type OnError<V, C> = Arc<dyn Fn(&QueryError, &V, &C) + Send + Sync>;
type OnSettled<V, D, C> = Arc<dyn Fn(Option<&D>, Option<&QueryError>, &V, &C) + Send + Sync>;

/// Hooks and offline behaviour of a [`Mutation`].
///
/// `C` is the context returned by `on_mutate` and handed to every other hook,
/// typically a snapshot to roll back to. Options without context are created
/// with [`new`](MutationOptions::new), the others with
/// [`with_context`](MutationOptions::with_context) or one of the optimistic
/// helpers such as [`list_put`](MutationOptions::list_put).
pub struct MutationOptions<V, D, C = ()> {
    mutation_key: Option<(String, MutationAction)>,
    on_mutate: OnMutate<V, C>,
    rollback: Option<Rollback<C>>,
    on_success: Option<OnSuccess<V, D, C>>,
    on_error: Option<OnError<V, C>>,
    on_settled: Option<OnSettled<V, D, C>>,
}

impl<V, D> MutationOptions<V, D, ()>
where
    V: 'static,
    D: 'static,
{
    /// Options without hooks or queueing.
    pub fn new() -> Self {
        Self::with_context(|_: &V| ())
    }
}

impl<V, D> Default for MutationOptions<V, D, ()>
where
    V: 'static,
    D: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, D, C> MutationOptions<V, D, C>
where
    V: 'static,
    D: 'static,
    C: Send + 'static,
{
    /// `on_mutate` runs before the mutation function; its result is the
    /// context passed to the other hooks.
    pub fn with_context(on_mutate: impl Fn(&V) -> C + Send + Sync + 'static) -> Self {
        Self::with_async_context(move |variables: &V| futures::future::ready(on_mutate(variables)))
    }

    /// Like [`with_context`](Self::with_context), awaiting the future returned
    /// by `on_mutate` before the mutation function runs. The future cannot
    /// borrow the variables; copy what it needs out of them.
    pub fn with_async_context<Fu>(on_mutate: impl Fn(&V) -> Fu + Send + Sync + 'static) -> Self
    where
        Fu: Future<Output = C> + Send + 'static,
    {
        Self {
            mutation_key: None,
            on_mutate: Arc::new(move |variables: &V| on_mutate(variables).boxed()),
            rollback: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<V, D, C> MutationOptions<V, D, C> {
    /// Queues the mutation under `mutation_key` when it runs offline.
    ///
    /// The variables are serialized into a [`MutationJob`] and replayed through
    /// the mutation function once the network is back.
    pub fn mutation_key(mut self, mutation_key: impl Into<String>, action: MutationAction) -> Self {
        self.mutation_key = Some((mutation_key.into(), action));
        self
    }

    /// Called with the result after a successful run.
    pub fn on_success(mut self, on_success: impl Fn(&D, &V, &C) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    /// Called after a failed run, once optimistic updates were rolled back.
    pub fn on_error(
        mut self,
        on_error: impl Fn(&QueryError, &V, &C) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Called after every run that was not queued.
    pub fn on_settled(
        mut self,
        on_settled: impl Fn(Option<&D>, Option<&QueryError>, &V, &C) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(on_settled));
        self
    }
}

impl<V, D, T> MutationOptions<V, D, Option<T>>
where
    V: Send + Sync + 'static,
    D: 'static,
    T: QueryValue,
{
    /// Applies `apply(current, variables)` to the value cached under `key`
    /// before the mutation runs, and restores the previous value verbatim if
    /// it fails. Returning `None` removes the value.
    pub fn optimistic<K>(
        cache: &QueryCache,
        key: &K,
        apply: impl Fn(Option<T>, &V) -> Option<T> + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        let key: Arc<str> = crate::normalize(key).into();
        let on_mutate = {
            let cache = cache.downgrade();
            let key = key.clone();
            move |variables: &V| {
                let cache = cache.upgrade()?;
                let snapshot = cache.get_cached_data::<_, T>(&Normalized(&key));
                write_optimistic(&cache, &key, apply(snapshot.clone(), variables));
                snapshot
            }
        };
        let rollback = {
            let cache = cache.downgrade();
            move |snapshot: &Option<T>| {
                if let Some(cache) = cache.upgrade() {
                    tracing::debug!(key = %key, "rolling back optimistic update");
                    write_optimistic(&cache, &key, snapshot.clone());
                }
            }
        };

        let mut options = Self::with_context(on_mutate);
        options.rollback = Some(Arc::new(rollback));
        options
    }

    /// Optimistically writes `value(variables)` under `key`.
    pub fn put<K>(
        cache: &QueryCache,
        key: &K,
        value: impl Fn(&V) -> T + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, move |_, variables| Some(value(variables)))
    }

    /// Optimistically changes the value under `key` in place. Nothing happens
    /// when there is no value.
    pub fn set<K>(
        cache: &QueryCache,
        key: &K,
        update: impl Fn(&mut T, &V) + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, move |current, variables| {
            current.map(|mut value| {
                update(&mut value, variables);
                value
            })
        })
    }

    /// Optimistically removes the value under `key`.
    pub fn remove<K>(cache: &QueryCache, key: &K) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, |_, _| None)
    }
}

impl<V, D, I> MutationOptions<V, D, Option<Vec<I>>>
where
    V: Send + Sync + 'static,
    D: 'static,
    I: QueryValue,
{
    /// Optimistically appends `item(variables)` to the list under `key`.
    pub fn list_put<K>(
        cache: &QueryCache,
        key: &K,
        item: impl Fn(&V) -> I + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, move |list, variables| {
            let mut list = list.unwrap_or_default();
            list.push(item(variables));
            Some(list)
        })
    }

    /// Optimistically replaces the items of the list under `key` for which
    /// `matches` holds with `item(variables)`.
    pub fn list_set<K>(
        cache: &QueryCache,
        key: &K,
        matches: impl Fn(&I, &V) -> bool + Send + Sync + 'static,
        item: impl Fn(&V) -> I + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, move |list, variables| {
            list.map(|list| {
                list.into_iter()
                    .map(|current| {
                        if matches(&current, variables) {
                            item(variables)
                        } else {
                            current
                        }
                    })
                    .collect()
            })
        })
    }

    /// Optimistically removes the items of the list under `key` for which
    /// `matches` holds.
    pub fn list_remove<K>(
        cache: &QueryCache,
        key: &K,
        matches: impl Fn(&I, &V) -> bool + Send + Sync + 'static,
    ) -> Self
    where
        K: QueryKey + ?Sized,
    {
        Self::optimistic(cache, key, move |list, variables| {
            list.map(|mut list| {
                list.retain(|current| !matches(current, variables));
                list
            })
        })
    }
}

fn write_optimistic<T: QueryValue>(cache: &QueryCache, key: &str, value: Option<T>) {
    let result = match value {
        Some(value) => cache.set_query_data(&Normalized(key), value),
        None => cache
            .clear_query_data::<_, T>(&Normalized(key))
            .map(|_| ()),
    };
    if let Err(error) = result {
        tracing::warn!(key, %error, "failed to write optimistic update");
    }
}

/// An operation that changes remote data.
///
/// Every [`mutate`](Self::mutate) call runs on its own; nothing is cached or
/// deduplicated. The state reflects the most recent call.
pub struct Mutation<V, D, C = ()> {
    inner: Arc<MutationInner<V, D, C>>,
}

struct MutationInner<V, D, C> {
    cache: WeakQueryCache,
    mutation_fn: MutationFn<V, D>,
    options: MutationOptions<V, D, C>,
    state: Observable<MutationState<D>>,
    // The call allowed to write the state.
    generation: AtomicU64,
}

impl<V, D, C> Clone for Mutation<V, D, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl QueryCache {
    /// Creates a mutation.
    ///
    /// With a [`mutation_key`](MutationOptions::mutation_key), a replay
    /// handler for that key is registered on the [`mutation_queue`](Self::mutation_queue).
    pub fn mutation<V, D, C, F, Fu>(
        &self,
        mutation_fn: F,
        options: MutationOptions<V, D, C>,
    ) -> Mutation<V, D, C>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
        C: Send + Sync + 'static,
        F: Fn(V) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<D, BoxError>> + Send + 'static,
    {
        let mutation_fn: MutationFn<V, D> =
            Arc::new(move |variables: V| mutation_fn(variables).boxed());

        if let Some((mutation_key, _)) = &options.mutation_key {
            let replay = mutation_fn.clone();
            self.mutation_queue()
                .register_handler(mutation_key.clone(), move |job: MutationJob| {
                    let variables = job.decode_payload::<V>();
                    let replay = replay.clone();
                    async move {
                        match variables {
                            Ok(variables) => replay(variables).await.map(|_| ()),
                            Err(error) => Err(BoxError::from(error)),
                        }
                    }
                });
        }

        Mutation {
            inner: Arc::new(MutationInner {
                cache: self.downgrade(),
                mutation_fn,
                options,
                state: Observable::new(MutationState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl<V, D, C> Mutation<V, D, C>
where
    V: Clone + Serialize + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Runs the mutation.
    ///
    /// Returns `Ok(None)` when the mutation was queued for replay. Offline
    /// without a mutation key the call fails with [`QueryError::Offline`]. A
    /// failure rolls back optimistic updates before `on_error` runs.
    pub async fn mutate(&self, variables: V) -> QueryResult<Option<D>> {
        let cache = self.cache()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.commit(generation, |state| {
            state.status = MutationStatus::Loading;
            state.error = None;
        });
        let context = (self.inner.options.on_mutate)(&variables).await;

        if !cache.is_online() {
            return match &self.inner.options.mutation_key {
                Some((mutation_key, action)) => {
                    self.enqueue(&cache, generation, mutation_key, action, &variables, &context)
                        .await
                }
                None => Err(self.fail(generation, QueryError::Offline, &variables, &context)),
            };
        }

        match (self.inner.mutation_fn)(variables.clone()).await {
            Ok(data) => {
                self.commit(generation, |state| {
                    state.status = MutationStatus::Success;
                    state.data = Some(data.clone());
                });
                let options = &self.inner.options;
                if let Some(on_success) = &options.on_success {
                    on_success(&data, &variables, &context);
                }
                if let Some(on_settled) = &options.on_settled {
                    on_settled(Some(&data), None, &variables, &context);
                }
                Ok(Some(data))
            }
            Err(error) => match &self.inner.options.mutation_key {
                Some((mutation_key, action)) if !cache.is_online() => {
                    tracing::debug!(%mutation_key, %error, "mutation failed offline, queueing");
                    self.enqueue(&cache, generation, mutation_key, action, &variables, &context)
                        .await
                }
                _ => Err(self.fail(
                    generation,
                    QueryError::mutation_failed(error),
                    &variables,
                    &context,
                )),
            },
        }
    }

    /// Returns to [`MutationStatus::Idle`]. Runs still in flight no longer
    /// update the state.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.state.set(MutationState::default());
    }

    /// Snapshot of the state.
    pub fn state(&self) -> MutationState<D> {
        self.inner.state.get()
    }

    /// Current status.
    pub fn status(&self) -> MutationStatus {
        self.inner.state.with(|state| state.status)
    }

    /// Result of the last successful run.
    pub fn data(&self) -> Option<D> {
        self.inner.state.with(|state| state.data.clone())
    }

    /// Error of the last failed run.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.with(|state| state.error.clone())
    }

    /// The observable container backing this mutation.
    pub fn observe(&self) -> Observable<MutationState<D>> {
        self.inner.state.clone()
    }

    /// Calls `listener` after every state change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationState<D>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.state.add_listener(listener)
    }

    /// Removes a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.state.remove_listener(key)
    }

    /// The key jobs of this mutation are queued under.
    pub fn mutation_key(&self) -> Option<&str> {
        self.inner
            .options
            .mutation_key
            .as_ref()
            .map(|(mutation_key, _)| mutation_key.as_str())
    }

    fn cache(&self) -> QueryResult<QueryCache> {
        self.inner
            .cache
            .upgrade()
            .ok_or_else(|| QueryError::Disposed("mutation cache".to_string()))
    }

    fn commit(&self, generation: u64, update: impl FnOnce(&mut MutationState<D>)) {
        if self.inner.generation.load(Ordering::Acquire) == generation {
            self.inner.state.update(update);
        }
    }

    async fn enqueue(
        &self,
        cache: &QueryCache,
        generation: u64,
        mutation_key: &str,
        action: &MutationAction,
        variables: &V,
        context: &C,
    ) -> QueryResult<Option<D>> {
        let payload = match MutationJob::encode_payload(variables) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(mutation_key, %error, "mutation variables cannot be queued");
                return Err(self.fail(generation, error, variables, context));
            }
        };
        let queue = cache.mutation_queue();
        queue
            .enqueue(queue.create_job(mutation_key, action.clone(), payload))
            .await;
        self.commit(generation, |state| state.status = MutationStatus::Queued);
        Ok(None)
    }

    fn fail(&self, generation: u64, error: QueryError, variables: &V, context: &C) -> QueryError {
        self.commit(generation, |state| {
            state.status = MutationStatus::Error;
            state.error = Some(error.clone());
        });
        let options = &self.inner.options;
        if let Some(rollback) = &options.rollback {
            rollback(context);
        }
        if let Some(on_error) = &options.on_error {
            on_error(&error, variables, context);
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(None, Some(&error), variables, context);
        }
        error
    }
}

impl<V, D, C> std::fmt::Debug for Mutation<V, D, C>
where
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("mutation_key", &self.inner.options.mutation_key)
            .field("state", &self.inner.state)
            .finish()
    }
}
