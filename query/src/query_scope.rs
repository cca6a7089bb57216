use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    query::boxed_fetcher, BoxError, CancelToken, Query, QueryCache, QueryError, QueryKey,
    QueryOptions, QueryResult, QueryValue,
};

/// A group of queries that is torn down together.
///
/// Queries created through a scope are registered under its id. Each call to
/// [`QueryCache::scope`] opens a handle; clones share it. Releasing a handle,
/// by [`dispose`](QueryScope::dispose) or by dropping its last clone, removes the
/// scope's queries once no other handle with the same id is open.
#[derive(Clone)]
pub struct QueryScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    cache: QueryCache,
    id: String,
    disposed: AtomicBool,
}

impl ScopeInner {
    fn release(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let open = self.cache.release_scope(&self.id);
        if open == 0 {
            let cleared = self.cache.clear_scope(&self.id);
            tracing::debug!(scope = %self.id, cleared, "scope disposed");
        } else {
            tracing::trace!(scope = %self.id, open, "scope handle released");
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl QueryCache {
    /// Opens a scope handle. Handles with the same id share their queries.
    pub fn scope(&self, id: impl Into<String>) -> QueryScope {
        let id = id.into();
        self.acquire_scope(&id);
        QueryScope {
            inner: Arc::new(ScopeInner {
                cache: self.clone(),
                id,
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

impl QueryScope {
    /// The scope id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The cache the scope registers into.
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Like [`QueryCache::query`], registering the query in this scope.
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
        self.ensure_active()?;
        self.inner.cache.query_in_scope(
            Some(&self.inner.id),
            crate::normalize(key),
            boxed_fetcher(fetcher),
            options,
        )
    }

    /// Marks every query of the scope stale.
    pub fn invalidate(&self) -> usize {
        self.inner.cache.invalidate_scope(&self.inner.id)
    }

    /// Force fetches every query of the scope.
    pub async fn refetch(&self) -> usize {
        self.inner.cache.refetch_scope(&self.inner.id).await
    }

    /// Disposes and removes every query of the scope, whichever handle
    /// registered it. The scope stays usable.
    pub fn clear(&self) -> usize {
        self.inner.cache.clear_scope(&self.inner.id)
    }

    /// Releases this handle and rejects further registrations through it.
    /// The scope's queries are removed when it was the last open handle.
    pub fn dispose(&self) {
        self.inner.release();
    }

    pub(crate) fn ensure_active(&self) -> QueryResult<()> {
        if self.is_disposed() {
            Err(QueryError::Disposed(format!("scope {}", self.inner.id)))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for QueryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryScope")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
