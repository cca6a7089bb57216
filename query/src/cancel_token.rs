use std::{future::Future, pin::pin, sync::Arc};

use futures::future::{select, Either};
use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::{QueryError, QueryResult};

/// Cooperative cancellation handle for a single fetch attempt.
///
/// Cancelling never aborts the fetcher; it only tells the owner of the token
/// that the result of the attempt must not be committed. Fetchers that can
/// stop early should check [`is_cancelled`](Self::is_cancelled) or race their
/// work against [`cancelled`](Self::cancelled).
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<TokenState>>,
}

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    reason: Option<String>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl CancelToken {
    /// Creates a live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token. Only the first call has an effect.
    ///
    /// Returns true if this call cancelled the token.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let waiters = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.reason = Some(reason.into());
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }
        true
    }

    /// Once true, stays true.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Reason passed to the first [`cancel`](Self::cancel) call.
    pub fn reason(&self) -> Option<String> {
        self.inner.lock().reason.clone()
    }

    /// Returns a [`QueryError::Cancelled`] if the token was cancelled.
    pub fn check(&self) -> QueryResult<()> {
        let state = self.inner.lock();
        if state.cancelled {
            Err(QueryError::Cancelled {
                reason: state.reason.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let receiver = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };

        // The sender is only dropped by `cancel`, either way we are done.
        let _ = receiver.await;
    }

    /// Runs `fut` until it completes or the token is cancelled.
    pub async fn run<Fu>(&self, fut: Fu) -> QueryResult<Fu::Output>
    where
        Fu: Future,
    {
        let fut = pin!(fut);
        let cancelled = pin!(self.cancelled());

        match select(fut, cancelled).await {
            Either::Left((result, _)) => Ok(result),
            Either::Right(((), _)) => {
                let reason = self.reason();
                tracing::debug!(?reason, "attempt cancelled while running");
                Err(QueryError::Cancelled { reason })
            }
        }
    }

    pub(crate) fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CancelToken")
            .field("cancelled", &state.cancelled)
            .field("reason", &state.reason)
            .finish()
    }
}
