use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio::task::AbortHandle;

/// Spawns a detached background task on the current tokio runtime.
///
/// Returns `None` when called outside of a runtime.
pub(crate) fn spawn<F>(future: F) -> Option<AbortHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future).abort_handle()),
        Err(_) => {
            tracing::warn!("no tokio runtime available, background task not started");
            None
        }
    }
}

pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration, now: Instant) -> Duration {
    stale_time.saturating_sub(now.saturating_duration_since(updated_at))
}
