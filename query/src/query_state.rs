use std::time::{Duration, Instant};

use crate::QueryError;

/// Outcome-oriented status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// No fetch has started yet.
    #[default]
    Idle,
    /// A fetch (including its retries) is running.
    Loading,
    /// The last fetch, or a manual update, produced data.
    Success,
    /// The last fetch failed after exhausting its retries.
    Error,
}

/// Whether a request is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A fetch or subscription is running.
    Fetching,
    /// A subscription is suspended while the app is in the background.
    Paused,
}

/// Snapshot of a query.
///
/// `status` only changes when a new fetch actually starts or settles. Staleness
/// is derived from `last_fetch_time`, so an invalidated query keeps its status
/// and data while becoming eligible for a refetch.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Network activity.
    pub fetch_status: FetchStatus,
    /// Latest data, kept through refetches and errors.
    pub data: Option<T>,
    /// Error of the last settled attempt.
    pub error: Option<QueryError>,
    /// When `data` was last fetched or set. `None` means stale.
    pub last_fetch_time: Option<Instant>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            last_fetch_time: None,
        }
    }
}

impl<T> QueryState<T> {
    /// Initial state, optionally seeded with data that is not fresh.
    pub fn new(initial_data: Option<T>) -> Self {
        Self {
            data: initial_data,
            ..Self::default()
        }
    }

    /// The data contained within the state, if present.
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Status is [`QueryStatus::Idle`].
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    /// Status is [`QueryStatus::Loading`].
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Status is [`QueryStatus::Success`].
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Status is [`QueryStatus::Error`].
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A request is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// `now - last_fetch_time > stale_time`, or never fetched.
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        match self.last_fetch_time {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) > stale_time,
            None => true,
        }
    }

    /// Projects the data, keeping status, error and timestamps.
    pub fn map_data<R>(&self, mapper: impl FnOnce(&T) -> R) -> QueryState<R> {
        QueryState {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.as_ref().map(mapper),
            error: self.error.clone(),
            last_fetch_time: self.last_fetch_time,
        }
    }
}
