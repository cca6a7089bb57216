use std::time::Duration;

use crate::retry::RetryPolicy;

const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(60 * 5);
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fully resolved configuration of a query.
///
/// A [`QueryCache`](crate::QueryCache) carries one as the default for every
/// query; per-query [`QueryOptions`] override individual fields through
/// [`QueryConfig::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryConfig {
    /// Time after the last successful fetch during which data is fresh.
    pub stale_time: Duration,
    /// How long a cache entry lives after it was written. `None` never expires.
    pub cache_time: Option<Duration>,
    /// Retries after the first failed attempt.
    pub retry_count: u32,
    /// Base delay between retries.
    pub retry_delay: Duration,
    /// Upper bound for exponential delays.
    pub max_retry_delay: Duration,
    /// Growth factor for exponential delays.
    pub backoff_multiplier: f64,
    /// Grow the delay exponentially instead of using `retry_delay` every time.
    pub exponential_backoff: bool,
    /// Perturb delays randomly to avoid synchronized retries.
    pub jitter: bool,
    /// Refetch stale data when the query is mounted.
    pub refetch_on_mount: bool,
    /// Refetch stale data when the app returns to the foreground.
    pub refetch_on_focus: bool,
    /// Refetch stale data when the network comes back.
    pub refetch_on_reconnect: bool,
    /// Periodic background refetch.
    pub refetch_interval: Option<Duration>,
    /// Disabled queries are skipped by automatic refetches.
    pub enabled: bool,
    /// Write successful results to the cache persister.
    pub persist: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            cache_time: Some(DEFAULT_CACHE_TIME),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            exponential_backoff: true,
            jitter: true,
            refetch_on_mount: true,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            refetch_interval: None,
            enabled: true,
            persist: false,
        }
    }
}

impl QueryConfig {
    /// Applies `overrides` on top of this config.
    ///
    /// Every field takes the override when it is present and the base value otherwise.
    pub fn merge<V>(&self, overrides: &QueryOptions<V>) -> QueryConfig {
        QueryConfig {
            stale_time: pick(&overrides.stale_time, &self.stale_time),
            cache_time: pick(&overrides.cache_time, &self.cache_time),
            retry_count: pick(&overrides.retry_count, &self.retry_count),
            retry_delay: pick(&overrides.retry_delay, &self.retry_delay),
            max_retry_delay: pick(&overrides.max_retry_delay, &self.max_retry_delay),
            backoff_multiplier: pick(&overrides.backoff_multiplier, &self.backoff_multiplier),
            exponential_backoff: pick(&overrides.exponential_backoff, &self.exponential_backoff),
            jitter: pick(&overrides.jitter, &self.jitter),
            refetch_on_mount: pick(&overrides.refetch_on_mount, &self.refetch_on_mount),
            refetch_on_focus: pick(&overrides.refetch_on_focus, &self.refetch_on_focus),
            refetch_on_reconnect: pick(&overrides.refetch_on_reconnect, &self.refetch_on_reconnect),
            refetch_interval: pick(&overrides.refetch_interval, &self.refetch_interval),
            enabled: pick(&overrides.enabled, &self.enabled),
            persist: pick(&overrides.persist, &self.persist),
        }
    }

    /// Ensures that `cache_time` is >= than `stale_time`.
    pub fn validate(self) -> Self {
        let stale_time = ensure_valid_stale_time(self.stale_time, self.cache_time);
        QueryConfig { stale_time, ..self }
    }

    /// The retry schedule described by this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_count: self.retry_count,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            multiplier: self.backoff_multiplier,
            exponential: self.exponential_backoff,
            jitter: self.jitter,
        }
    }

    /// Sets the stale time.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Sets the cache time.
    pub fn with_cache_time(mut self, cache_time: Option<Duration>) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Sets the number of retries.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the base retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

fn pick<T: Clone>(override_value: &Option<T>, base: &T) -> T {
    match override_value {
        Some(value) => value.clone(),
        None => base.clone(),
    }
}

fn ensure_valid_stale_time(stale_time: Duration, cache_time: Option<Duration>) -> Duration {
    match cache_time {
        Some(cache_time) if stale_time > cache_time => {
            tracing::warn!(
                ?stale_time,
                ?cache_time,
                "stale_time is greater than cache_time, using cache_time instead"
            );
            cache_time
        }
        _ => stale_time,
    }
}

/**
 * Per-query overrides of the cache wide [`QueryConfig`].
 */
#[derive(Debug, Clone)]
pub struct QueryOptions<V> {
    /// Seed data. Never considered fresh, so the first fetch still runs.
    pub initial_data: Option<V>,
    /// Overrides [`QueryConfig::stale_time`].
    pub stale_time: Option<Duration>,
    /// Overrides [`QueryConfig::cache_time`].
    pub cache_time: Option<Option<Duration>>,
    /// Overrides [`QueryConfig::retry_count`].
    pub retry_count: Option<u32>,
    /// Overrides [`QueryConfig::retry_delay`].
    pub retry_delay: Option<Duration>,
    /// Overrides [`QueryConfig::max_retry_delay`].
    pub max_retry_delay: Option<Duration>,
    /// Overrides [`QueryConfig::backoff_multiplier`].
    pub backoff_multiplier: Option<f64>,
    /// Overrides [`QueryConfig::exponential_backoff`].
    pub exponential_backoff: Option<bool>,
    /// Overrides [`QueryConfig::jitter`].
    pub jitter: Option<bool>,
    /// Overrides [`QueryConfig::refetch_on_mount`].
    pub refetch_on_mount: Option<bool>,
    /// Overrides [`QueryConfig::refetch_on_focus`].
    pub refetch_on_focus: Option<bool>,
    /// Overrides [`QueryConfig::refetch_on_reconnect`].
    pub refetch_on_reconnect: Option<bool>,
    /// Overrides [`QueryConfig::refetch_interval`].
    pub refetch_interval: Option<Option<Duration>>,
    /// Overrides [`QueryConfig::enabled`].
    pub enabled: Option<bool>,
    /// Overrides [`QueryConfig::persist`].
    pub persist: Option<bool>,
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        Self {
            initial_data: None,
            stale_time: None,
            cache_time: None,
            retry_count: None,
            retry_delay: None,
            max_retry_delay: None,
            backoff_multiplier: None,
            exponential_backoff: None,
            jitter: None,
            refetch_on_mount: None,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
            refetch_interval: None,
            enabled: None,
            persist: None,
        }
    }
}

impl<V> QueryOptions<V> {
    /// Set the initial data.
    pub fn set_initial_data(self, initial_data: V) -> Self {
        QueryOptions {
            initial_data: Some(initial_data),
            ..self
        }
    }

    /// Set the stale time.
    pub fn set_stale_time(self, stale_time: Duration) -> Self {
        QueryOptions {
            stale_time: Some(stale_time),
            ..self
        }
    }

    /// Set the cache time. `None` keeps the entry forever.
    pub fn set_cache_time(self, cache_time: Option<Duration>) -> Self {
        QueryOptions {
            cache_time: Some(cache_time),
            ..self
        }
    }

    /// Set the retry count.
    pub fn set_retry_count(self, retry_count: u32) -> Self {
        QueryOptions {
            retry_count: Some(retry_count),
            ..self
        }
    }

    /// Set the base retry delay.
    pub fn set_retry_delay(self, retry_delay: Duration) -> Self {
        QueryOptions {
            retry_delay: Some(retry_delay),
            ..self
        }
    }

    /// Set the maximum retry delay.
    pub fn set_max_retry_delay(self, max_retry_delay: Duration) -> Self {
        QueryOptions {
            max_retry_delay: Some(max_retry_delay),
            ..self
        }
    }

    /// Set the backoff multiplier.
    pub fn set_backoff_multiplier(self, backoff_multiplier: f64) -> Self {
        QueryOptions {
            backoff_multiplier: Some(backoff_multiplier),
            ..self
        }
    }

    /// Use exponential or constant retry delays.
    pub fn set_exponential_backoff(self, exponential_backoff: bool) -> Self {
        QueryOptions {
            exponential_backoff: Some(exponential_backoff),
            ..self
        }
    }

    /// Enable or disable jitter.
    pub fn set_jitter(self, jitter: bool) -> Self {
        QueryOptions {
            jitter: Some(jitter),
            ..self
        }
    }

    /// Refetch on mount.
    pub fn set_refetch_on_mount(self, refetch_on_mount: bool) -> Self {
        QueryOptions {
            refetch_on_mount: Some(refetch_on_mount),
            ..self
        }
    }

    /// Refetch when the app returns to the foreground.
    pub fn set_refetch_on_focus(self, refetch_on_focus: bool) -> Self {
        QueryOptions {
            refetch_on_focus: Some(refetch_on_focus),
            ..self
        }
    }

    /// Refetch when the network reconnects.
    pub fn set_refetch_on_reconnect(self, refetch_on_reconnect: bool) -> Self {
        QueryOptions {
            refetch_on_reconnect: Some(refetch_on_reconnect),
            ..self
        }
    }

    /// Set the refetch interval.
    pub fn set_refetch_interval(self, refetch_interval: Option<Duration>) -> Self {
        QueryOptions {
            refetch_interval: Some(refetch_interval),
            ..self
        }
    }

    /// Enable or disable automatic fetching.
    pub fn set_enabled(self, enabled: bool) -> Self {
        QueryOptions {
            enabled: Some(enabled),
            ..self
        }
    }

    /// Persist successful results.
    pub fn set_persist(self, persist: bool) -> Self {
        QueryOptions {
            persist: Some(persist),
            ..self
        }
    }

    /// Transform the initial data, keeping every override.
    pub fn map_value<R>(self, func: impl FnOnce(V) -> R) -> QueryOptions<R> {
        QueryOptions {
            initial_data: self.initial_data.map(func),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
            max_retry_delay: self.max_retry_delay,
            backoff_multiplier: self.backoff_multiplier,
            exponential_backoff: self.exponential_backoff,
            jitter: self.jitter,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_interval: self.refetch_interval,
            enabled: self.enabled,
            persist: self.persist,
        }
    }
}
