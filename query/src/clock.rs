use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Source of time for staleness checks, retry delays and eviction timers.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall clock time as milliseconds since the Unix epoch. Used for persisted timestamps.
    fn unix_millis(&self) -> u64;

    /// Waits for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Virtual clocks do not drive real timers (eviction, refetch intervals).
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by tokio's timer, so paused tokio time is honoured.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A virtual clock that only moves when told to.
///
/// Sleeping advances the clock by the requested duration and returns after
/// yielding once, so retry delays are observable without waiting.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    origin_unix: u64,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a clock starting at the current time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_unix: SystemClock.unix_millis(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn unix_millis(&self) -> u64 {
        self.origin_unix + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let clock = self.clone();
        Box::pin(async move {
            clock.advance(duration);
            tokio::task::yield_now().await;
        })
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

/// Maps a persisted unix timestamp back onto the clock's monotonic timeline.
pub(crate) fn instant_from_unix(clock: &dyn Clock, unix_millis: u64) -> Instant {
    let now = clock.now();
    let age = Duration::from_millis(clock.unix_millis().saturating_sub(unix_millis));
    now.checked_sub(age).unwrap_or(now)
}

/// Maps a monotonic instant to a unix timestamp using the clock's current offset.
pub(crate) fn unix_from_instant(clock: &dyn Clock, instant: Instant) -> u64 {
    let age = clock.now().saturating_duration_since(instant);
    clock.unix_millis().saturating_sub(age.as_millis() as u64)
}
