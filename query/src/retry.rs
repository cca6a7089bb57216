use std::{future::Future, time::Duration};

use rand::Rng;

use crate::{clock::Clock, BoxError, CancelToken};

/// Fraction of the delay that jitter may add or remove.
const JITTER_RATIO: f64 = 0.25;

/// Retry schedule for a fetch attempt family.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retry_count: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for exponential delays.
    pub max_delay: Duration,
    /// Growth factor for exponential delays.
    pub multiplier: f64,
    /// Grow delays exponentially.
    pub exponential: bool,
    /// Perturb delays by up to ±25%.
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            exponential: false,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return if self.jitter {
                apply_jitter(self.base_delay)
            } else {
                self.base_delay
            };
        }

        let secs = self.base_delay.as_secs_f64() * self.multiplier.powf(f64::from(attempt));
        let delay = seconds_or(secs, self.max_delay).min(self.max_delay);
        if self.jitter {
            apply_jitter(delay).min(self.max_delay)
        } else {
            delay
        }
    }
}

/// `secs` as a duration, or `fallback` when it is not representable.
fn seconds_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(fallback)
}

fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    seconds_or(delay.as_secs_f64() * (1.0 + factor), delay)
}

/// Why [`run_with_retry`] gave up.
pub(crate) enum RetryError {
    Cancelled,
    Exhausted(BoxError),
}

/// Runs `attempt_fn` until it succeeds, the policy is exhausted or `token` is cancelled.
///
/// The token is checked after every await.
pub(crate) async fn run_with_retry<T, F, Fu>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    token: &CancelToken,
    key: &str,
    mut attempt_fn: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fu,
    Fu: Future<Output = Result<T, BoxError>>,
{
    let mut attempt = 0;
    loop {
        let result = attempt_fn().await;
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match result {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.retry_count => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(key, attempt, ?delay, %error, "fetch failed, retrying");
                clock.sleep(delay).await;
                if token.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
            Err(error) => {
                tracing::debug!(key, attempts = attempt + 1, %error, "retries exhausted");
                return Err(RetryError::Exhausted(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::ManualClock;

    fn policy(retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            retry_count,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            exponential: true,
            jitter: false,
        }
    }

    #[test]
    fn exponential_delays_are_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(400), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_numbers_fall_back_to_the_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..policy(100)
        };
        assert_eq!(policy.delay_for_attempt(63), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(70), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(10)
        };
        for attempt in [3, 10, 80] {
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= Duration::from_secs(1), "{delay:?}");
                assert!(delay >= Duration::from_millis(750), "{delay:?}");
            }
        }
    }

    #[test]
    fn constant_delay_without_exponential() {
        let policy = RetryPolicy {
            exponential: false,
            ..policy(3)
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(300), "{delay:?}");
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let clock = ManualClock::new();
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancelToken::new();

        let result = run_with_retry(&policy(3), &clock, &token, "k", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err::<&str, BoxError>("flaky".into())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert!(matches!(result, Ok("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn exhausts_after_retry_count_plus_one_attempts() {
        let clock = ManualClock::new();
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancelToken::new();

        let result = run_with_retry(&policy(2), &clock, &token, "k", || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>(format!("failure {n}").into())
            }
        })
        .await;

        match result {
            Err(RetryError::Exhausted(error)) => assert_eq!(error.to_string(), "failure 2"),
            _ => panic!("expected exhaustion"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let clock = ManualClock::new();
        let token = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = run_with_retry(&policy(5), &clock, &token, "k", || {
            let calls = calls.clone();
            let token = token.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                token.cancel("stop");
                Err::<(), BoxError>("late".into())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
