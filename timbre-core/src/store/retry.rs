//! Bounded lookup retry with exponential backoff.
//!
//! Used when a worker needs a record that another process may not have
//! written yet (a model uploaded moments ago, a reference stem still being
//! produced). Each attempt that comes back empty sleeps for the current
//! backoff, doubling up to `max_delay`; once `timeout` has elapsed the wait
//! ends with `LookupTimeout`. Store errors end the wait immediately.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{
    engine::CancelToken,
    error::{Result, TimbreError},
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that looks exactly once.
    pub fn once() -> Self {
        Self {
            timeout: Duration::ZERO,
            ..Self::default()
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_delay)
    }
}

/// Poll `lookup` until it yields a value, the policy times out, or `cancel`
/// fires.
pub fn wait_until_found<T>(
    what: &str,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut lookup: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        cancel.check()?;
        attempt += 1;
        if let Some(found) = lookup()? {
            if attempt > 1 {
                debug!(
                    what,
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "lookup succeeded after retry"
                );
            }
            return Ok(found);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            warn!(
                what,
                attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                "lookup gave up"
            );
            return Err(TimbreError::LookupTimeout {
                what: what.to_string(),
                waited_ms: elapsed.as_millis() as u64,
            });
        }

        debug!(what, attempt, delay_ms = delay.as_millis() as u64, "not found yet, backing off");
        std::thread::sleep(delay.min(policy.timeout - elapsed));
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn returns_once_found() {
        let mut calls = 0;
        let v = wait_until_found("thing", &fast(1_000), &CancelToken::new(), || {
            calls += 1;
            Ok((calls >= 3).then_some(42))
        })
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn times_out_with_lookup_timeout() {
        let err = wait_until_found::<()>("model m1", &fast(20), &CancelToken::new(), || Ok(None))
            .unwrap_err();
        match err {
            TimbreError::LookupTimeout { what, waited_ms } => {
                assert_eq!(what, "model m1");
                assert!(waited_ms >= 20);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn store_errors_are_not_retried() {
        let mut calls = 0;
        let err = wait_until_found::<()>("x", &fast(1_000), &CancelToken::new(), || {
            calls += 1;
            Err(TimbreError::InvalidJob("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, TimbreError::InvalidJob(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn cancellation_stops_the_wait() {
        let token = CancelToken::new();
        token.cancel();
        let err = wait_until_found::<()>("x", &fast(1_000), &token, || Ok(None)).unwrap_err();
        assert!(matches!(err, TimbreError::Cancelled));
    }

    #[test]
    fn backoff_is_capped() {
        let p = fast(100);
        assert_eq!(p.next_delay(Duration::from_millis(1)), Duration::from_millis(2));
        assert_eq!(p.next_delay(Duration::from_millis(3)), Duration::from_millis(4));
    }
}
