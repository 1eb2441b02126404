//! Per-job cancellation and deadline.
//!
//! A `CancelToken` is created when a job is enqueued (so a queued job can be
//! cancelled before it runs) and armed with the job timeout when a worker
//! picks it up. Workers call [`CancelToken::check`] at every remote-call
//! boundary; an in-flight blocking call is never interrupted.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::error::{Result, TimbreError};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    /// (armed_at, deadline)
    deadline: Mutex<Option<(Instant, Instant)>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the deadline clock. `None` leaves the token without a deadline.
    pub fn arm(&self, timeout: Option<Duration>) {
        if let Some(timeout) = timeout {
            let now = Instant::now();
            *self.inner.deadline.lock() = Some((now, now + timeout));
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, if one is armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .lock()
            .map(|(_, deadline)| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Err(Cancelled)` or `Err(TimedOut)` once the job must stop.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TimbreError::Cancelled);
        }
        if let Some((armed_at, deadline)) = *self.inner.deadline.lock() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TimbreError::TimedOut {
                    elapsed_ms: now.duration_since(armed_at).as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        assert_eq!(token.remaining(), None);
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker_side = token.clone();
        token.cancel();
        assert!(matches!(worker_side.check(), Err(TimbreError::Cancelled)));
    }

    #[test]
    fn deadline_expires() {
        let token = CancelToken::new();
        token.arm(Some(Duration::from_millis(0)));
        assert!(matches!(token.check(), Err(TimbreError::TimedOut { .. })));
    }

    #[test]
    fn generous_deadline_passes() {
        let token = CancelToken::new();
        token.arm(Some(Duration::from_secs(60)));
        assert!(token.check().is_ok());
        assert!(token.remaining().unwrap() > Duration::from_secs(50));
    }
}
