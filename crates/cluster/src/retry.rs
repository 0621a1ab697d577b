use std::{future::Future, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    turingpi_common::guarded,
};

use crate::error::Result;

/// Linear backoff: wait `initial_delay` before the first retry, then
/// `increment` longer before each further one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `0` is treated as `1`.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            increment,
        }
    }

    /// A single attempt, no waiting.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.initial_delay + self.increment * retry.saturating_sub(1)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. Cancellation interrupts both the operation and the
    /// wait between attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match guarded(cancel, None, op()).await? {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(err) => err,
            };
            if attempt >= attempts || !err.is_transient() {
                return Err(err);
            }
            let delay = self.delay_before(attempt);
            warn!(what, attempt, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            guarded(cancel, None, tokio::time::sleep(delay)).await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use {
        super::*,
        crate::error::Error,
        turingpi_common::{ErrorKind, Interrupt},
    };

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(50))
    }

    #[test]
    fn delays_grow_linearly() {
        let p = policy();
        assert_eq!(p.delay_before(1), Duration::from_millis(100));
        assert_eq!(p.delay_before(2), Duration::from_millis(150));
        assert_eq!(p.delay_before(3), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let started = tokio::time::Instant::now();
        let value = policy()
            .run("probe", &CancellationToken::new(), || {
                let seen = Arc::clone(&seen);
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::transport("node1", "connection reset"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("probe", &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::transport("node1", "no route to host")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("probe", &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::command_failed("false", 1, "")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::ZERO);
        let err = policy
            .run("probe", &cancel, || {
                trigger.cancel();
                async { Err::<(), _>(Error::transport("node1", "refused")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted(Interrupt::Cancelled)));
    }
}
