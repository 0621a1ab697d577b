//! Cancellation and deadline plumbing shared by every external-call boundary.

use std::{future::Future, time::Duration};

use {thiserror::Error, tokio_util::sync::CancellationToken, tracing::debug};

/// Why an operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Drive `fut` to completion unless `cancel` fires or `deadline` elapses first.
///
/// The future is dropped on interruption; child processes spawned with
/// `kill_on_drop(true)` are reaped by that drop.
pub async fn guarded<F, T>(
    cancel: &CancellationToken,
    deadline: Option<Duration>,
    fut: F,
) -> Result<T, Interrupt>
where
    F: Future<Output = T>,
{
    if cancel.is_cancelled() {
        return Err(Interrupt::Cancelled);
    }

    let bounded = async {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Interrupt::DeadlineExceeded),
            None => Ok(fut.await),
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("operation interrupted by cancellation token");
            Err(Interrupt::Cancelled)
        },
        res = bounded => res,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_nothing_interrupts() {
        let token = CancellationToken::new();
        let value = guarded(&token, Some(Duration::from_secs(5)), async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let res = guarded(&token, None, async { 1 }).await;
        assert_eq!(res, Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses() {
        let token = CancellationToken::new();
        let res = guarded(
            &token,
            Some(Duration::from_millis(10)),
            tokio::time::sleep(Duration::from_secs(60)),
        )
        .await;
        assert_eq!(res, Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_mid_flight() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let res = guarded(&token, None, tokio::time::sleep(Duration::from_secs(60))).await;
        assert_eq!(res, Err(Interrupt::Cancelled));
    }
}
