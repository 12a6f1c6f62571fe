use crate::errors::{CreditTrackerError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DEADLOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Run `operation`, retrying on database deadlocks until it succeeds, fails
/// with any other error, or the shutdown token fires. Deadlocks are expected
/// under concurrent FIFO locking and resolve after a short wait; every other
/// error is returned unchanged.
pub async fn with_deadlock_retry<T, F, Fut>(
    shutdown: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Err(CreditTrackerError::Cancelled);
        }
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_deadlock() => err,
            Err(err) => return Err(err),
        };

        warn!(
            error = %err,
            operation = operation_name,
            attempt,
            "deadlock detected, retrying operation"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Err(CreditTrackerError::Cancelled),
            _ = tokio::time::sleep(DEADLOCK_RETRY_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deadlock() -> CreditTrackerError {
        CreditTrackerError::Deadlock(sqlx::Error::PoolClosed)
    }

    #[tokio::test]
    async fn returns_result_on_first_success() {
        let shutdown = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = with_deadlock_retry(&shutdown, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_deadlock_clears() {
        let shutdown = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = with_deadlock_retry(&shutdown, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(deadlock())
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_deadlock_error_returns_immediately() {
        let shutdown = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_deadlock_retry(&shutdown, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CreditTrackerError::AlreadyPerformed)
        })
        .await;

        assert!(matches!(result, Err(CreditTrackerError::AlreadyPerformed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result: Result<()> =
            with_deadlock_retry(&shutdown, "test", || async { Ok(()) }).await;

        assert!(matches!(result, Err(CreditTrackerError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_breaks_endless_deadlocks() {
        let shutdown = CancellationToken::new();
        let cancel_after = shutdown.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_after.cancel();
        });

        let result: Result<()> =
            with_deadlock_retry(&shutdown, "test", || async { Err(deadlock()) }).await;

        assert!(matches!(result, Err(CreditTrackerError::Cancelled)));
        handle.await.unwrap();
    }
}
