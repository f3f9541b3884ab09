// Login timeout composition
// External cancellation AND a wall-clock timeout govern one operation, and the two stay distinguishable

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};

/// Run `operation` until it completes, `external` fires, or `timeout` elapses
///
/// The operation receives a token that is cancelled when either source fires.
/// A timeout yields [`AuthError::LoginTimedOut`], an external cancel yields
/// [`AuthError::Cancelled`]. The operation is dropped in both cases, so a
/// provider that ignores its token cannot hang the caller.
pub async fn with_login_timeout<T, F, Fut>(
    timeout: Duration,
    external: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let combined = external.child_token();
    let operation = operation(combined.clone());
    tokio::pin!(operation);

    tokio::select! {
        biased;
        _ = external.cancelled() => {
            combined.cancel();
            Err(AuthError::Cancelled)
        }
        _ = tokio::time::sleep(timeout) => {
            combined.cancel();
            tracing::warn!("Login timed out after {} seconds", timeout.as_secs());
            Err(AuthError::LoginTimedOut { seconds: timeout.as_secs() })
        }
        result = &mut operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_for_hanging_operation() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let result: Result<()> = with_login_timeout(Duration::from_secs(1), &cancel, |_| {
            std::future::pending()
        })
        .await;

        assert!(matches!(result, Err(AuthError::LoginTimedOut { seconds: 1 })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_is_not_a_timeout() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result: Result<()> = with_login_timeout(Duration::from_secs(60), &cancel, |_| {
            std::future::pending()
        })
        .await;

        assert!(matches!(result, Err(AuthError::Cancelled)));
    }

    #[tokio::test]
    async fn test_inner_token_cancelled_on_timeout() {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let result: Result<()> =
            with_login_timeout(Duration::from_millis(20), &cancel, |inner| {
                let _ = tx.send(inner);
                std::future::pending()
            })
            .await;

        assert!(matches!(result, Err(AuthError::LoginTimedOut { .. })));
        let inner = rx.await.unwrap();
        assert!(inner.is_cancelled());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_operation_passes_through() {
        let cancel = CancellationToken::new();
        let result = with_login_timeout(Duration::from_secs(5), &cancel, |_| async {
            Ok::<_, AuthError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
