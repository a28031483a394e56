//! Bounded exponential backoff for transient network failures.
//!
//! Three attempts, doubling delay. Callers wrap only the calls the error
//! policy allows: STS, the durable store, and parameter reads. Policy
//! evaluation and optimistic-lock conflicts are never routed through here.

use std::future::Future;
use std::time::Duration;

use aws_sdk_sts::error::SdkError;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Run `op`, retrying while `is_transient` says the failure is worth
/// another attempt. The final error is returned unchanged.
pub async fn with_backoff<T, E, Fut>(
    op_name: &str,
    is_transient: impl Fn(&E) -> bool,
    op: impl Fn() -> Fut,
) -> Result<T, E>
where
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && is_transient(&err) => {
                tracing::warn!(op = op_name, %err, attempt, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Whether an SDK failure is a network-level problem rather than a
/// service-level answer. Service errors (denials, conditional failures,
/// validation) are never transient.
pub fn is_transient_sdk<E, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(
            "test",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(
            "test",
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err("conn reset".to_string()) } else { Ok(42) }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(
            "test",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(
            "test",
            |e: &String| e.contains("transient"),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent denial".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
