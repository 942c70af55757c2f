use std::future::Future;

use gattkit_protocol::DriverResult;
use tracing::warn;

use crate::config::RetryPolicy;

/// Run `op`, retrying transient driver failures per `policy`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> DriverResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriverResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.retries => {
                attempt += 1;
                warn!(op = op_name, attempt, error = %err, "transient driver failure, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_protocol::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&policy(2), "read", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DriverError::Transient("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: DriverResult<()> = with_retry(&policy(1), "read", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::Transient("busy".into()))
        })
        .await;
        assert!(matches!(result, Err(DriverError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: DriverResult<()> = with_retry(&policy(3), "read", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::Disconnected)
        })
        .await;
        assert_eq!(result, Err(DriverError::Disconnected));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
