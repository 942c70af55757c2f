//! Cleanup for driver work abandoned part way.
//!
//! Callers bound driver calls with `tokio::time::timeout`, which drops the
//! call's future at whatever await it was parked on. Anything acquired before
//! that point (a radio link that came up but was never handed back) must be
//! released from `Drop`, since no code after the await will run.

/// Runs `close` when dropped, unless disarmed first.
#[must_use = "dropping the guard immediately runs the cleanup"]
pub struct CloseOnDrop<F: FnOnce()> {
    close: Option<F>,
}

impl<F: FnOnce()> CloseOnDrop<F> {
    pub fn new(close: F) -> Self {
        Self { close: Some(close) }
    }

    /// The acquired resource has an owner now; skip the cleanup.
    pub fn disarm(mut self) {
        self.close = None;
    }
}

impl<F: FnOnce()> Drop for CloseOnDrop<F> {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let closed = Arc::new(AtomicUsize::new(0));
        let close = {
            let closed = closed.clone();
            move || {
                closed.fetch_add(1, Ordering::SeqCst);
            }
        };
        (closed, close)
    }

    #[test]
    fn runs_cleanup_unless_disarmed() {
        let (closed, close) = counting();
        drop(CloseOnDrop::new(close));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let (closed, close) = counting();
        CloseOnDrop::new(close).disarm();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_releases_what_it_acquired() {
        let (closed, close) = counting();
        let attempt = async move {
            let guard = CloseOnDrop::new(close);
            // link is up; service discovery never answers
            std::future::pending::<()>().await;
            guard.disarm();
        };
        let outcome = tokio::time::timeout(Duration::from_secs(1), attempt).await;
        assert!(outcome.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let (closed, close) = counting();
        let attempt = async move {
            let guard = CloseOnDrop::new(close);
            tokio::time::sleep(Duration::from_millis(100)).await;
            guard.disarm();
        };
        tokio::time::timeout(Duration::from_secs(1), attempt).await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }
}
