//! Bounded exponential backoff for calls to external services.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, warn};

/// Exponential backoff with a ceiling and a bounded number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial: Duration::from_secs(2),
            max: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    /// `initial * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// [`Self::delay`] scaled by a random factor in `[0.5, 1.0]` so that
    /// several relayers do not retry in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        self.delay(attempt).mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// the retry budget runs out, or shutdown is signalled.
    ///
    /// Exhausting the budget is logged with `alert = true`.
    pub async fn retry<T, E, F, Fut>(
        &self,
        name: &'static str,
        shutdown_rx: &mut watch::Receiver<bool>,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(RetryError::Failed(e)),
                Err(e) if attempt >= self.max_retries => {
                    error!(
                        operation = name,
                        attempts = attempt + 1,
                        error = %e,
                        alert = true,
                        "Retries exhausted"
                    );
                    return Err(RetryError::Failed(e));
                }
                Err(e) => {
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    if sleep_or_shutdown(shutdown_rx, delay).await {
                        return Err(RetryError::Shutdown);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("interrupted by shutdown")]
    Shutdown,
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `true`
/// when interrupted.
pub async fn sleep_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        biased;
        changed = shutdown_rx.changed() => {
            // A dropped sender means nobody can ask us to stop; treat it as shutdown.
            changed.is_err() || *shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_retry_delay_calculation() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        // Capped
        assert_eq!(p.delay(3), Duration::from_millis(500));
        assert_eq!(p.delay(100), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy();
        for attempt in 0..6 {
            let d = p.jittered_delay(attempt);
            assert!(d <= p.delay(attempt));
            assert!(d >= p.delay(attempt) / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> = policy()
            .retry("test", &mut rx, |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(format!("fail {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = policy()
            .retry("test", &mut rx, |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = policy()
            .retry("test", &mut rx, |_| false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request")
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed("bad request"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(&mut rx, Duration::from_secs(3600)).await);
    }
}
