//! Bounded retry with exponential backoff and jitter.
//!
//! Wraps any store operation that may fail transiently. The replicator runs
//! the pipeline over every error (a dropped projection attempt is recovered
//! by feed redelivery); store calls use the transient-only classification so
//! deterministic failures surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::{Result, StoreError};

/// Which errors the pipeline considers retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClassification {
    /// Retry everything except cancellation.
    AllErrors,
    /// Retry only [`StoreError::is_transient`] classifications.
    TransientOnly,
}

/// A reusable retry policy: bounded attempts, exponential backoff, randomized
/// jitter so concurrently failing replicas do not align into retry storms.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    classification: RetryClassification,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(8),
            classification: RetryClassification::AllErrors,
        }
    }

    /// Policy for caller-facing store operations.
    pub fn transient_only() -> Self {
        Self::new().with_classification(RetryClassification::TransientOnly)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_classification(mut self, classification: RetryClassification) -> Self {
        self.classification = classification;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Undamped exponential curve: base × 2^(attempt−1), capped.
    fn backoff_base(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Multiply by a random factor in [0.5, 1.5).
    fn jittered(delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        delay.mul_f64(factor)
    }

    fn is_retryable(&self, err: &StoreError) -> bool {
        if matches!(err, StoreError::Cancelled) {
            return false;
        }
        match self.classification {
            RetryClassification::AllErrors => true,
            RetryClassification::TransientOnly => err.is_transient(),
        }
    }

    /// Run `operation`, retrying per policy. Returns the first
    /// non-retryable error, or the last error once attempts are exhausted.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.is_retryable(&err) || retries >= self.max_retries {
                return Err(err);
            }
            retries += 1;
            let delay = Self::jittered(self.backoff_base(retries));
            warn!(
                retry = retries,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry pipeline handling failure, delaying before next attempt"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new().with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_base_doubles_and_caps() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1500));

        assert_eq!(policy.backoff_base(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_base(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_base(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_base(4), Duration::from_millis(800));
        // Capped from here on.
        assert_eq!(policy.backoff_base(5), Duration::from_millis(1500));
        assert_eq!(policy.backoff_base(6), Duration::from_millis(1500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let jittered = RetryPolicy::jittered(base);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = fast_policy()
            .execute(&cancel, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_bounded_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast_policy()
            .execute(&cancel, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Transient("still down".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
        // One initial attempt plus six retries.
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_recovery_mid_sequence() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = fast_policy()
            .execute(&cancel, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(StoreError::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transient_only_rejects_deterministic_errors_immediately() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = RetryPolicy::transient_only()
            .with_base_delay(Duration::from_millis(1))
            .execute(&cancel, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::NotFound("x".into(), "p".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(_, _))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = fast_policy()
            .execute(&cancel, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }
}
