use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Delay schedule for resubmitting requests that failed transiently.
///
/// The n-th retry (0-based) waits `base_delay * (1 + n * multiplier)`, plus
/// up to `jitter` of random extra delay. The default reproduces the cold-start
/// schedule of two retries after 5 s and 10 s.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt (0 = never retry).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Linear growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound of the random extra delay added to every wait.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(0.0);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the wait before retry number `retry` (0-based).
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .mul_f64(1.0 + retry as f64 * self.multiplier)
    }

    /// Full wait before retry number `retry`, jitter included.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's retries are used up. `label` names the request in logs.
pub(crate) async fn with_backoff<T, F, Fut>(policy: &BackoffPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    request = label,
                    error = %e,
                    retry = retry + 1,
                    max_retries = policy.max_retries,
                    "transient failure, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TryOnError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
    }

    #[test]
    fn test_multiplier_zero_is_fixed_delay() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(200))
            .with_multiplier(0.0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..20 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&BackoffPolicy::default(), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(TryOnError::from_status("POST", "/flux/run", 503, String::new()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&BackoffPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TryOnError::from_status("POST", "/flux/run", 502, String::new()))
        })
        .await;
        assert!(matches!(result, Err(TryOnError::Http { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&BackoffPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TryOnError::from_status("POST", "/flux/run", 401, String::new()))
        })
        .await;
        assert!(matches!(result, Err(TryOnError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
