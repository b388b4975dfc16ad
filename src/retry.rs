use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReadError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Exhausted,
}

/// Backoff policy shared by every read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_base_delay",
        with = "crate::config::duration_string"
    )]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "crate::config::duration_string")]
    pub max_delay: Duration,
    /// Spread each delay over `[delay / 2, delay]`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_jitter() -> bool {
    true
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Decide what happens after `failures` consecutive failed attempts.
    /// Delay is `base * 2^(failures-1)`, capped at `max_delay`.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures == 0 {
            return RetryDecision::Retry(Duration::ZERO);
        }
        if failures > self.max_retries {
            return RetryDecision::Exhausted;
        }
        let delay = self
            .base_delay
            .saturating_mul(1u32.checked_shl(failures - 1).unwrap_or(u32::MAX))
            .min(self.max_delay);
        RetryDecision::Retry(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
    /// Only [`ReadError::Transient`] failures are retried.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ReadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReadError>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    failures += 1;
                    match self.decide(failures) {
                        RetryDecision::Retry(delay) => {
                            let delay = self.jittered(delay);
                            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, error = %e, "retrying read");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Exhausted => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy(10);
        assert_eq!(p.decide(1), RetryDecision::Retry(Duration::from_secs(1)));
        assert_eq!(p.decide(2), RetryDecision::Retry(Duration::from_secs(2)));
        assert_eq!(p.decide(3), RetryDecision::Retry(Duration::from_secs(4)));
        assert_eq!(p.decide(5), RetryDecision::Retry(Duration::from_secs(16)));
    }

    #[test]
    fn test_backoff_capped() {
        let p = policy(10);
        assert_eq!(p.decide(6), RetryDecision::Retry(Duration::from_secs(30)));
        assert_eq!(p.decide(10), RetryDecision::Retry(Duration::from_secs(30)));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(3);
        assert!(matches!(p.decide(3), RetryDecision::Retry(_)));
        assert_eq!(p.decide(4), RetryDecision::Exhausted);
        assert_eq!(policy(0).decide(1), RetryDecision::Exhausted);
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let p = policy(u32::MAX);
        assert_eq!(p.decide(200), RetryDecision::Retry(Duration::from_secs(30)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..50 {
            let d = p.jittered(Duration::from_secs(4));
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = policy(3)
            .run(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ReadError::Transient("timeout".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = policy(2)
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ReadError::Transient("down".into()))
                }
            })
            .await;
        assert_eq!(result, Err(ReadError::Transient("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = policy(5)
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ReadError::Permanent("bad abi".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(ReadError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
