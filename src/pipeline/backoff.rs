//! Retry timing for storage writes and bus reconnects
//!
//! - `RetryPolicy` - stateless delay schedule used by writers, which keep
//!   their own per-request attempt counters in a local retry queue
//! - `ExponentialBackoff` - stateful sleeper for sequential retry loops
//!   (bus source errors in the intake task)

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential delay schedule with a cap and optional jitter
///
/// Defaults: 5 attempts, 500ms initial delay, 30s cap, jitter on.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based, i.e. after the first failure)
    ///
    /// Jitter scales the delay by a random factor in [0.5, 1.0].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.min(32));
        let base = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let ms = if self.jitter && base > 0 {
            let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            (base as f64 * scale) as u64
        } else {
            base
        };
        Duration::from_millis(ms)
    }

    /// Whether a request that has failed `failures` times may be retried
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

/// Sequential backoff: each `sleep()` waits one step longer, up to the cap
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
        }
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.policy.max_attempts {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.policy.delay_for(self.current_attempt);

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.policy.max_attempts,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            initial_delay_ms: initial,
            max_delay_ms: max,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = no_jitter(100, 1_000, 10);
        let delays: Vec<u128> = (0..6).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        // Huge attempt numbers saturate instead of overflowing
        assert_eq!(policy.delay_for(u32::MAX).as_millis(), 1_000);
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = RetryPolicy {
            jitter: true,
            ..no_jitter(1_000, 60_000, 10)
        };
        for _ in 0..200 {
            let ms = policy.delay_for(2).as_millis();
            assert!((2_000..=4_000).contains(&ms), "delay {}ms out of range", ms);
        }
    }

    #[test]
    fn test_should_retry_counts_failures() {
        let policy = no_jitter(1, 1, 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn test_backoff_exhausts_then_resets() {
        let mut backoff = ExponentialBackoff::new(no_jitter(1, 2, 2));
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(backoff.sleep().await.is_ok());
    }
}
