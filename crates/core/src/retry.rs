//! Retry budget and backoff curve for transient submission failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Bounded retry policy.
///
/// A job is retried while `attempts < max_attempts`; after that it stalls and becomes a
/// standing conflict candidate instead of retrying forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Retry immediately on the next flush, `max_attempts` times.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-indexed).
    ///
    /// `seed` picks the position inside the jitter band; callers pass something stable per
    /// job so the same job always gets the same curve while different jobs spread out.
    pub fn delay_for_attempt(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            jitter_range * (spread(seed, attempt) - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Uniform-ish value in `[0, 1)` derived from `seed` and `attempt` (splitmix64 finalizer).
fn spread(seed: u64, attempt: u32) -> f64 {
    let mut z = seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500))
                .without_jitter();

        assert_eq!(policy.delay_for_attempt(1, 0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, 0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, 0), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4, 0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40, 0), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            for seed in [0, 1, u64::MAX, 0xDEAD_BEEF] {
                let exact = policy.clone().without_jitter().delay_for_attempt(attempt, seed);
                let jittered = policy.delay_for_attempt(attempt, seed);
                let diff = exact.as_millis().abs_diff(jittered.as_millis());
                assert!(diff as f64 <= exact.as_millis() as f64 * 0.1 + 1.0);
            }
        }
    }

    #[test]
    fn jitter_depends_on_seed() {
        let policy = RetryPolicy::default();
        let delays: std::collections::HashSet<Duration> =
            (0..16u64).map(|seed| policy.delay_for_attempt(3, seed)).collect();
        assert!(delays.len() > 1);
        assert_eq!(policy.delay_for_attempt(3, 7), policy.delay_for_attempt(3, 7));
    }

    #[test]
    fn budget_is_bounded() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_for_attempt(2, 0), Duration::ZERO);
    }
}
