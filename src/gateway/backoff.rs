//! Delay schedule between retryable gateway attempts.
//!
//! [`BackoffConfig`] only answers "how long to wait before retry N". How
//! many attempts are allowed is decided by
//! [`RetryPolicy`](crate::retry::RetryPolicy), which shares one budget
//! between transport retries and validation repairs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```
/// use resonance_pipeline::gateway::BackoffConfig;
/// use std::time::Duration;
///
/// let none = BackoffConfig::none();
/// assert_eq!(none.delay_for_retry(3, None), Duration::ZERO);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 1 second.
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Growth factor per retry. Default: 2.0.
    pub multiplier: f64,

    /// Upper bound on any single delay, including `Retry-After` hints.
    /// Default: 60 seconds.
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Default: Full.
    pub jitter: JitterStrategy,

    /// Whether a provider's `Retry-After` hint replaces the computed delay.
    pub respect_retry_after: bool,
}

/// Jitter strategy to keep parallel entity chains from retrying in lockstep
/// against a shared rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exactly the calculated value.
    None,
    /// Uniform in `[0, calculated]`.
    Full,
    /// `calculated/2` plus uniform in `[0, calculated/2]`.
    Equal,
    /// Uniform in `[initial_delay, calculated * 3]`, capped at `max_delay`.
    Decorrelated,
}

impl BackoffConfig {
    /// Retry immediately. Used by tests and local mocks.
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: JitterStrategy::None,
            respect_retry_after: false,
        }
    }

    /// 1s initial, 2x multiplier, 60s cap, full jitter.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            respect_retry_after: true,
        }
    }

    /// Long-running research calls against a shared quota: 4s initial,
    /// 10s cap, equal jitter so every retry waits at least half the step.
    pub fn patient() -> Self {
        Self {
            initial_delay: Duration::from_secs(4),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::Equal,
            respect_retry_after: true,
        }
    }

    /// Delay before retry `retry` (0-based: the wait after the first failure
    /// is retry 0). A provider hint wins when respected, still capped.
    pub fn delay_for_retry(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after.filter(|_| self.respect_retry_after) {
            return hint.min(self.max_delay);
        }

        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let max = self.max_delay.as_secs_f64();
        let capped = base.min(max);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
            JitterStrategy::Decorrelated => {
                let lo = self.initial_delay.as_secs_f64().min(max);
                let hi = (capped * 3.0).min(max).max(lo);
                lo + fastrand::f64() * (hi - lo)
            }
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(initial),
            multiplier: 2.0,
            max_delay: Duration::from_secs(max),
            jitter: JitterStrategy::None,
            respect_retry_after: false,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let config = fixed(1, 60);
        let delays: Vec<u64> = (0..4)
            .map(|n| config.delay_for_retry(n, None).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_capped_at_max() {
        let config = fixed(1, 5);
        assert_eq!(config.delay_for_retry(3, None), Duration::from_secs(5));
        assert_eq!(config.delay_for_retry(30, None), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_respected_and_capped() {
        let mut config = fixed(1, 10);
        let hint = Some(Duration::from_secs(30));
        assert_eq!(config.delay_for_retry(0, hint), Duration::from_secs(1));

        config.respect_retry_after = true;
        assert_eq!(config.delay_for_retry(0, hint), Duration::from_secs(10));
        assert_eq!(
            config.delay_for_retry(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let mut config = fixed(1, 60);
        for strategy in [JitterStrategy::Full, JitterStrategy::Equal] {
            config.jitter = strategy;
            for _ in 0..100 {
                let d = config.delay_for_retry(1, None);
                assert!(d <= Duration::from_secs(2), "{:?} gave {:?}", strategy, d);
                if strategy == JitterStrategy::Equal {
                    assert!(d >= Duration::from_secs(1), "{:?}", d);
                }
            }
        }

        config.jitter = JitterStrategy::Decorrelated;
        for _ in 0..100 {
            let d = config.delay_for_retry(1, None);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(6), "{:?}", d);
        }
    }

    #[test]
    fn test_none_never_waits() {
        let config = BackoffConfig::none();
        assert_eq!(config.delay_for_retry(5, Some(Duration::from_secs(9))), Duration::ZERO);
    }

    #[test]
    fn test_patient_preset() {
        let config = BackoffConfig::patient();
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.jitter, JitterStrategy::Equal);
    }
}
