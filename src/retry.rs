//! Attempt budget for one stage invocation.
//!
//! Transport retries and validation repairs draw from the same
//! `max_attempts` ceiling, so the cost of a stage is bounded no matter how
//! its failures mix. A repair call re-sends the original prompt with the
//! invalid answer and the validator's description of what was wrong.

use crate::gateway::{BackoffConfig, ChatMessage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard upper bound on `max_attempts`.
pub const MAX_ATTEMPTS_CEILING: u32 = 10;

/// # Example
///
/// ```
/// use resonance_pipeline::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3)
///     .with_attempt_timeout(Duration::from_secs(30))
///     .no_cool_down();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.max_repairs, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Gateway calls allowed per stage invocation, first call included.
    /// Range: 1-10. Default: 4.
    pub max_attempts: u32,

    /// Validation repair calls allowed within that budget. Default: 1.
    pub max_repairs: u32,

    /// Bound on a single gateway call. Default: 120 seconds.
    #[serde(with = "secs")]
    pub attempt_timeout: Duration,

    /// Delay schedule between retryable transport failures.
    pub backoff: BackoffConfig,

    /// Lower temperature by 0.2 on each repair call. Default: `true`.
    pub cool_down: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            ..Self::default()
        }
    }

    pub fn with_repairs(mut self, max_repairs: u32) -> Self {
        self.max_repairs = max_repairs;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn no_cool_down(mut self) -> Self {
        self.cool_down = false;
        self
    }

    /// Temperature for a call after `repairs` repair turns.
    pub fn temperature_for(&self, base: f64, repairs: u32) -> f64 {
        if self.cool_down {
            (base - 0.2 * repairs as f64).max(0.0)
        } else {
            base
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            max_repairs: 1,
            attempt_timeout: Duration::from_secs(120),
            backoff: BackoffConfig::standard(),
            cool_down: true,
        }
    }
}

/// Conversation for a repair call: the original prompt, the rejected
/// answer, and the validation failure quoted verbatim.
pub fn repair_messages(prompt: &str, rejected: &str, reason: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::user(prompt),
        ChatMessage::assistant(rejected),
        ChatMessage::user(format!(
            "Your previous response was invalid: {}\n\nReply again with the complete corrected JSON object only.",
            reason
        )),
    ]
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
