//! Backoff policies for retried jobs.
//!
//! The index never computes delays itself; the runner asks the job for its
//! policy and stores the resulting due time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::Timestamp;

/// Attempts made by the request-level retry preset.
pub const REMOTE_MAX_ATTEMPTS: u32 = 5;

/// How long to wait before the next attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "serde_millis")]
        delay: Duration,
    },

    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    ///
    /// `jitter` is the fraction of the delay that may be randomly shaved off
    /// (0.0 disables jitter).
    Exponential {
        #[serde(with = "serde_millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "serde_millis")]
        max: Duration,
        jitter: f64,
    },
}

impl BackoffPolicy {
    /// Create a fixed-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create an exponential policy without jitter.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier,
            max,
            jitter: 0.0,
        }
    }

    /// Builder: set the jitter fraction (exponential policies only).
    pub fn with_jitter(self, fraction: f64) -> Self {
        match self {
            Self::Exponential {
                initial,
                multiplier,
                max,
                ..
            } => Self::Exponential {
                initial,
                multiplier,
                max,
                jitter: fraction.clamp(0.0, 1.0),
            },
            fixed => fixed,
        }
    }

    /// Request-level preset: 250ms doubling up to 8s, half jitter.
    pub fn remote_default() -> Self {
        Self::exponential(Duration::from_millis(250), 2.0, Duration::from_secs(8)).with_jitter(0.5)
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: i32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                ..
            } => {
                let exponent = attempt.saturating_sub(1).max(0);
                let millis = initial.as_millis() as f64 * multiplier.powi(exponent);
                let capped = millis.min(max.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: i32) -> Duration {
        let base = self.base_delay(attempt);
        match self {
            Self::Exponential { jitter, .. } if *jitter > 0.0 && !base.is_zero() => {
                // The variant is public, so the fraction may bypass `with_jitter`.
                let jitter = jitter.min(1.0);
                let shave = rand::rng().random_range(0.0..=jitter);
                base.mul_f64(1.0 - shave)
            }
            _ => base,
        }
    }

    /// Absolute time of the next attempt, never further out than `max_backoff` ms.
    pub fn next_run_attempt_time(&self, now: Timestamp, attempt: i32, max_backoff: i64) -> Timestamp {
        let mut delay = self.delay(attempt).as_millis() as i64;
        if max_backoff >= 0 {
            delay = delay.min(max_backoff);
        }
        now.saturating_add(delay)
    }
}

impl Default for BackoffPolicy {
    /// Default policy: one second, doubling, capped at one minute.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole milliseconds.
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
