//! Job retry policies.
//!
//! Linear backoff (attempt * 1s) is the queue's default — job timeouts are
//! already long, so unbounded exponential growth would blow past a job's own
//! timeout budget before the next attempt even starts. Exponential backoff is
//! kept as an explicit alternative for callers willing to size their timeout
//! around it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

type CustomRetryFn = Box<dyn Fn(u32, &crate::Error) -> Option<Duration> + Send + Sync>;

pub enum RetryPolicy {
    None,
    Linear { unit: Duration, max_attempts: u32 },
    Fixed { delay: Duration, max_attempts: u32 },
    Exponential(ExponentialBackoff),
    Custom(CustomRetryFn),
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::None => f.debug_struct("None").finish(),
            RetryPolicy::Linear { unit, max_attempts } => f
                .debug_struct("Linear")
                .field("unit", unit)
                .field("max_attempts", max_attempts)
                .finish(),
            RetryPolicy::Fixed { delay, max_attempts } => f
                .debug_struct("Fixed")
                .field("delay", delay)
                .field("max_attempts", max_attempts)
                .finish(),
            RetryPolicy::Exponential(backoff) => f.debug_tuple("Exponential").field(backoff).finish(),
            RetryPolicy::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        match self {
            RetryPolicy::None => RetryPolicy::None,
            RetryPolicy::Linear { unit, max_attempts } => RetryPolicy::Linear {
                unit: *unit,
                max_attempts: *max_attempts,
            },
            RetryPolicy::Fixed { delay, max_attempts } => RetryPolicy::Fixed {
                delay: *delay,
                max_attempts: *max_attempts,
            },
            RetryPolicy::Exponential(backoff) => RetryPolicy::Exponential(backoff.clone()),
            RetryPolicy::Custom(_) => RetryPolicy::None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-indexed) retry attempt, or `None` if exhausted.
    pub fn calculate_delay(&self, attempt: u32, error: &crate::Error) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Linear { unit, max_attempts } => {
                if attempt >= *max_attempts {
                    None
                } else {
                    Some(*unit * attempt.max(1))
                }
            }
            RetryPolicy::Fixed { delay, max_attempts } => {
                if attempt >= *max_attempts {
                    None
                } else {
                    Some(*delay)
                }
            }
            RetryPolicy::Exponential(backoff) => backoff.calculate_delay(attempt),
            RetryPolicy::Custom(func) => func(attempt, error),
        }
    }

    pub fn should_retry(&self, error: &crate::Error) -> bool {
        if matches!(error, crate::Error::Cancelled(_)) {
            return false;
        }
        !matches!(self, RetryPolicy::None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Linear {
            unit: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn calculate_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(self.initial_delay);
        }

        let exponent = attempt.saturating_sub(1) as f64;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powf(exponent);
        let delay_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let jitter_range = delay_secs * self.jitter;
        let jitter = if self.jitter > 0.0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            rng.gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Some(Duration::from_secs_f64((delay_secs + jitter).max(0.0)))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// One retry attempt, kept for observability (not persisted separately from the Job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    pub attempted_at: chrono::DateTime<chrono::Utc>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl RetryAttempt {
    pub fn new(attempt: u32, error: impl Into<String>, delay: Duration) -> Self {
        Self {
            attempt,
            error: error.into(),
            delay,
            attempted_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RetryHistory {
    pub attempts: Vec<RetryAttempt>,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self { attempts: Vec::new() }
    }

    pub fn add_attempt(&mut self, attempt: RetryAttempt) {
        self.attempts.push(attempt);
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn total_delay(&self) -> Duration {
        self.attempts.iter().map(|a| a.delay).sum()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = RetryPolicy::Linear {
            unit: Duration::from_secs(1),
            max_attempts: 5,
        };
        let err = crate::Error::Other("boom".into());
        assert_eq!(policy.calculate_delay(1, &err), Some(Duration::from_secs(1)));
        assert_eq!(policy.calculate_delay(2, &err), Some(Duration::from_secs(2)));
        assert_eq!(policy.calculate_delay(3, &err), Some(Duration::from_secs(3)));
    }

    #[test]
    fn linear_backoff_exhausts() {
        let policy = RetryPolicy::Linear {
            unit: Duration::from_secs(1),
            max_attempts: 2,
        };
        let err = crate::Error::Other("boom".into());
        assert_eq!(policy.calculate_delay(2, &err), None);
    }

    #[test]
    fn exponential_backoff_grows() {
        let backoff = ExponentialBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff.calculate_delay(1).unwrap(), Duration::from_secs(1));
        assert_eq!(backoff.calculate_delay(2).unwrap(), Duration::from_secs(2));
        assert_eq!(backoff.calculate_delay(3).unwrap(), Duration::from_secs(4));
    }

    #[test]
    fn cancelled_errors_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&crate::Error::cancelled("user requested")));
    }

    #[test]
    fn retry_history_accumulates() {
        let mut history = RetryHistory::new();
        history.add_attempt(RetryAttempt::new(1, "timeout", Duration::from_secs(1)));
        history.add_attempt(RetryAttempt::new(2, "timeout", Duration::from_secs(2)));
        assert_eq!(history.attempt_count(), 2);
        assert_eq!(history.total_delay(), Duration::from_secs(3));
        assert_eq!(history.last_error(), Some("timeout"));
    }
}
