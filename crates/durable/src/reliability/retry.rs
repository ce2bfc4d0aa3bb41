//! Step retry policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retries never back off past one hour.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// Retry configuration for a step
///
/// Steps run at most once when retries are disabled. With retries enabled,
/// attempts are spaced by an exponentially growing interval.
///
/// # Example
///
/// ```
/// use oxbow_durable::StepRetryPolicy;
/// use std::time::Duration;
///
/// let policy = StepRetryPolicy::retrying()
///     .with_max_attempts(5)
///     .with_interval(Duration::from_millis(500));
///
/// // First retry after 0.5s, second after 1s, third after 2s, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRetryPolicy {
    /// Whether failed attempts are retried at all
    pub retries_allowed: bool,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Multiplier applied to the interval after each failed attempt
    pub backoff_rate: f64,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self {
            retries_allowed: false,
            interval: Duration::from_secs(1),
            max_attempts: 3,
            backoff_rate: 2.0,
        }
    }
}

impl StepRetryPolicy {
    /// A policy that runs the step exactly once
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// A policy with retries enabled and default spacing
    pub fn retrying() -> Self {
        Self {
            retries_allowed: true,
            ..Self::default()
        }
    }

    /// Set the delay before the first retry
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_rate(mut self, backoff_rate: f64) -> Self {
        self.backoff_rate = backoff_rate;
        self
    }

    /// Number of attempts the engine will make under this policy
    pub fn allowed_attempts(&self) -> u32 {
        if self.retries_allowed {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Grow an interval by the backoff rate, capped at one hour
    pub fn next_interval(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.backoff_rate;
        Duration::from_secs_f64(grown.min(MAX_RETRY_INTERVAL.as_secs_f64()))
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = StepRetryPolicy::default();
        assert!(!policy.retries_allowed);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_rate, 2.0);
    }

    #[test]
    fn test_allowed_attempts() {
        assert_eq!(StepRetryPolicy::no_retry().allowed_attempts(), 1);
        assert_eq!(StepRetryPolicy::retrying().allowed_attempts(), 3);
        assert_eq!(
            StepRetryPolicy::retrying().with_max_attempts(7).allowed_attempts(),
            7
        );
    }

    #[test]
    fn test_backoff_growth() {
        let policy = StepRetryPolicy::retrying();
        let first = policy.interval;
        let second = policy.next_interval(first);
        let third = policy.next_interval(second);

        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(third, Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = StepRetryPolicy::retrying().with_backoff_rate(10.0);
        let long = policy.next_interval(Duration::from_secs(3000));
        assert_eq!(long, Duration::from_secs(3600));
    }

    #[test]
    fn test_max_attempts_floor() {
        let policy = StepRetryPolicy::retrying().with_max_attempts(0);
        assert_eq!(policy.allowed_attempts(), 1);
    }

    #[test]
    fn test_serialization() {
        let policy = StepRetryPolicy::retrying().with_interval(Duration::from_millis(250));
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: StepRetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
