//! Retry policies attached to steps.
//!
//! The orchestrator only asks a policy two things: whether another attempt
//! is allowed and how long to wait before it. [`RetryPolicy`] is the
//! bundled exponential-backoff implementation; hosts can plug in their own
//! (circuit breakers, jittered backoff) by implementing [`Policy`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetrySettings;
use crate::domain::StepResult;

/// Retry/backoff strategy consulted between attempts
pub trait Policy: Send + Sync {
    /// Whether another attempt is allowed after `attempt` (1-indexed) failed
    fn should_retry(&self, attempt: u32) -> bool;

    /// Delay to wait before the attempt following `attempt`
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// Predicate a step result must satisfy for an outcome policy to stop retrying
pub type ResultPredicate = Arc<dyn Fn(&StepResult) -> bool + Send + Sync>;

/// How a policy is applied to a step
#[derive(Clone)]
pub enum StepPolicy {
    /// Retry when the step returns an error
    OnFault(Arc<dyn Policy>),

    /// Retry until the step's result satisfies the predicate
    Until {
        policy: Arc<dyn Policy>,
        predicate: ResultPredicate,
    },
}

impl fmt::Debug for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnFault(_) => f.write_str("StepPolicy::OnFault"),
            Self::Until { .. } => f.write_str("StepPolicy::Until"),
        }
    }
}

/// Exponential backoff with a cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    200
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and no delay between them
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Build a policy from configured defaults
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Policy using the retry section of the resolved configuration
    pub fn from_config() -> anyhow::Result<Self> {
        Ok(Self::from_settings(&crate::config::retry_settings()?))
    }
}

impl Policy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_should_retry_counts_first_attempt() {
        let policy = RetryPolicy::immediate(3);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_policy_from_yaml_uses_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 200);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_attempts: 4,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            backoff_multiplier: 3.0,
        };
        let policy = RetryPolicy::from_settings(&settings);

        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(30));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
    }
}
