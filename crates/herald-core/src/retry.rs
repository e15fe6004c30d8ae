//! Backoff strategies shared by subscription retry bookkeeping and queue
//! redelivery.
//!
//! A subscription's [`RetryPolicy`] decides how long the ledger holds back
//! a failing (subscription, document) pair and when it gives up on a
//! revision. Delays are deterministic here; jitter is applied separately by
//! callers that want it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound for a single backoff step.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Linear backoff: delay grows by the base amount each attempt.
    Linear,
    /// Exponential backoff: delay doubles each attempt.
    #[default]
    Exponential,
}

/// Per-subscription retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// How long a change stays deliverable, in seconds; 0 means forever.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Failed attempts tolerated before giving up on a revision.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay growth between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            ttl_seconds: default_ttl_seconds(),
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Base delay.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delivery window for one change, if bounded.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }

    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        backoff_delay(self.backoff, self.interval(), failures, MAX_DELAY)
    }

    /// Returns true once `failures` reaches the attempt budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Computes the delay for an attempt number (1-based), capped at `max`.
///
/// Linear backoff starts at one base interval so the first retry is never
/// immediate.
pub fn backoff_delay(
    strategy: BackoffStrategy,
    base: Duration,
    attempt: u32,
    max: Duration,
) -> Duration {
    let attempt = attempt.max(1);
    let delay = match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let exponent = (attempt - 1).min(20);
            base.saturating_mul(2_u32.saturating_pow(exponent))
        },
    };

    std::cmp::min(delay, max)
}

/// Randomizes a delay by ±`jitter_factor`.
///
/// With `jitter_factor = 0.25`, a 10s delay becomes 7.5s to 12.5s.
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let delays: Vec<_> = (1..=5)
            .map(|attempt| {
                backoff_delay(BackoffStrategy::Exponential, Duration::from_secs(1), attempt, MAX_DELAY)
            })
            .collect();

        assert_eq!(delays, [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec());
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(BackoffStrategy::Linear, base, 1, MAX_DELAY), base);
        assert_eq!(
            backoff_delay(BackoffStrategy::Linear, base, 3, MAX_DELAY),
            Duration::from_secs(15)
        );
        assert_eq!(backoff_delay(BackoffStrategy::Fixed, base, 9, MAX_DELAY), base);
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy { interval_ms: 60_000, ..Default::default() };
        assert_eq!(policy.delay_for(30), MAX_DELAY);
    }

    #[test]
    fn ttl_zero_means_unbounded() {
        let policy = RetryPolicy { ttl_seconds: 0, ..Default::default() };
        assert_eq!(policy.ttl(), None);
        assert_eq!(RetryPolicy::default().ttl(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn exhaustion_counts_failures() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn jitter_stays_in_range() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"interval_ms": 250, "backoff": "linear"}"#).unwrap();
        assert_eq!(policy.interval(), Duration::from_millis(250));
        assert_eq!(policy.backoff, BackoffStrategy::Linear);
        assert_eq!(policy.max_attempts, 10);
    }
}
