//! Queue redelivery policy.
//!
//! Decides whether a message whose handler failed goes back on the queue and
//! after how long. Delays use exponential backoff with jitter so replays of
//! a failing stage spread out instead of hammering storage or endpoints in
//! lockstep.

use std::time::Duration;

use chrono::Utc;
use herald_core::retry::{apply_jitter, backoff_delay, BackoffStrategy};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Redelivery configuration for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Maximum handling attempts per message, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
        }
    }
}

/// Outcome of a redelivery decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryDecision {
    /// Put the message back after the delay.
    Redeliver {
        /// How long the message stays invisible
        delay: Duration,
    },
    /// Drop the message.
    Drop {
        /// Why the message will not be retried
        reason: String,
    },
}

impl RedeliveryPolicy {
    /// Decides what happens to a message after its `attempt`-th failure.
    ///
    /// Deferred messages wait for the ledger's window and do not spend an
    /// attempt; callers pass the attempt count they want charged.
    pub fn decide(&self, attempt: u32, error: &DeliveryError) -> RedeliveryDecision {
        if !error.is_retryable() {
            return RedeliveryDecision::Drop { reason: format!("non-retryable error: {error}") };
        }

        if let Some(until) = error.not_before() {
            let wait = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            return RedeliveryDecision::Redeliver {
                delay: wait.clamp(self.base_delay, self.max_delay),
            };
        }

        if attempt >= self.max_attempts {
            return RedeliveryDecision::Drop {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        RedeliveryDecision::Redeliver { delay: self.delay_for(attempt) }
    }

    /// Jittered delay after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            backoff_delay(BackoffStrategy::Exponential, self.base_delay, attempt, self.max_delay);
        apply_jitter(base, self.jitter_factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use herald_core::CoreError;

    use super::*;

    fn policy() -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RedeliveryPolicy { jitter_factor: 0.5, ..policy() };
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn retryable_errors_redeliver_until_exhausted() {
        let policy = policy();
        let error = DeliveryError::network("refused");

        assert!(matches!(policy.decide(1, &error), RedeliveryDecision::Redeliver { .. }));
        assert!(matches!(policy.decide(2, &error), RedeliveryDecision::Redeliver { .. }));
        assert!(matches!(policy.decide(3, &error), RedeliveryDecision::Drop { .. }));
    }

    #[test]
    fn permanent_errors_drop_immediately() {
        let decision = policy().decide(1, &DeliveryError::template("bad"));
        assert!(matches!(decision, RedeliveryDecision::Drop { .. }));
    }

    #[test]
    fn deferred_messages_wait_for_the_window() {
        let until = Utc::now() + chrono::Duration::seconds(5);
        let error = DeliveryError::from(CoreError::RetryNotDue { until });

        match policy().decide(99, &error) {
            RedeliveryDecision::Redeliver { delay } => {
                assert!(delay > Duration::from_secs(3) && delay <= Duration::from_secs(5));
            },
            other => panic!("expected redelivery, got {other:?}"),
        }
    }
}
