// Pluggable retry policies for failed tasks

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::time::Duration as StdDuration;
use tracing::debug;

use crate::definition::StateId;
use crate::instance::FailureDetail;

/// What the driver does with a state whose task just failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Evaluate the state again on the next tick
    Retry,
    /// Skip the state until the given time
    RetryAt(DateTime<Utc>),
    /// Leave the failing state and activate a designated failure state
    RouteTo(StateId),
    /// Halt the instance until an operator intervenes
    GiveUp { reason: String },
}

#[cfg_attr(test, mockall::automock)]
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, failure: &FailureDetail, now: DateTime<Utc>) -> RetryDecision;
}

/// Keep retrying on every tick; failures stay visible until they clear or an
/// operator steps in
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryForever;

impl RetryPolicy for RetryForever {
    fn decide(&self, _failure: &FailureDetail, _now: DateTime<Utc>) -> RetryDecision {
        RetryDecision::Retry
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxAttempts {
    pub max_attempts: u32,
}

impl MaxAttempts {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl RetryPolicy for MaxAttempts {
    fn decide(&self, failure: &FailureDetail, _now: DateTime<Utc>) -> RetryDecision {
        if failure.attempts >= self.max_attempts {
            RetryDecision::GiveUp {
                reason: format!(
                    "state {} failed {} times (limit {}): {}",
                    failure.state, failure.attempts, self.max_attempts, failure.output
                ),
            }
        } else {
            RetryDecision::Retry
        }
    }
}

/// Doubling delay between attempts, optionally jittered and bounded
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: StdDuration::from_secs(30),
            max_delay: StdDuration::from_secs(30 * 60),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Delay before the attempt following `attempts` failures
    pub fn delay_for(&self, attempts: u32) -> StdDuration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter {
            // Spread retries over the upper half of the window
            let factor: f64 = rand::rng().random_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(&self, failure: &FailureDetail, now: DateTime<Utc>) -> RetryDecision {
        if let Some(max) = self.max_attempts {
            if failure.attempts >= max {
                return RetryDecision::GiveUp {
                    reason: format!(
                        "state {} exhausted {} attempts: {}",
                        failure.state, max, failure.output
                    ),
                };
            }
        }

        let delay = self.delay_for(failure.attempts);
        let retry_at = Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(state = %failure.state, attempts = failure.attempts, delay_ms = delay.as_millis() as u64, "Backing off");
        RetryDecision::RetryAt(retry_at)
    }
}

/// Retry a few times, then move the token to a dead-letter state
#[derive(Debug, Clone)]
pub struct RouteToFailureState {
    pub failure_state: StateId,
    pub after_attempts: u32,
}

impl RouteToFailureState {
    pub fn new(failure_state: impl Into<StateId>, after_attempts: u32) -> Self {
        Self {
            failure_state: failure_state.into(),
            after_attempts,
        }
    }
}

impl RetryPolicy for RouteToFailureState {
    fn decide(&self, failure: &FailureDetail, _now: DateTime<Utc>) -> RetryDecision {
        if failure.state == self.failure_state {
            // Failing inside the failure state itself: nowhere left to route
            return RetryDecision::GiveUp {
                reason: format!("failure state {} failed: {}", failure.state, failure.output),
            };
        }
        if failure.attempts >= self.after_attempts {
            RetryDecision::RouteTo(self.failure_state.clone())
        } else {
            RetryDecision::Retry
        }
    }
}
