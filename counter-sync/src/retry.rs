use std::str::FromStr;
use std::time;

use thiserror::Error;

/// How long to wait before re-attempting a flush that failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every consecutive failure.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Retry as soon as the failed call resolves.
    pub fn immediate() -> Self {
        Self::new(1, time::Duration::ZERO, None)
    }

    /// Calculate the time until the next retry given how many attempts in a row have failed.
    /// `attempt` is zero based: the first retry after the first failure uses `initial_interval`.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(10),
            maximum_interval: Some(time::Duration::from_secs(1)),
        }
    }
}

/// What the reconciler does after a flush fails and its batch has been folded back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryMode {
    /// Leave the folded-back amount pending until the next increment for the same key (or an
    /// explicit `Reconciler::retrigger_idle`) starts another flush.
    AwaitNextTrigger,
    /// Retry on our own after the policy's backoff, unless another flush got there first.
    Backoff(RetryPolicy),
}

impl Default for RetryMode {
    fn default() -> Self {
        RetryMode::Backoff(RetryPolicy::default())
    }
}

/// Name of a `RetryMode`, as read from the environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryModeName {
    AwaitNextTrigger,
    Backoff,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown retry mode: {0}")]
pub struct ParseRetryModeError(pub String);

impl FromStr for RetryModeName {
    type Err = ParseRetryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "await_next_trigger" | "await-next-trigger" => Ok(RetryModeName::AwaitNextTrigger),
            "backoff" => Ok(RetryModeName::Backoff),
            other => Err(ParseRetryModeError(other.to_owned())),
        }
    }
}
