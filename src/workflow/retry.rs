//! Retry logic with exponential backoff for transient fetch failures.
//!
//! Only [`FetchStatus::TransientFailure`] is retried. Permanent failures and
//! access denials move the workflow on to the next candidate immediately.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use doifetch_core::{FetchStatus, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(32), Duration::ZERO);
//!
//! match policy.should_retry(FetchStatus::TransientFailure, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(1));
//!         assert_eq!(attempt, 2);
//!     }
//!     RetryDecision::DoNotRetry { .. } => unreachable!(),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::{DEFAULT_MAX_ATTEMPTS, FetchConfig};
use crate::fetch::FetchStatus;

/// Default base delay for exponential backoff.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default upper bound of the random jitter.
const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same candidate after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Attempt number of the retry (1-indexed, so the first retry is 2).
        attempt: u32,
    },

    /// Give up on this candidate.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Per-candidate retry budget with exponential backoff.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults the delays are about 1s then 2s before the budget of three
/// attempts runs out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts per candidate, including the first.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    /// Upper bound of the uniformly random jitter added to each delay.
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a doubling policy. `max_attempts` is raised to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter,
        }
    }

    /// Builds the policy described by a run configuration.
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_backoff,
            config.max_backoff,
            config.backoff_jitter,
        )
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after attempt number `attempt` ended with `status`.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, status: FetchStatus, attempt: u32) -> RetryDecision {
        match status {
            FetchStatus::TransientFailure => {}
            FetchStatus::Success => {
                return RetryDecision::DoNotRetry {
                    reason: "fetch succeeded".to_string(),
                };
            }
            FetchStatus::PermanentFailure | FetchStatus::AccessDenied => {
                return RetryDecision::DoNotRetry {
                    reason: format!("{status} - retry would not help"),
                };
            }
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff(attempt) + self.random_jitter();
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff after attempt `attempt` failed, without jitter.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
