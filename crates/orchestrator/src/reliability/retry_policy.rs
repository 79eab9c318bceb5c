//! Retry Policy Implementation
//!
//! Configurable retry logic with exponential backoff and additive jitter.
//! Only error kinds listed in the policy's retryable set are retried;
//! cancellation is never retried.

use crate::error::HandlerError;
use crate::request::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound of the random extra delay, as a fraction of the base delay
pub const MAX_JITTER_FRACTION: f64 = 0.10;

/// Retry configuration for one handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// When false every retry waits `initial_delay_ms`
    pub exponential_backoff: bool,
    pub jitter: bool,
    pub retryable_errors: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            exponential_backoff: true,
            jitter: true,
            retryable_errors: HashSet::from([
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::RateLimited,
                ErrorKind::ServiceUnavailable,
                ErrorKind::ResourceExhausted,
            ]),
        }
    }
}

/// What happened across all attempts of one operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, HandlerError>,
    pub attempts: u32,
    /// Delay slept before each retry, in order
    pub delays: Vec<Duration>,
    /// The final error was retryable but no attempts were left
    pub exhausted: bool,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.delays.len() as u32
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_cancelled())
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_errors = kinds.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) is lower than initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        Ok(())
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::Cancelled && self.retryable_errors.contains(&kind)
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// `initial × multiplier^(attempt − 1)`, capped at `max_delay_ms`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_ms as f64;
        let millis = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1) as i32;
            initial * self.backoff_multiplier.powi(exponent)
        } else {
            initial
        };
        let capped = millis.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt`, with jitter when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable kind,
    /// runs out of retries, or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let mut attempt = 0u32;
        let mut delays = Vec::new();

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(HandlerError::cancelled()),
                    attempts: attempt - 1,
                    delays,
                    exhausted: false,
                };
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                        exhausted: false,
                    };
                }
                Err(error) => error,
            };

            if error.is_cancelled() || cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(HandlerError::cancelled()),
                    attempts: attempt,
                    delays,
                    exhausted: false,
                };
            }

            if !self.is_retryable(error.kind) {
                warn!(
                    error = %error,
                    attempt,
                    "Operation failed with non-retryable error"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    delays,
                    exhausted: false,
                };
            }

            if attempt > self.max_retries {
                warn!(
                    max_retries = self.max_retries,
                    error = %error,
                    "Maximum retry attempts exceeded"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    delays,
                    exhausted: true,
                };
            }

            let delay = self.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying after delay"
            );
            delays.push(delay);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(HandlerError::cancelled()),
                        attempts: attempt,
                        delays,
                        exhausted: false,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Adds between 0 and 10% extra delay; never shortens the delay.
fn add_jitter(delay: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
    delay + delay.mul_f64(fraction)
}
