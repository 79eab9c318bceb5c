//! Handler Reliability Module
//!
//! Retry with exponential backoff and outcome-derived health tracking for
//! request handlers.

pub mod health;
pub mod retry_policy;

pub use health::{
    ExecutionOutcome, HealthCheckConfig, HealthStatus, HealthTracker, HealthTransition,
};
pub use retry_policy::{RetryOutcome, RetryPolicy, MAX_JITTER_FRACTION};
