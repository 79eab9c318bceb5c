//! Handler Health Tracking
//!
//! Health is derived from the most recent execution outcomes and is tracked
//! independently of a handler's lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Health status for a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// No completed execution yet
    Unknown,
    Healthy,
    /// Recent executions failed in a recoverable way
    Warning,
    /// Last execution hit an unexpected error
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Classified outcome of one handled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// Validation failure, handled failure result, or retries exhausted
    Failed,
    /// Error kind outside the retryable set
    Fatal,
    Cancelled,
}

/// Health derivation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Number of recent outcomes kept
    pub window_size: usize,
    /// Failure ratio in the window at or above which a success still reports Warning
    pub warning_failure_ratio: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            warning_failure_ratio: 0.5,
        }
    }
}

/// Status change reported by [`HealthTracker::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

/// Rolling health state for one handler
#[derive(Debug, Clone)]
pub struct HealthTracker {
    config: HealthCheckConfig,
    status: HealthStatus,
    recent: VecDeque<bool>,
    consecutive_failures: u32,
    last_change: Option<DateTime<Utc>>,
}

impl HealthTracker {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(config.window_size.max(1)),
            config,
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_change: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.last_change
    }

    /// Failure ratio over the recent window
    pub fn failure_ratio(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64
    }

    /// Record an outcome; returns the transition when the status changed.
    pub fn record(&mut self, outcome: ExecutionOutcome) -> Option<HealthTransition> {
        let succeeded = match outcome {
            ExecutionOutcome::Cancelled => return None,
            ExecutionOutcome::Succeeded => true,
            ExecutionOutcome::Failed | ExecutionOutcome::Fatal => false,
        };

        if self.recent.len() >= self.config.window_size.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(succeeded);

        if succeeded {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        let next = match outcome {
            ExecutionOutcome::Fatal => HealthStatus::Critical,
            ExecutionOutcome::Failed => HealthStatus::Warning,
            _ if self.failure_ratio() >= self.config.warning_failure_ratio => HealthStatus::Warning,
            _ => HealthStatus::Healthy,
        };
        self.set(next)
    }

    /// Force a status, e.g. when initialization fails
    pub fn set(&mut self, status: HealthStatus) -> Option<HealthTransition> {
        if status == self.status {
            return None;
        }
        let transition = HealthTransition {
            previous: self.status,
            current: status,
        };
        self.status = status;
        self.last_change = Some(Utc::now());
        Some(transition)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}
