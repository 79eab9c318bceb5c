use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::reliability::ExecutionOutcome;

/// Weight of the newest sample in `average_latency_ms`
pub const LATENCY_SMOOTHING: f64 = 0.2;

/// Per-handler counters. Every counter only grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerMetrics {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Cancelled requests; never counted as failed
    pub cancelled: u64,
    /// Retry attempts across all requests
    pub retries: u64,
    /// Exponentially weighted moving average over completed (not cancelled) requests
    pub average_latency_ms: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl HandlerMetrics {
    pub fn record(&mut self, outcome: ExecutionOutcome, duration: Duration, retries: u32) {
        self.processed += 1;
        self.retries += u64::from(retries);
        self.last_activity = Some(Utc::now());
        match outcome {
            ExecutionOutcome::Succeeded => self.succeeded += 1,
            ExecutionOutcome::Failed | ExecutionOutcome::Fatal => self.failed += 1,
            ExecutionOutcome::Cancelled => {
                self.cancelled += 1;
                return;
            }
        }

        let latency = duration.as_secs_f64() * 1000.0;
        if self.succeeded + self.failed == 1 {
            self.average_latency_ms = latency;
        } else {
            self.average_latency_ms += LATENCY_SMOOTHING * (latency - self.average_latency_ms);
        }
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.succeeded + self.failed;
        if completed == 0 {
            0.0
        } else {
            self.succeeded as f64 / completed as f64
        }
    }
}
