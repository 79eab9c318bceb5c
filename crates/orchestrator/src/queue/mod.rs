//! Priority Task Queue
//!
//! In-memory queue with one FIFO bucket per priority level and a counting
//! semaphore tracking how many items are available across all buckets.
//!
//! - enqueue pushes into its bucket, then adds one permit
//! - dequeue waits for a permit (or cancellation), consumes it, and pops from
//!   the highest non-empty bucket
//!
//! Each bucket has its own lock so producers of different priorities never
//! contend, and no lock is held while a consumer waits.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventPublisher, OrchestratorEvent};
use crate::request::{Request, RequestPriority};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue has been disposed")]
    Disposed,
}

/// Queue tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum age of a statistics snapshot before it is recomputed
    pub statistics_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            statistics_interval_ms: 30_000,
        }
    }
}

/// A request waiting in the queue
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub request: Request,
    pub priority: RequestPriority,
    pub enqueued_at: Instant,
}

/// Snapshot of queue state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total_items: usize,
    pub items_by_priority: HashMap<RequestPriority, usize>,
    /// Dequeues per second over the last refresh window
    pub throughput_per_sec: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub computed_at: DateTime<Utc>,
}

struct StatisticsCache {
    snapshot: Option<QueueStatistics>,
    refreshed_at: Instant,
    dequeued_at_refresh: u64,
}

pub struct PriorityTaskQueue {
    buckets: [Mutex<VecDeque<QueueItem>>; RequestPriority::LEVELS],
    available: Semaphore,
    events: EventPublisher,
    config: QueueConfig,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    stats: RwLock<StatisticsCache>,
}

impl PriorityTaskQueue {
    pub fn new(config: QueueConfig, events: EventPublisher) -> Self {
        let now = Instant::now();
        Self {
            buckets: Default::default(),
            available: Semaphore::new(0),
            events,
            config,
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            stats: RwLock::new(StatisticsCache {
                snapshot: None,
                refreshed_at: now,
                dequeued_at_refresh: 0,
            }),
        }
    }

    fn bucket(&self, priority: RequestPriority) -> &Mutex<VecDeque<QueueItem>> {
        &self.buckets[priority.index()]
    }

    pub fn is_disposed(&self) -> bool {
        self.available.is_closed()
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_disposed() {
            Err(QueueError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Store `request` in the bucket for `priority` and signal one waiter.
    pub fn enqueue(&self, request: Request, priority: RequestPriority) -> Result<(), QueueError> {
        let request_id = request.id;
        {
            // checked under the bucket lock so `drain` after `dispose` sees every accepted item
            let mut bucket = self.bucket(priority).lock();
            self.ensure_open()?;
            bucket.push_back(QueueItem {
                request,
                priority,
                enqueued_at: Instant::now(),
            });
        }
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.available.add_permits(1);

        debug!(request_id = %request_id, priority = %priority, "Request enqueued");
        self.events.publish(OrchestratorEvent::Enqueued {
            request_id,
            priority,
        });
        Ok(())
    }

    /// Wait for the highest-priority request.
    ///
    /// Returns `Ok(None)` when `cancel` fires first; the queue is left
    /// untouched in that case.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Request>, QueueError> {
        self.ensure_open()?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            permit = self.available.acquire() => permit.map_err(|_| QueueError::Disposed)?,
        };
        permit.forget();

        Ok(self.pop_highest().map(|item| self.finish_dequeue(item)))
    }

    /// Non-blocking dequeue
    pub fn try_dequeue(&self) -> Result<Option<Request>, QueueError> {
        self.ensure_open()?;
        match self.available.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(self.pop_highest().map(|item| self.finish_dequeue(item)))
            }
            Err(tokio::sync::TryAcquireError::Closed) => Err(QueueError::Disposed),
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(None),
        }
    }

    fn pop_highest(&self) -> Option<QueueItem> {
        for priority in RequestPriority::DESCENDING {
            if let Some(item) = self.bucket(priority).lock().pop_front() {
                return Some(item);
            }
        }
        warn!("Queue signalled an available item but every bucket was empty");
        None
    }

    fn finish_dequeue(&self, item: QueueItem) -> Request {
        let wait_time = item.enqueued_at.elapsed();
        self.total_dequeued.fetch_add(1, Ordering::Relaxed);

        debug!(
            request_id = %item.request.id,
            priority = %item.priority,
            wait_time_ms = wait_time.as_millis() as u64,
            "Request dequeued"
        );
        self.events.publish(OrchestratorEvent::Dequeued {
            request_id: item.request.id,
            priority: item.priority,
            wait_time_ms: wait_time.as_millis() as u64,
        });
        item.request
    }

    /// Items currently queued across all buckets
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Remove every queued item; returns how many were removed.
    ///
    /// One permit is consumed per removed item so the availability signal
    /// stays equal to the number of claimable items.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
            if self.pop_highest().is_some() {
                removed += 1;
            }
        }
        info!(removed, "Queue cleared");
        removed
    }

    /// Take every queued item, highest priority first.
    ///
    /// Does not wait on the availability signal, so it also works on a
    /// disposed queue. Nothing can be enqueued once `dispose` has returned,
    /// so a drain after dispose leaves the queue empty for good.
    pub fn drain(&self) -> Vec<Request> {
        let mut drained = Vec::new();
        for priority in RequestPriority::DESCENDING {
            let items: Vec<QueueItem> = self.bucket(priority).lock().drain(..).collect();
            drained.extend(items.into_iter().map(|item| item.request));
        }
        if !self.is_disposed() {
            for _ in 0..drained.len() {
                match self.available.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
            }
        }
        info!(drained = drained.len(), "Queue drained");
        drained
    }

    /// Fail all pending and future operations with [`QueueError::Disposed`].
    pub fn dispose(&self) {
        if !self.is_disposed() {
            self.available.close();
            info!(remaining = self.size(), "Queue disposed");
        }
    }

    /// Cached statistics, recomputed once older than the configured interval
    pub fn statistics(&self) -> QueueStatistics {
        let interval = Duration::from_millis(self.config.statistics_interval_ms);
        {
            let cache = self.stats.read();
            if let Some(snapshot) = &cache.snapshot {
                if cache.refreshed_at.elapsed() < interval {
                    return snapshot.clone();
                }
            }
        }
        self.refresh_statistics()
    }

    /// Recompute statistics immediately
    pub fn refresh_statistics(&self) -> QueueStatistics {
        let mut cache = self.stats.write();
        let now = Instant::now();
        let dequeued = self.total_dequeued.load(Ordering::Relaxed);

        let window = now.duration_since(cache.refreshed_at).as_secs_f64();
        let throughput_per_sec = if window > 0.0 {
            (dequeued - cache.dequeued_at_refresh) as f64 / window
        } else {
            0.0
        };

        let items_by_priority: HashMap<RequestPriority, usize> = RequestPriority::DESCENDING
            .iter()
            .map(|priority| (*priority, self.bucket(*priority).lock().len()))
            .collect();

        let snapshot = QueueStatistics {
            total_items: items_by_priority.values().sum(),
            items_by_priority,
            throughput_per_sec,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: dequeued,
            computed_at: Utc::now(),
        };
        cache.snapshot = Some(snapshot.clone());
        cache.refreshed_at = now;
        cache.dequeued_at_refresh = dequeued;
        snapshot
    }
}
