//! Orchestrator Events
//!
//! Typed notifications for external telemetry and UI, published on the shared
//! topic-based [`EventBus`]. Components receive an [`EventPublisher`] at
//! construction time instead of exposing multicast callbacks.

use chrono::{DateTime, Utc};
use common::event_bus::{EventBus, EventEnvelope, Topic};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::reliability::HealthStatus;
use crate::request::{RequestId, RequestPriority};

/// Event topics emitted by the orchestration core
pub struct EventTopics;

impl EventTopics {
    pub const QUEUE_ENQUEUED: Topic = Topic("queue.enqueued");
    pub const QUEUE_DEQUEUED: Topic = Topic("queue.dequeued");
    pub const HANDLER_HEALTH_CHANGED: Topic = Topic("handler.health_changed");
    pub const WORKFLOW_RUN_COMPLETED: Topic = Topic("workflow.run_completed");
    pub const REQUEST_COMPLETED: Topic = Topic("request.completed");

    pub fn all() -> [Topic; 5] {
        [
            Self::QUEUE_ENQUEUED,
            Self::QUEUE_DEQUEUED,
            Self::HANDLER_HEALTH_CHANGED,
            Self::WORKFLOW_RUN_COMPLETED,
            Self::REQUEST_COMPLETED,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Enqueued {
        request_id: RequestId,
        priority: RequestPriority,
    },
    Dequeued {
        request_id: RequestId,
        priority: RequestPriority,
        wait_time_ms: u64,
    },
    HandlerHealthChanged {
        handler: String,
        previous: HealthStatus,
        current: HealthStatus,
        timestamp: DateTime<Utc>,
    },
    WorkflowRunCompleted {
        run_id: Uuid,
        request_id: RequestId,
        success: bool,
        steps_executed: usize,
        failed_step: Option<String>,
        duration_ms: u64,
    },
    RequestCompleted {
        request_id: RequestId,
        handler: Option<String>,
        success: bool,
        cancelled: bool,
        duration_ms: u64,
    },
}

impl OrchestratorEvent {
    pub fn topic(&self) -> Topic {
        match self {
            OrchestratorEvent::Enqueued { .. } => EventTopics::QUEUE_ENQUEUED,
            OrchestratorEvent::Dequeued { .. } => EventTopics::QUEUE_DEQUEUED,
            OrchestratorEvent::HandlerHealthChanged { .. } => EventTopics::HANDLER_HEALTH_CHANGED,
            OrchestratorEvent::WorkflowRunCompleted { .. } => EventTopics::WORKFLOW_RUN_COMPLETED,
            OrchestratorEvent::RequestCompleted { .. } => EventTopics::REQUEST_COMPLETED,
        }
    }
}

/// Cloneable handle for publishing and subscribing to orchestrator events
#[derive(Clone, Default)]
pub struct EventPublisher {
    bus: EventBus<OrchestratorEvent>,
}

impl EventPublisher {
    pub fn new(buffer: usize) -> Self {
        Self {
            bus: EventBus::new(buffer),
        }
    }

    /// Publish on the event's own topic; returns the number of receivers.
    pub fn publish(&self, event: OrchestratorEvent) -> usize {
        self.bus.publish(event.topic(), event)
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<OrchestratorEvent>> {
        self.bus.subscribe(topic)
    }

    /// Stream of payloads on `topic`; lagged notifications are skipped.
    pub fn stream(&self, topic: Topic) -> impl Stream<Item = OrchestratorEvent> + Send + 'static {
        BroadcastStream::new(self.bus.subscribe(topic))
            .filter_map(|item| item.ok().map(|envelope| envelope.payload))
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.bus.subscriber_count(topic)
    }
}
