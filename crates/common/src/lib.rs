//! Shared infrastructure for the orchestration workspace: structured logging
//! setup and a topic-based event bus.

pub mod event_bus;
pub mod structured_logging;

pub use event_bus::{EventBus, EventEnvelope, Topic};
pub use structured_logging::{
    init_structured_logging, ExecutionContext, LoggingConfig, OperationTimer,
    PerformanceMetrics, StructuredLogEntry,
};
