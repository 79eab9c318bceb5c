#![allow(clippy::uninlined_format_args)]
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]
//! Request Orchestration Core
//!
//! Accepts units of work, queues them by priority, routes each to the most
//! suitable handler and executes it with retries, backoff and health
//! tracking, or runs it through a multi-step workflow.
//!
//! # Architecture
//!
//! - **PriorityTaskQueue**: FIFO bucket per priority level with blocking, cancellable dequeue
//! - **ManagedHandler**: lifecycle, validation, retry, timeouts, metrics and health around any `RequestHandler`
//! - **WorkflowEngine**: ordered steps sharing a `WorkflowContext`, stopping at the first failure
//! - **IntentRouter**: intent classification, rule evaluation and two-tier fallback
//! - **RequestOrchestrator**: composition root with a worker pool
//! - **EventPublisher**: typed events on the shared topic-based event bus
//!
//! # Usage
//!
//! ```no_run
//! use orchestrator::{OrchestratorConfig, Request, RequestOrchestrator, RequestPriority};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(handler: std::sync::Arc<dyn orchestrator::RequestHandler>) -> anyhow::Result<()> {
//! let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default())
//!     .with_handler(handler)
//!     .build()?;
//!
//! // process inline
//! let result = orchestrator
//!     .process(&Request::new("fix the failing test"), &CancellationToken::new())
//!     .await;
//! println!("{}: {}", result.success, result.message);
//!
//! // or queue for the worker pool
//! orchestrator.start()?;
//! orchestrator.submit(Request::new("review this module").with_priority(RequestPriority::High))?;
//!
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod orchestrator;
pub mod queue;
pub mod reliability;
pub mod request;
pub mod routing;
pub mod validation;
pub mod workflow;

pub use config::{
    ConfigError, ConfigurationProvider, ExecutionMode, HandlerConfiguration, OrchestratorConfig,
    RouterConfig,
};
pub use error::HandlerError;
pub use events::{EventPublisher, EventTopics, OrchestratorEvent};
pub use handlers::{
    HandlerDescriptor, HandlerMetrics, HandlerRegistry, HandlerStatus, LifecycleState,
    ManagedHandler, RequestHandler,
};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorError, RequestOrchestrator, EXECUTION_MODE_KEY,
};
pub use queue::{PriorityTaskQueue, QueueConfig, QueueError, QueueItem, QueueStatistics};
pub use reliability::{
    ExecutionOutcome, HealthCheckConfig, HealthStatus, HealthTracker, RetryOutcome, RetryPolicy,
};
pub use request::{
    ErrorDetail, ErrorKind, HandlerType, Request, RequestId, RequestPriority, RequestResult,
};
pub use routing::{
    ClassifierError, FollowUpQuestion, IntentAlternative, IntentClassification, IntentClassifier,
    IntentRouter, KeywordIntentClassifier, RoutingDecision, RoutingError, RoutingRuleEngine,
    RuleBasedRouting,
};
pub use validation::{BasicRequestValidator, RequestValidator, ValidationReport};
pub use workflow::{
    HandlerStep, StepResult, WorkflowContext, WorkflowEngine, WorkflowRunResult, WorkflowStep,
};

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
