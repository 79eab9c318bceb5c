//! Request Orchestrator
//!
//! Composition root tying the queue, handler registry, router and workflow
//! engine together. Everything is injected through [`OrchestratorBuilder`];
//! there is no global state.
//!
//! # Request flow
//!
//! 1. `submit` enqueues by the request's priority
//! 2. a worker dequeues the highest-priority request
//! 3. direct mode routes to one handler, workflow mode runs every applicable step
//! 4. a `request.completed` event reports the outcome

use common::event_bus::{EventEnvelope, Topic};
use common::OperationTimer;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigurationProvider, ExecutionMode, OrchestratorConfig};
use crate::error::HandlerError;
use crate::events::{EventPublisher, OrchestratorEvent};
use crate::handlers::{HandlerRegistry, HandlerStatus, ManagedHandler, RequestHandler};
use crate::queue::{PriorityTaskQueue, QueueError, QueueStatistics};
use crate::request::{ErrorDetail, ErrorKind, Request, RequestId, RequestResult};
use crate::routing::{
    IntentClassifier, IntentRouter, KeywordIntentClassifier, RoutingError, RoutingRuleEngine,
    RuleBasedRouting,
};
use crate::validation::RequestValidator;
use crate::workflow::{HandlerStep, WorkflowEngine, WorkflowStep};

/// Context key overriding the configured execution mode for one request
pub const EXECUTION_MODE_KEY: &str = "execution_mode";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("workflow step refers to unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("orchestrator workers are already running")]
    AlreadyRunning,

    #[error("orchestrator has been shut down")]
    ShutDown,

    #[error("handler '{name}' failed to shut down: {source}")]
    HandlerShutdown {
        name: String,
        #[source]
        source: HandlerError,
    },
}

enum StepRegistration {
    Custom(Arc<dyn WorkflowStep>),
    Handler { handler: String, order: i32 },
}

/// Builds a [`RequestOrchestrator`] from explicitly supplied collaborators
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    configuration: Option<Arc<dyn ConfigurationProvider>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    rules: Option<Arc<dyn RoutingRuleEngine>>,
    validator: Option<Arc<dyn RequestValidator>>,
    handlers: Vec<Arc<dyn RequestHandler>>,
    steps: Vec<StepRegistration>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            configuration: None,
            classifier: None,
            rules: None,
            validator: None,
            handlers: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Per-handler settings source; defaults to the orchestrator config itself
    pub fn with_configuration(mut self, provider: Arc<dyn ConfigurationProvider>) -> Self {
        self.configuration = Some(provider);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn RoutingRuleEngine>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Validator applied by every managed handler
    pub fn with_validator(mut self, validator: Arc<dyn RequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_step(mut self, step: Arc<dyn WorkflowStep>) -> Self {
        self.steps.push(StepRegistration::Custom(step));
        self
    }

    /// Run the named handler as a workflow step
    pub fn with_handler_step(mut self, handler: impl Into<String>, order: i32) -> Self {
        self.steps.push(StepRegistration::Handler {
            handler: handler.into(),
            order,
        });
        self
    }

    pub fn build(self) -> Result<RequestOrchestrator, OrchestratorError> {
        self.config.validate()?;

        let events = EventPublisher::new(self.config.event_buffer);
        let provider: Arc<dyn ConfigurationProvider> = match self.configuration {
            Some(provider) => provider,
            None => Arc::new(self.config.clone()),
        };

        let registry = HandlerRegistry::new();
        for handler in self.handlers {
            let handler_config = provider.handler_configuration(handler.name());
            handler_config.validate().map_err(|reason| {
                ConfigError::Invalid(format!("handler '{}': {}", handler.name(), reason))
            })?;
            let mut managed = ManagedHandler::new(handler, handler_config, events.clone());
            if let Some(validator) = &self.validator {
                managed = managed.with_validator(validator.clone());
            }
            registry.register(Arc::new(managed));
        }

        let workflow = WorkflowEngine::new(events.clone());
        for step in self.steps {
            match step {
                StepRegistration::Custom(step) => workflow.register_step(step),
                StepRegistration::Handler { handler, order } => {
                    let managed = registry
                        .get(&handler)
                        .ok_or_else(|| OrchestratorError::UnknownHandler(handler.clone()))?;
                    workflow.register_step(Arc::new(HandlerStep::new(managed, order)));
                }
            }
        }

        let router = IntentRouter::new(
            self.classifier
                .unwrap_or_else(|| Arc::new(KeywordIntentClassifier::default())),
            self.rules
                .unwrap_or_else(|| Arc::new(RuleBasedRouting::default())),
            self.config.router.clone(),
        );
        let queue = PriorityTaskQueue::new(self.config.queue.clone(), events.clone());

        info!(
            handlers = registry.len(),
            workflow_steps = workflow.step_names().len(),
            execution_mode = %self.config.execution_mode,
            workers = self.config.worker_count,
            "Request orchestrator built"
        );

        Ok(RequestOrchestrator {
            core: Arc::new(OrchestratorCore {
                config: self.config,
                queue,
                registry,
                router,
                workflow,
                events,
            }),
            workers: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        })
    }
}

struct OrchestratorCore {
    config: OrchestratorConfig,
    queue: PriorityTaskQueue,
    registry: HandlerRegistry,
    router: IntentRouter,
    workflow: WorkflowEngine,
    events: EventPublisher,
}

impl OrchestratorCore {
    fn execution_mode_for(&self, request: &Request) -> ExecutionMode {
        match request.context.get(EXECUTION_MODE_KEY) {
            Some(Value::String(mode)) => mode.parse().unwrap_or_else(|e| {
                warn!(request_id = %request.id, error = %e, "Ignoring execution mode override");
                self.config.execution_mode
            }),
            Some(other) => {
                warn!(request_id = %request.id, value = %other, "Execution mode override must be a string");
                self.config.execution_mode
            }
            None => self.config.execution_mode,
        }
    }

    async fn process(&self, request: &Request, cancel: &CancellationToken) -> RequestResult {
        let started = Instant::now();
        let mode = self.execution_mode_for(request);
        let mut timer = OperationTimer::new("process_request");
        timer.add_field("request_id", request.id.to_string());
        timer.add_field("execution_mode", mode.to_string());

        let result = if cancel.is_cancelled() {
            RequestResult::cancelled("request cancelled before processing")
        } else {
            match mode {
                ExecutionMode::Direct => self.process_direct(request, cancel).await,
                ExecutionMode::Workflow => self.process_workflow(request, cancel).await,
            }
        };
        let result = result
            .with_metadata("execution_mode", Value::from(mode.to_string()))
            .with_duration(started.elapsed());

        if let Some(handler) = &result.handler_name {
            timer.add_field("handler", handler);
        }
        let outcome: Result<(), &str> = if result.success {
            Ok(())
        } else {
            Err(&result.message)
        };
        let duration_ms = timer.finish_with_result(&outcome);

        self.events.publish(OrchestratorEvent::RequestCompleted {
            request_id: request.id,
            handler: result.handler_name.clone(),
            success: result.success,
            cancelled: result.is_cancelled(),
            duration_ms,
        });
        result
    }

    async fn process_direct(&self, request: &Request, cancel: &CancellationToken) -> RequestResult {
        let handlers = self.registry.available_for(request);
        if handlers.is_empty() {
            return routing_failure(RoutingError::NoHandlersAvailable);
        }

        let selection = if request.preferred_handler.is_some() {
            self.router.select_handler(request, &handlers, cancel).await
        } else {
            let classification = match self.router.classify_intent(request, cancel).await {
                Ok(classification) => classification,
                Err(e) => return routing_failure(e),
            };
            if self.router.config().ask_follow_up {
                if let Some(follow_up) = self.router.follow_up_question(&classification) {
                    info!(
                        request_id = %request.id,
                        intent = %classification.intent,
                        confidence = classification.confidence,
                        "Classification below threshold, asking for clarification"
                    );
                    return RequestResult::failure(
                        follow_up.question.clone(),
                        ErrorDetail::new(
                            ErrorKind::ClarificationRequired,
                            format!(
                                "intent '{}' classified with confidence {:.2}",
                                classification.intent, classification.confidence
                            ),
                        ),
                    )
                    .with_metadata("intent", Value::from(classification.intent.clone()))
                    .with_metadata("confidence", Value::from(classification.confidence))
                    .with_metadata(
                        "alternatives",
                        serde_json::to_value(&follow_up.alternatives).unwrap_or(Value::Null),
                    );
                }
            }
            self.router
                .select_for_classification(&classification, &handlers, cancel)
                .await
        };

        let decision = match selection {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Routing failed");
                return routing_failure(e);
            }
        };

        let handler = match decision
            .handler_name
            .as_deref()
            .and_then(|name| self.registry.get(name))
        {
            Some(handler) => handler,
            None => {
                return routing_failure(RoutingError::NoSuitableHandler {
                    intent: decision.intent.clone(),
                    reason: "selected handler is no longer registered".to_string(),
                })
            }
        };

        debug!(
            request_id = %request.id,
            handler = handler.name(),
            fallback = decision.is_fallback,
            "Dispatching request"
        );
        handler
            .handle(request, cancel)
            .await
            .with_metadata("routing_reason", Value::from(decision.reason))
            .with_metadata("routing_confidence", Value::from(decision.confidence))
            .with_metadata("routing_fallback", Value::from(decision.is_fallback))
    }

    async fn process_workflow(&self, request: &Request, cancel: &CancellationToken) -> RequestResult {
        let run = self.workflow.execute_workflow(request, cancel).await;
        let step_names: Vec<&str> = run
            .step_results
            .iter()
            .map(|step| step.step_name.as_str())
            .collect();

        run.result
            .clone()
            .with_metadata("workflow_run_id", Value::from(run.run_id.to_string()))
            .with_metadata("workflow_steps", Value::from(step_names))
            .with_metadata(
                "workflow_failed_step",
                run.failed_step.clone().map(Value::from).unwrap_or(Value::Null),
            )
            .with_metadata(
                "workflow_data",
                serde_json::to_value(&run.data).unwrap_or(Value::Null),
            )
    }

    /// Report a request that was dropped without processing
    fn abandon(&self, request: &Request) {
        self.events.publish(OrchestratorEvent::RequestCompleted {
            request_id: request.id,
            handler: None,
            success: false,
            cancelled: true,
            duration_ms: 0,
        });
    }
}

fn routing_failure(error: RoutingError) -> RequestResult {
    if error == RoutingError::Cancelled {
        return RequestResult::cancelled("request cancelled during routing");
    }
    RequestResult::failure(
        format!("routing failed: {}", error),
        ErrorDetail::new(ErrorKind::Routing, error.to_string()),
    )
}

async fn worker_loop(worker_id: usize, core: Arc<OrchestratorCore>, stop: CancellationToken) {
    info!(worker_id, "Worker started");
    loop {
        match core.queue.dequeue(&stop).await {
            Ok(Some(request)) => {
                let result = core.process(&request, &stop).await;
                debug!(worker_id, request_id = %request.id, success = result.success, "Worker finished request");
            }
            Ok(None) if stop.is_cancelled() => break,
            Ok(None) => continue,
            Err(QueueError::Disposed) => break,
        }
    }
    info!(worker_id, "Worker stopped");
}

pub struct RequestOrchestrator {
    core: Arc<OrchestratorCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl RequestOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.core.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.core.events
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    pub fn router(&self) -> &IntentRouter {
        &self.core.router
    }

    pub fn workflow(&self) -> &WorkflowEngine {
        &self.core.workflow
    }

    /// Queue `request` by its own priority
    pub fn submit(&self, request: Request) -> Result<RequestId, OrchestratorError> {
        let id = request.id;
        let priority = request.priority;
        self.core.queue.enqueue(request, priority)?;
        Ok(id)
    }

    /// Process `request` immediately, bypassing the queue
    pub async fn process(&self, request: &Request, cancel: &CancellationToken) -> RequestResult {
        self.core.process(request, cancel).await
    }

    /// Dequeue and process one request; `Ok(None)` when cancelled while waiting
    pub async fn process_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RequestResult>, OrchestratorError> {
        match self.core.queue.dequeue(cancel).await? {
            Some(request) => Ok(Some(self.core.process(&request, cancel).await)),
            None => Ok(None),
        }
    }

    /// Spawn the configured number of worker tasks
    pub fn start(&self) -> Result<(), OrchestratorError> {
        if self.stop.is_cancelled() || self.core.queue.is_disposed() {
            return Err(OrchestratorError::ShutDown);
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        for worker_id in 0..self.core.config.worker_count {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                self.core.clone(),
                self.stop.clone(),
            )));
        }
        info!(workers = workers.len(), "Orchestrator workers started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && !self.workers.lock().is_empty()
    }

    /// Stop workers, dispose the queue, drop what is still queued and shut every handler down.
    ///
    /// Dropped requests are reported as cancelled `request.completed` events.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let timer = OperationTimer::new("orchestrator_shutdown");
        info!("Shutting down request orchestrator");
        self.stop.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        // dispose first: a submit racing shutdown either fails or is drained here
        self.core.queue.dispose();
        let dropped = self.core.queue.drain();
        for request in &dropped {
            self.core.abandon(request);
        }
        if !dropped.is_empty() {
            warn!(dropped = dropped.len(), "Dropped queued requests during shutdown");
        }

        let mut first_error = None;
        for handler in self.core.registry.all() {
            if let Err(source) = handler.shutdown().await {
                error!(handler = handler.name(), error = %source, "Handler shutdown failed");
                first_error.get_or_insert(OrchestratorError::HandlerShutdown {
                    name: handler.name().to_string(),
                    source,
                });
            }
        }

        let result = match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        timer.finish_with_result(&result);
        result
    }

    pub fn handler_statuses(&self) -> Vec<HandlerStatus> {
        self.core.registry.statuses()
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        self.core.queue.statistics()
    }

    pub fn queue_size(&self) -> usize {
        self.core.queue.size()
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<OrchestratorEvent>> {
        self.core.events.subscribe(topic)
    }
}
