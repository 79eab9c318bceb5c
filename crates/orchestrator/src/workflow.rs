//! Workflow Engine
//!
//! Runs an ordered list of steps against one request. Steps share a
//! [`WorkflowContext`] owned by the run, so later steps can read what
//! earlier ones produced.
//!
//! # Execution rules
//!
//! - steps run by ascending `order()`; equal orders keep registration order
//! - steps whose `can_handle` is false are skipped
//! - the first failing step ends the run
//! - cancellation is checked before every step

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventPublisher, OrchestratorEvent};
use crate::handlers::ManagedHandler;
use crate::request::{ErrorDetail, ErrorKind, Request, RequestResult};

/// Result of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    pub result: RequestResult,
}

impl StepResult {
    pub fn from_result(step_name: impl Into<String>, result: RequestResult) -> Self {
        Self {
            step_name: step_name.into(),
            success: result.success,
            result,
        }
    }
}

/// State shared by the steps of a single run
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    request: Request,
    step_results: Vec<StepResult>,
    data: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            step_results: Vec::new(),
            data: HashMap::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Add a context entry to the request seen by later steps
    pub fn set_request_context(&mut self, key: impl Into<String>, value: Value) {
        self.request.context.insert(key.into(), value);
    }

    pub fn step_results(&self) -> &[StepResult] {
        &self.step_results
    }

    pub fn last_result(&self) -> Option<&StepResult> {
        self.step_results.last()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }
}

/// One unit of a workflow
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn name(&self) -> &str;

    /// Position in the workflow; lower runs first
    fn order(&self) -> i32;

    fn can_handle(&self, request: &Request) -> bool;

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepResult;
}

/// Outcome of a whole workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunResult {
    pub run_id: Uuid,
    pub success: bool,
    pub cancelled: bool,
    /// Failing step's result, or the last step's result on success
    pub result: RequestResult,
    pub step_results: Vec<StepResult>,
    pub failed_step: Option<String>,
    pub data: HashMap<String, Value>,
    pub duration_ms: u64,
}

pub struct WorkflowEngine {
    steps: RwLock<Vec<Arc<dyn WorkflowStep>>>,
    events: EventPublisher,
}

impl WorkflowEngine {
    pub fn new(events: EventPublisher) -> Self {
        Self {
            steps: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn register_step(&self, step: Arc<dyn WorkflowStep>) {
        let mut steps = self.steps.write();
        let position = steps.partition_point(|existing| existing.order() <= step.order());
        debug!(step = step.name(), order = step.order(), position, "Workflow step registered");
        steps.insert(position, step);
    }

    /// Ordered snapshot of registered steps
    pub fn steps(&self) -> Vec<Arc<dyn WorkflowStep>> {
        self.steps.read().clone()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps
            .read()
            .iter()
            .map(|step| step.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.read().is_empty()
    }

    pub async fn execute_workflow(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> WorkflowRunResult {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let steps = self.steps();
        let mut context = WorkflowContext::new(request.clone());
        let mut failed_step = None;
        let mut cancelled = false;

        info!(run_id = %run_id, request_id = %request.id, steps = steps.len(), "Workflow run started");

        for step in &steps {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let current = context.request().clone();
            if !step.can_handle(&current) {
                debug!(run_id = %run_id, step = step.name(), "Step skipped");
                continue;
            }

            debug!(run_id = %run_id, step = step.name(), "Executing step");
            let step_result = step.execute(&current, &mut context, cancel).await;
            let success = step_result.success;
            let step_cancelled = step_result.result.is_cancelled();
            context.step_results.push(step_result);

            if !success {
                if step_cancelled {
                    cancelled = true;
                }
                failed_step = Some(step.name().to_string());
                break;
            }
        }

        let executed = context.step_results.len();
        let result = if cancelled {
            RequestResult::cancelled(format!("workflow cancelled after {} step(s)", executed))
        } else if let Some(name) = &failed_step {
            warn!(run_id = %run_id, step = %name, "Workflow step failed");
            context
                .last_result()
                .map(|step| step.result.clone())
                .unwrap_or_else(|| {
                    RequestResult::failure(
                        "workflow step failed",
                        ErrorDetail::new(ErrorKind::Internal, name.clone()),
                    )
                })
        } else if let Some(last) = context.last_result() {
            last.result.clone()
        } else {
            RequestResult::failure(
                "no workflow step applies to this request",
                ErrorDetail::new(
                    ErrorKind::NoApplicableStep,
                    format!("{} registered step(s) declined", steps.len()),
                ),
            )
        };

        let success = !cancelled && failed_step.is_none() && executed > 0;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        info!(
            run_id = %run_id,
            request_id = %request.id,
            success,
            cancelled,
            steps_executed = executed,
            duration_ms,
            "Workflow run completed"
        );
        self.events.publish(OrchestratorEvent::WorkflowRunCompleted {
            run_id,
            request_id: request.id,
            success,
            steps_executed: executed,
            failed_step: failed_step.clone(),
            duration_ms,
        });

        WorkflowRunResult {
            run_id,
            success,
            cancelled,
            result: result.with_duration(duration),
            step_results: context.step_results,
            failed_step,
            data: context.data,
            duration_ms,
        }
    }
}

/// Runs a managed handler as a workflow step.
///
/// Successful content is stored in the context data bag under the step name.
pub struct HandlerStep {
    name: String,
    order: i32,
    handler: Arc<ManagedHandler>,
}

impl HandlerStep {
    pub fn new(handler: Arc<ManagedHandler>, order: i32) -> Self {
        Self {
            name: handler.name().to_string(),
            order,
            handler,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl WorkflowStep for HandlerStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn can_handle(&self, request: &Request) -> bool {
        self.handler.can_handle(request)
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let result = self.handler.handle(request, cancel).await;
        if result.success {
            if let Some(content) = &result.content {
                context.insert(self.name.clone(), Value::String(content.clone()));
            }
        }
        StepResult::from_result(self.name.clone(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopics;
    use parking_lot::Mutex;

    struct RecordingStep {
        name: &'static str,
        order: i32,
        fail: bool,
        applies: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingStep {
        fn new(name: &'static str, order: i32, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                order,
                fail: false,
                applies: true,
                log: log.clone(),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn declining(mut self) -> Self {
            self.applies = false;
            self
        }
    }

    #[async_trait]
    impl WorkflowStep for RecordingStep {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn can_handle(&self, _request: &Request) -> bool {
            self.applies
        }

        async fn execute(
            &self,
            _request: &Request,
            context: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> StepResult {
            self.log.lock().push(self.name);
            context.insert(self.name, Value::from(self.order));
            let result = if self.fail {
                RequestResult::failure(
                    format!("{} failed", self.name),
                    ErrorDetail::new(ErrorKind::Internal, "boom"),
                )
            } else {
                RequestResult::success(format!("{} done", self.name), Some(self.name.to_string()))
            };
            StepResult::from_result(self.name, result)
        }
    }

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_steps_run_in_ascending_order() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("C", 3, &log)));
        engine.register_step(Arc::new(RecordingStep::new("A", 1, &log)));
        engine.register_step(Arc::new(RecordingStep::new("B", 2, &log)));

        assert_eq!(engine.step_names(), vec!["A", "B", "C"]);

        let run = engine
            .execute_workflow(&Request::new("go"), &CancellationToken::new())
            .await;

        assert!(run.success);
        assert_eq!(*log.lock(), vec!["A", "B", "C"]);
        assert_eq!(run.step_results.len(), 3);
        assert_eq!(run.result.content.as_deref(), Some("C"));
        assert_eq!(run.data.len(), 3);
    }

    #[tokio::test]
    async fn test_equal_orders_keep_registration_order() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("first", 5, &log)));
        engine.register_step(Arc::new(RecordingStep::new("second", 5, &log)));
        engine.register_step(Arc::new(RecordingStep::new("early", 0, &log)));

        assert_eq!(engine.step_names(), vec!["early", "first", "second"]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_run() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("A", 1, &log)));
        engine.register_step(Arc::new(RecordingStep::new("B", 2, &log).failing()));
        engine.register_step(Arc::new(RecordingStep::new("C", 3, &log)));

        let run = engine
            .execute_workflow(&Request::new("go"), &CancellationToken::new())
            .await;

        assert!(!run.success);
        assert!(!run.cancelled);
        assert_eq!(run.failed_step.as_deref(), Some("B"));
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(run.result.message, "B failed");
        assert_eq!(*log.lock(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_declining_steps_are_skipped() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("A", 1, &log).declining()));
        engine.register_step(Arc::new(RecordingStep::new("B", 2, &log)));

        let run = engine
            .execute_workflow(&Request::new("go"), &CancellationToken::new())
            .await;

        assert!(run.success);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.step_results[0].step_name, "B");
    }

    #[tokio::test]
    async fn test_no_applicable_step_fails() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("A", 1, &log).declining()));

        let run = engine
            .execute_workflow(&Request::new("go"), &CancellationToken::new())
            .await;

        assert!(!run.success);
        assert!(run.step_results.is_empty());
        assert_eq!(run.result.error_kind(), Some(ErrorKind::NoApplicableStep));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let log = log();
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(RecordingStep::new("A", 1, &log)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = engine.execute_workflow(&Request::new("go"), &cancel).await;

        assert!(run.cancelled);
        assert!(!run.success);
        assert!(run.result.is_cancelled());
        assert!(log.lock().is_empty());
    }

    struct LanguageTagger;

    #[async_trait]
    impl WorkflowStep for LanguageTagger {
        fn name(&self) -> &str {
            "tag"
        }

        fn order(&self) -> i32 {
            0
        }

        fn can_handle(&self, _request: &Request) -> bool {
            true
        }

        async fn execute(
            &self,
            _request: &Request,
            context: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> StepResult {
            context.set_request_context("language", Value::from("rust"));
            StepResult::from_result("tag", RequestResult::success("tagged", None))
        }
    }

    struct LanguageReader;

    #[async_trait]
    impl WorkflowStep for LanguageReader {
        fn name(&self) -> &str {
            "read"
        }

        fn order(&self) -> i32 {
            1
        }

        fn can_handle(&self, request: &Request) -> bool {
            request.context.contains_key("language")
        }

        async fn execute(
            &self,
            request: &Request,
            _context: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> StepResult {
            let language = request.context["language"].as_str().unwrap_or_default().to_string();
            StepResult::from_result("read", RequestResult::success("read", Some(language)))
        }
    }

    #[tokio::test]
    async fn test_later_steps_see_enriched_request() {
        let engine = WorkflowEngine::new(EventPublisher::default());
        engine.register_step(Arc::new(LanguageReader));
        engine.register_step(Arc::new(LanguageTagger));

        let run = engine
            .execute_workflow(&Request::new("go"), &CancellationToken::new())
            .await;

        assert!(run.success);
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(run.result.content.as_deref(), Some("rust"));
    }

    #[tokio::test]
    async fn test_run_completed_event() {
        let events = EventPublisher::default();
        let mut completed = events.subscribe(EventTopics::WORKFLOW_RUN_COMPLETED);
        let log = log();
        let engine = WorkflowEngine::new(events);
        engine.register_step(Arc::new(RecordingStep::new("only", 1, &log).failing()));

        let request = Request::new("go");
        let run = engine.execute_workflow(&request, &CancellationToken::new()).await;

        match completed.recv().await.unwrap().payload {
            OrchestratorEvent::WorkflowRunCompleted {
                run_id,
                request_id,
                success,
                steps_executed,
                failed_step,
                ..
            } => {
                assert_eq!(run_id, run.run_id);
                assert_eq!(request_id, request.id);
                assert!(!success);
                assert_eq!(steps_executed, 1);
                assert_eq!(failed_step.as_deref(), Some("only"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
