//! Orchestration Integration Tests
//!
//! End-to-end behaviour through the public API:
//! - configuration loaded from a JSON file
//! - queued requests processed by the worker pool in priority order
//! - workflow mode with shared context and first-failure stop
//! - validation, cancellation and shutdown

use anyhow::Result;
use async_trait::async_trait;
use orchestrator::{
    BasicRequestValidator, ClassifierError, ErrorDetail, ErrorKind, EventTopics, HandlerError,
    HandlerType, IntentClassification, IntentClassifier, LifecycleState, OrchestratorConfig, OrchestratorEvent, Request, RequestHandler,
    RequestOrchestrator, RequestPriority, RequestResult, StepResult, WorkflowContext,
    WorkflowStep, EXECUTION_MODE_KEY,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records the prompts it handled, in order
struct RecordingHandler {
    name: &'static str,
    handler_type: HandlerType,
    languages: Vec<String>,
    seen: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl RecordingHandler {
    fn new(name: &'static str, handler_type: HandlerType) -> Self {
        Self {
            name,
            handler_type,
            languages: Vec::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    fn languages(mut self, languages: &[&str]) -> Self {
        self.languages = languages.iter().map(|l| l.to_string()).collect();
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    async fn execute(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HandlerError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.seen.lock().push(request.prompt.clone());
        Ok(RequestResult::success(
            format!("{} done", self.name),
            Some(format!("{}: {}", self.name, request.prompt)),
        ))
    }

    fn supported_languages(&self) -> Vec<String> {
        self.languages.clone()
    }
}

/// Fails with a network error a fixed number of times
struct FlakyHandler {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

#[async_trait]
impl RequestHandler for FlakyHandler {
    fn name(&self) -> &str {
        "flaky"
    }

    fn handler_type(&self) -> HandlerType {
        HandlerType::CodeGeneration
    }

    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    async fn execute(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(HandlerError::new(ErrorKind::Network, "connection reset"));
        }
        Ok(RequestResult::success("generated", Some("fn main() {}".to_string())))
    }
}

/// Never answers; gives up only when the request is cancelled
struct StalledClassifier;

#[async_trait]
impl IntentClassifier for StalledClassifier {
    async fn classify(
        &self,
        _request: &Request,
        cancel: &CancellationToken,
    ) -> Result<IntentClassification, ClassifierError> {
        cancel.cancelled().await;
        Err(ClassifierError::Cancelled)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn write_config(json: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(json.as_bytes())?;
    Ok(file)
}

#[tokio::test]
async fn test_scenario_priority_order_through_workers() -> Result<()> {
    init_tracing();
    let recorder = RecordingHandler::new("fixer", HandlerType::CodeFix);
    let seen = recorder.seen.clone();
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig {
        worker_count: 1,
        ..Default::default()
    })
    .with_handler(Arc::new(recorder))
    .build()?;
    let mut completed = orchestrator.subscribe(EventTopics::REQUEST_COMPLETED);

    for priority in [
        RequestPriority::Low,
        RequestPriority::Critical,
        RequestPriority::Normal,
        RequestPriority::High,
    ] {
        orchestrator.submit(
            Request::new(format!("fix {}", priority))
                .with_priority(priority)
                .with_preferred_handler(HandlerType::CodeFix),
        )?;
    }
    assert_eq!(orchestrator.queue_size(), 4);

    orchestrator.start()?;
    for _ in 0..4 {
        tokio::time::timeout(Duration::from_secs(5), completed.recv()).await??;
    }

    let expected: Vec<String> = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ]
    .iter()
    .map(|p| format!("fix {}", p))
    .collect();
    assert_eq!(*seen.lock(), expected);

    orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_config_file_drives_handler_settings() -> Result<()> {
    init_tracing();
    let file = write_config(
        r#"{
            "worker_count": 1,
            "handlers": {
                "flaky": {
                    "timeout_ms": 1000,
                    "retry_policy": {
                        "max_retries": 2,
                        "initial_delay_ms": 1,
                        "jitter": false,
                        "retryable_errors": ["network"]
                    }
                }
            }
        }"#,
    )?;
    let config = OrchestratorConfig::from_json_file(file.path())?;

    let flaky = Arc::new(FlakyHandler {
        remaining_failures: AtomicU32::new(2),
        attempts: AtomicU32::new(0),
    });
    let orchestrator = RequestOrchestrator::builder(config)
        .with_handler(flaky.clone())
        .build()?;

    let request = Request::new("generate a parser").with_preferred_handler(HandlerType::CodeGeneration);
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(result.metadata["retries"], Value::from(2));

    let status = &orchestrator.handler_statuses()[0];
    assert_eq!(status.name, "flaky");
    assert_eq!(status.metrics.retries, 2);
    assert_eq!(status.metrics.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn test_retry_budget_exhausted_is_failure() -> Result<()> {
    let config = OrchestratorConfig::from_json_str(
        r#"{ "default_handler": { "retry_policy": { "max_retries": 1, "initial_delay_ms": 1, "jitter": false } } }"#,
    )?;
    let flaky = Arc::new(FlakyHandler {
        remaining_failures: AtomicU32::new(10),
        attempts: AtomicU32::new(0),
    });
    let orchestrator = RequestOrchestrator::builder(config)
        .with_handler(flaky.clone())
        .build()?;

    let request = Request::new("generate").with_preferred_handler(HandlerType::CodeGeneration);
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Network));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    Ok(())
}

struct DetectLanguageStep;

#[async_trait]
impl WorkflowStep for DetectLanguageStep {
    fn name(&self) -> &str {
        "detect_language"
    }

    fn order(&self) -> i32 {
        0
    }

    fn can_handle(&self, request: &Request) -> bool {
        request.file_path.is_some()
    }

    async fn execute(
        &self,
        request: &Request,
        context: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> StepResult {
        let language = match request.file_extension().as_deref() {
            Some("rs") => "rust",
            Some("py") => "python",
            _ => "unknown",
        };
        context.set_request_context("language", Value::from(language));
        context.insert("language", Value::from(language));
        StepResult::from_result(
            "detect_language",
            RequestResult::success(format!("detected {}", language), None),
        )
    }
}

struct RejectingStep;

#[async_trait]
impl WorkflowStep for RejectingStep {
    fn name(&self) -> &str {
        "review_gate"
    }

    fn order(&self) -> i32 {
        15
    }

    fn can_handle(&self, request: &Request) -> bool {
        request.context.get("language") == Some(&Value::from("python"))
    }

    async fn execute(
        &self,
        _request: &Request,
        _context: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> StepResult {
        StepResult::from_result(
            "review_gate",
            RequestResult::failure(
                "python changes need review",
                ErrorDetail::new(ErrorKind::Validation, "review required"),
            ),
        )
    }
}

fn workflow_orchestrator() -> Result<(RequestOrchestrator, Arc<Mutex<Vec<String>>>)> {
    let docs = RecordingHandler::new("docs", HandlerType::Documentation);
    let docs_seen = docs.seen.clone();
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig {
        execution_mode: orchestrator::ExecutionMode::Workflow,
        ..Default::default()
    })
    .with_handler(Arc::new(RecordingHandler::new("analyzer", HandlerType::CodeAnalysis)))
    .with_handler(Arc::new(docs))
    .with_step(Arc::new(RejectingStep))
    .with_handler_step("docs", 20)
    .with_handler_step("analyzer", 10)
    .with_step(Arc::new(DetectLanguageStep))
    .build()?;
    Ok((orchestrator, docs_seen))
}

#[tokio::test]
async fn test_workflow_runs_steps_in_order_and_shares_context() -> Result<()> {
    let (orchestrator, docs_seen) = workflow_orchestrator()?;
    assert_eq!(
        orchestrator.workflow().step_names(),
        vec!["detect_language", "analyzer", "review_gate", "docs"]
    );

    let request = Request::new("summarize").with_file("src/lib.rs", Some("pub fn f() {}".into()));
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.handler_name.as_deref(), Some("docs"));
    assert_eq!(
        result.metadata["workflow_steps"],
        serde_json::json!(["detect_language", "analyzer", "docs"])
    );
    assert_eq!(result.metadata["workflow_data"]["language"], Value::from("rust"));
    assert_eq!(docs_seen.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_workflow_stops_at_first_failure() -> Result<()> {
    init_tracing();
    let (orchestrator, docs_seen) = workflow_orchestrator()?;
    let mut runs = orchestrator.subscribe(EventTopics::WORKFLOW_RUN_COMPLETED);

    let request = Request::new("summarize").with_file("tool.py", Some("print()".into()));
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
    assert_eq!(result.metadata["workflow_failed_step"], Value::from("review_gate"));
    assert!(docs_seen.lock().is_empty());

    match runs.recv().await?.payload {
        OrchestratorEvent::WorkflowRunCompleted {
            success,
            steps_executed,
            failed_step,
            ..
        } => {
            assert!(!success);
            assert_eq!(steps_executed, 3);
            assert_eq!(failed_step.as_deref(), Some("review_gate"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_direct_override_in_workflow_mode() -> Result<()> {
    let (orchestrator, _) = workflow_orchestrator()?;
    let request = Request::new("review this module for complexity")
        .with_context(EXECUTION_MODE_KEY, Value::from("direct"));

    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.handler_name.as_deref(), Some("analyzer"));
    assert_eq!(result.metadata["execution_mode"], Value::from("direct"));
    Ok(())
}

#[tokio::test]
async fn test_language_fallback_end_to_end() -> Result<()> {
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig {
        router: orchestrator::RouterConfig {
            ask_follow_up: false,
            ..Default::default()
        },
        ..Default::default()
    })
    .with_handler(Arc::new(
        RecordingHandler::new("py-helper", HandlerType::Knowledge).languages(&["python"]),
    ))
    .build()?;

    let request = Request::new("banana").with_file("script.py", Some("x = 1".into()));
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.handler_name.as_deref(), Some("py-helper"));
    assert_eq!(result.metadata["routing_fallback"], Value::from(true));
    assert_eq!(result.metadata["routing_confidence"], Value::from(0.4));
    Ok(())
}

#[tokio::test]
async fn test_validator_rejects_empty_prompt() -> Result<()> {
    let handler = RecordingHandler::new("fixer", HandlerType::CodeFix);
    let seen = handler.seen.clone();
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default())
        .with_handler(Arc::new(handler))
        .with_validator(Arc::new(BasicRequestValidator::default()))
        .build()?;

    let request = Request::new("  ").with_preferred_handler(HandlerType::CodeFix);
    let result = orchestrator.process(&request, &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
    assert!(seen.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_zero_handlers_is_routing_failure() -> Result<()> {
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default()).build()?;
    let result = orchestrator
        .process(&Request::new("fix the bug"), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Routing));
    Ok(())
}

#[tokio::test]
async fn test_process_next_respects_cancellation() -> Result<()> {
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default())
        .with_handler(Arc::new(RecordingHandler::new("fixer", HandlerType::CodeFix)))
        .build()?;

    let cancel = CancellationToken::new();
    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };
    assert!(orchestrator.process_next(&cancel).await?.is_none());
    waiter.await?;
    assert_eq!(orchestrator.queue_size(), 0);

    orchestrator.submit(Request::new("fix it").with_preferred_handler(HandlerType::CodeFix))?;
    let result = orchestrator.process_next(&CancellationToken::new()).await?;
    assert!(result.map(|r| r.success).unwrap_or(false));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_drops_queued_requests_and_stops_handlers() -> Result<()> {
    init_tracing();
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default())
        .with_handler(Arc::new(
            RecordingHandler::new("slow", HandlerType::CodeFix).delay(Duration::from_millis(10)),
        ))
        .build()?;
    let mut completed = orchestrator.subscribe(EventTopics::REQUEST_COMPLETED);

    for i in 0..3 {
        orchestrator.submit(Request::new(format!("fix {}", i)))?;
    }
    orchestrator.shutdown().await?;

    let mut cancelled = 0;
    while let Ok(envelope) = completed.try_recv() {
        if let OrchestratorEvent::RequestCompleted { cancelled: true, .. } = envelope.payload {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, 3);
    assert!(orchestrator
        .handler_statuses()
        .iter()
        .all(|status| status.state == LifecycleState::Stopped));
    assert!(orchestrator.start().is_err());
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_classification_is_cancelled_result() -> Result<()> {
    let handler = RecordingHandler::new("fixer", HandlerType::CodeFix);
    let seen = handler.seen.clone();
    let orchestrator = RequestOrchestrator::builder(OrchestratorConfig::default())
        .with_classifier(Arc::new(StalledClassifier))
        .with_handler(Arc::new(handler))
        .build()?;
    let mut completed = orchestrator.subscribe(EventTopics::REQUEST_COMPLETED);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let result = orchestrator.process(&Request::new("fix the bug"), &cancel).await;

    assert!(result.is_cancelled());
    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert!(result.handler_name.is_none());
    assert!(seen.lock().is_empty());

    let envelope = completed.try_recv()?;
    assert!(matches!(
        envelope.payload,
        OrchestratorEvent::RequestCompleted { cancelled: true, success: false, .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_racing_shutdown_is_always_reported() -> Result<()> {
    init_tracing();
    let orchestrator = Arc::new(
        RequestOrchestrator::builder(OrchestratorConfig {
            event_buffer: 4096,
            ..Default::default()
        })
        .with_handler(Arc::new(RecordingHandler::new("fixer", HandlerType::CodeFix)))
        .build()?,
    );
    let mut completed = orchestrator.subscribe(EventTopics::REQUEST_COMPLETED);
    orchestrator.start()?;

    let producer = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut accepted = 0usize;
            while accepted < 1000 {
                let request = Request::new("fix it").with_preferred_handler(HandlerType::CodeFix);
                if orchestrator.submit(request).is_err() {
                    break;
                }
                accepted += 1;
                tokio::task::yield_now().await;
            }
            accepted
        })
    };
    tokio::time::sleep(Duration::from_millis(2)).await;
    orchestrator.shutdown().await?;
    let accepted = producer.await?;

    let mut reported = 0usize;
    while let Ok(envelope) = completed.try_recv() {
        if let OrchestratorEvent::RequestCompleted { .. } = envelope.payload {
            reported += 1;
        }
    }
    assert_eq!(reported, accepted);
    assert_eq!(orchestrator.queue_size(), 0);
    assert!(orchestrator
        .submit(Request::new("too late"))
        .is_err());
    Ok(())
}
