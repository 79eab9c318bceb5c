#![allow(clippy::uninlined_format_args)]
//! Basic Orchestration Example
//!
//! Registers two handlers, runs one request directly, one through the
//! workflow, and a batch of prioritised requests through the worker pool.

use anyhow::Result;
use async_trait::async_trait;
use common::{init_structured_logging, LoggingConfig};
use orchestrator::{
    EventTopics, ExecutionMode, HandlerError, HandlerType, OrchestratorConfig, OrchestratorEvent,
    Request, RequestHandler, RequestOrchestrator, RequestPriority, RequestResult,
    EXECUTION_MODE_KEY,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reports line and function counts for the attached content
struct LineCounter;

#[async_trait]
impl RequestHandler for LineCounter {
    fn name(&self) -> &str {
        "line-counter"
    }

    fn handler_type(&self) -> HandlerType {
        HandlerType::CodeAnalysis
    }

    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    async fn execute(
        &self,
        request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError> {
        let content = request.content.as_deref().unwrap_or_default();
        let lines = content.lines().count();
        let functions = content.matches("fn ").count();
        Ok(RequestResult::success(
            format!("{} lines, {} functions", lines, functions),
            Some(format!("lines={} functions={}", lines, functions)),
        )
        .with_metadata("lines", Value::from(lines)))
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["rust".to_string()]
    }
}

/// Pretends to write documentation, slowly
struct DocWriter;

#[async_trait]
impl RequestHandler for DocWriter {
    fn name(&self) -> &str {
        "doc-writer"
    }

    fn handler_type(&self) -> HandlerType {
        HandlerType::Documentation
    }

    fn can_handle(&self, request: &Request) -> bool {
        !request.prompt.trim().is_empty()
    }

    async fn execute(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(HandlerError::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => Ok(RequestResult::success(
                "documentation drafted",
                Some(format!("/// {}", request.prompt)),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_structured_logging(LoggingConfig::default())?;

    println!("🚀 Request Orchestration Example");
    println!("================================\n");

    let config = OrchestratorConfig::from_json_str(
        r#"{
            "worker_count": 2,
            "handlers": {
                "doc-writer": { "max_concurrency": 1, "timeout_ms": 2000 }
            }
        }"#,
    )?;

    let orchestrator = RequestOrchestrator::builder(config)
        .with_handler(Arc::new(LineCounter))
        .with_handler(Arc::new(DocWriter))
        .with_handler_step("line-counter", 10)
        .with_handler_step("doc-writer", 20)
        .build()?;

    let cancel = CancellationToken::new();
    let source = "fn main() {\n    run();\n}\n\nfn run() {}\n";

    println!("📋 Direct request");
    let request = Request::new("analyze this file").with_file("src/main.rs", Some(source.into()));
    let result = orchestrator.process(&request, &cancel).await;
    println!(
        "   {} {} via {:?} ({})\n",
        if result.success { "✅" } else { "❌" },
        result.message,
        result.handler_name,
        result.metadata.get("routing_reason").cloned().unwrap_or(Value::Null)
    );

    println!("🔗 Workflow request");
    let request = Request::new("document the entry point")
        .with_file("src/main.rs", Some(source.into()))
        .with_context(EXECUTION_MODE_KEY, Value::from(ExecutionMode::Workflow.to_string()));
    let result = orchestrator.process(&request, &cancel).await;
    println!(
        "   {} {} steps={}\n",
        if result.success { "✅" } else { "❌" },
        result.message,
        result.metadata.get("workflow_steps").cloned().unwrap_or(Value::Null)
    );

    println!("📬 Queued requests");
    let mut completed = orchestrator.subscribe(EventTopics::REQUEST_COMPLETED);
    let batch = [
        ("document the parser", RequestPriority::Low),
        ("review the scheduler", RequestPriority::Critical),
        ("document the config loader", RequestPriority::Normal),
        ("analyze error handling", RequestPriority::High),
    ];
    for (prompt, priority) in batch {
        let id = orchestrator.submit(
            Request::new(prompt)
                .with_priority(priority)
                .with_content("fn placeholder() {}"),
        )?;
        println!("   queued {} [{}] {}", id, priority, prompt);
    }
    let stats = orchestrator.queue_statistics();
    println!("   queue depth {} {:?}", stats.total_items, stats.items_by_priority);

    orchestrator.start()?;
    for _ in 0..batch.len() {
        let envelope = tokio::time::timeout(Duration::from_secs(5), completed.recv()).await??;
        if let OrchestratorEvent::RequestCompleted {
            request_id,
            handler,
            success,
            duration_ms,
            ..
        } = envelope.payload
        {
            println!(
                "   {} {} by {:?} in {}ms",
                if success { "✅" } else { "❌" },
                request_id,
                handler,
                duration_ms
            );
        }
    }

    println!("\n📊 Handler status");
    for status in orchestrator.handler_statuses() {
        println!(
            "   {} [{}] health={} processed={} avg={:.1}ms",
            status.name,
            status.state,
            status.health,
            status.metrics.processed,
            status.metrics.average_latency_ms
        );
    }

    orchestrator.shutdown().await?;
    println!("\n👋 Orchestrator stopped");
    Ok(())
}
