//! Managed handler decorator
//!
//! Layers lifecycle, validation, concurrency limits, retry with per-attempt
//! timeouts, metrics and health around any [`RequestHandler`]. `handle` never
//! returns an error: every outcome becomes a [`RequestResult`].

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HandlerDescriptor, HandlerMetrics, LifecycleState, RequestHandler};
use crate::config::{HandlerConfiguration, MAX_HANDLER_CONCURRENCY};
use crate::error::HandlerError;
use crate::events::{EventPublisher, OrchestratorEvent};
use crate::reliability::{ExecutionOutcome, HealthStatus, HealthTracker, HealthTransition};
use crate::request::{ErrorDetail, ErrorKind, HandlerType, Request, RequestResult};
use crate::validation::RequestValidator;

/// Point-in-time view of a managed handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerStatus {
    pub name: String,
    pub handler_type: HandlerType,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub accepting: bool,
    pub active_requests: usize,
    pub metrics: HandlerMetrics,
    pub uptime_ms: u64,
    /// Resident memory of the hosting process
    pub memory_bytes: Option<u64>,
}

pub struct ManagedHandler {
    inner: Arc<dyn RequestHandler>,
    name: String,
    config: HandlerConfiguration,
    validator: Option<Arc<dyn RequestValidator>>,
    events: EventPublisher,
    /// Serialises initialize and shutdown
    lifecycle: AsyncMutex<()>,
    state: RwLock<LifecycleState>,
    accepting: AtomicBool,
    active: AtomicUsize,
    permits: Semaphore,
    metrics: Mutex<HandlerMetrics>,
    health: Mutex<HealthTracker>,
    created_at: Instant,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ManagedHandler {
    pub fn new(
        inner: Arc<dyn RequestHandler>,
        config: HandlerConfiguration,
        events: EventPublisher,
    ) -> Self {
        let health = HealthTracker::new(config.health.clone().unwrap_or_default());
        Self {
            name: inner.name().to_string(),
            permits: Semaphore::new(config.max_concurrency.clamp(1, MAX_HANDLER_CONCURRENCY)),
            inner,
            config,
            validator: None,
            events,
            lifecycle: AsyncMutex::new(()),
            state: RwLock::new(LifecycleState::Uninitialized),
            accepting: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            metrics: Mutex::new(HandlerMetrics::default()),
            health: Mutex::new(health),
            created_at: Instant::now(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn RequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_type(&self) -> HandlerType {
        self.inner.handler_type()
    }

    pub fn config(&self) -> &HandlerConfiguration {
        &self.config
    }

    pub fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor::new(self.name.clone(), self.inner.handler_type())
            .with_languages(self.inner.supported_languages())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Lifecycle state; `Busy` while a request is in flight
    pub fn state(&self) -> LifecycleState {
        let state = *self.state.read();
        if state == LifecycleState::Ready && self.active.load(Ordering::Acquire) > 0 {
            LifecycleState::Busy
        } else {
            state
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.health.lock().status()
    }

    pub fn metrics(&self) -> HandlerMetrics {
        self.metrics.lock().clone()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(handler = %self.name, from = %previous, to = %state, "Handler lifecycle transition");
        }
    }

    /// Run the wrapped handler's initialization once.
    ///
    /// Concurrent callers wait for the first one; later calls return
    /// immediately. A failed initialization leaves the handler
    /// `Uninitialized` so the next call tries again.
    pub async fn initialize(&self) -> Result<(), HandlerError> {
        if *self.state.read() == LifecycleState::Ready {
            return Ok(());
        }

        let _guard = self.lifecycle.lock().await;
        let current = *self.state.read();
        match current {
            LifecycleState::Ready | LifecycleState::Busy => return Ok(()),
            LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                return Err(HandlerError::new(
                    ErrorKind::Unavailable,
                    format!("handler '{}' has been shut down", self.name),
                ));
            }
            LifecycleState::Uninitialized | LifecycleState::Initializing => {}
        }

        self.set_state(LifecycleState::Initializing);
        match self.inner.initialize().await {
            Ok(()) => {
                self.set_state(LifecycleState::Ready);
                info!(handler = %self.name, handler_type = %self.inner.handler_type(), "Handler initialized");
                Ok(())
            }
            Err(e) => {
                self.set_state(LifecycleState::Uninitialized);
                error!(handler = %self.name, error = %e, "Handler initialization failed");
                let transition = self.health.lock().set(HealthStatus::Critical);
                if let Some(transition) = transition {
                    self.publish_health(transition);
                }
                Err(e)
            }
        }
    }

    /// Whether this handler should receive `request`
    pub fn can_handle(&self, request: &Request) -> bool {
        if !self.is_accepting() || !self.config.enabled {
            return false;
        }
        if let Some(preferred) = request.preferred_handler {
            if preferred != self.inner.handler_type() {
                return false;
            }
        }
        self.inner.can_handle(request)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.inner.supports_language(language)
    }

    /// Execute `request` with validation, retry and bookkeeping
    pub async fn handle(&self, request: &Request, cancel: &CancellationToken) -> RequestResult {
        let started = Instant::now();

        if !self.is_accepting() {
            return self.rejected(started, "handler is shutting down");
        }
        if !self.config.enabled {
            return self.rejected(started, "handler is disabled");
        }
        if cancel.is_cancelled() {
            let result = RequestResult::cancelled("request cancelled before execution");
            return self.complete(request, ExecutionOutcome::Cancelled, result, 0, started);
        }

        if let Err(e) = self.initialize().await {
            if e.kind == ErrorKind::Unavailable {
                return self.rejected(started, &e.message);
            }
            let result = RequestResult::failure(
                format!("handler initialization failed: {}", e.message),
                e.into(),
            );
            return self.complete(request, ExecutionOutcome::Fatal, result, 0, started);
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let result = RequestResult::cancelled("request cancelled while waiting for a handler slot");
                return self.complete(request, ExecutionOutcome::Cancelled, result, 0, started);
            }
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.rejected(started, "handler is shutting down"),
            },
        };
        let _active = ActiveGuard::enter(&self.active);

        if let Some(validator) = &self.validator {
            let report = validator.validate(request).await;
            for warning in &report.warnings {
                warn!(handler = %self.name, request_id = %request.id, warning = %warning, "Request validation warning");
            }
            if !report.is_valid {
                let result = RequestResult::failure(
                    "request failed validation",
                    ErrorDetail::new(ErrorKind::Validation, report.error_summary()),
                );
                return self.complete(request, ExecutionOutcome::Failed, result, 0, started);
            }
        }

        let outcome = self
            .config
            .retry_policy
            .execute(cancel, move |attempt| {
                self.execute_attempt(request, cancel, attempt)
            })
            .await;

        let retries = outcome.retries();
        let attempts = outcome.attempts;
        let exhausted = outcome.exhausted;
        let (execution, result) = match outcome.result {
            Ok(result) if result.success => (ExecutionOutcome::Succeeded, result),
            Ok(result) if result.is_cancelled() => (ExecutionOutcome::Cancelled, result),
            Ok(result) => (ExecutionOutcome::Failed, result),
            Err(e) if e.is_cancelled() => (
                ExecutionOutcome::Cancelled,
                RequestResult::cancelled("request cancelled during execution"),
            ),
            Err(e) if exhausted => (
                ExecutionOutcome::Failed,
                RequestResult::failure(
                    format!("retries exhausted after {} attempts: {}", attempts, e.message),
                    e.into(),
                ),
            ),
            Err(e) => (
                ExecutionOutcome::Fatal,
                RequestResult::failure(format!("handler failed: {}", e.message), e.into()),
            ),
        };

        let result = result
            .with_metadata("attempts", serde_json::json!(attempts))
            .with_metadata("retries", serde_json::json!(retries));
        self.complete(request, execution, result, retries, started)
    }

    async fn execute_attempt(
        &self,
        request: &Request,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<RequestResult, HandlerError> {
        if attempt > 1 {
            debug!(handler = %self.name, request_id = %request.id, attempt, "Retrying request");
        }

        let limit = Duration::from_millis(self.config.timeout_ms);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::cancelled()),
            result = tokio::time::timeout(limit, self.inner.execute(request, cancel)) => {
                result.unwrap_or_else(|_| {
                    Err(HandlerError::timeout(format!(
                        "attempt {} exceeded {} ms",
                        attempt, self.config.timeout_ms
                    )))
                })
            }
        }
    }

    fn rejected(&self, started: Instant, reason: &str) -> RequestResult {
        debug!(handler = %self.name, reason, "Request rejected");
        RequestResult::failure(
            format!("handler '{}' rejected the request", self.name),
            ErrorDetail::new(ErrorKind::Unavailable, reason),
        )
        .with_handler(self.name.clone())
        .with_duration(started.elapsed())
    }

    fn complete(
        &self,
        request: &Request,
        outcome: ExecutionOutcome,
        result: RequestResult,
        retries: u32,
        started: Instant,
    ) -> RequestResult {
        let duration = started.elapsed();
        self.metrics.lock().record(outcome, duration, retries);

        let transition = self.health.lock().record(outcome);
        if let Some(transition) = transition {
            self.publish_health(transition);
        }

        let duration_ms = duration.as_millis() as u64;
        match outcome {
            ExecutionOutcome::Succeeded => {
                info!(handler = %self.name, request_id = %request.id, duration_ms, retries, "Request handled")
            }
            ExecutionOutcome::Cancelled => {
                info!(handler = %self.name, request_id = %request.id, duration_ms, "Request cancelled")
            }
            ExecutionOutcome::Failed | ExecutionOutcome::Fatal => warn!(
                handler = %self.name,
                request_id = %request.id,
                duration_ms,
                retries,
                error = ?result.error_kind(),
                "Request failed: {}",
                result.message
            ),
        }

        result.with_handler(self.name.clone()).with_duration(duration)
    }

    fn publish_health(&self, transition: HealthTransition) {
        info!(
            handler = %self.name,
            previous = %transition.previous,
            current = %transition.current,
            "Handler health changed"
        );
        self.events.publish(OrchestratorEvent::HandlerHealthChanged {
            handler: self.name.clone(),
            previous: transition.previous,
            current: transition.current,
            timestamp: Utc::now(),
        });
    }

    /// Stop accepting requests, wait for in-flight ones, then run teardown.
    pub async fn shutdown(&self) -> Result<(), HandlerError> {
        self.accepting.store(false, Ordering::Release);

        let _guard = self.lifecycle.lock().await;
        let previous = *self.state.read();
        if previous == LifecycleState::Stopped {
            return Ok(());
        }
        self.set_state(LifecycleState::ShuttingDown);

        let slots = u32::try_from(self.config.max_concurrency.max(1)).unwrap_or(u32::MAX);
        if let Ok(drained) = self.permits.acquire_many(slots).await {
            drained.forget();
        }
        self.permits.close();

        let result = if previous == LifecycleState::Uninitialized {
            Ok(())
        } else {
            self.inner.shutdown().await
        };
        self.set_state(LifecycleState::Stopped);

        match &result {
            Ok(()) => info!(handler = %self.name, "Handler stopped"),
            Err(e) => error!(handler = %self.name, error = %e, "Handler teardown failed"),
        }
        result
    }

    pub fn status(&self) -> HandlerStatus {
        HandlerStatus {
            name: self.name.clone(),
            handler_type: self.inner.handler_type(),
            state: self.state(),
            health: self.health(),
            accepting: self.is_accepting(),
            active_requests: self.active.load(Ordering::Acquire),
            metrics: self.metrics(),
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
            memory_bytes: process_memory_bytes(),
        }
    }
}

fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    system.process(pid).map(|process| process.memory())
}
