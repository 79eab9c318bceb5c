//! Reliability Integration Tests
//!
//! Retry and health behaviour as seen from outside the crate:
//! - backoff curve and retry budget of `RetryPolicy`
//! - jitter bounds
//! - cancellation during backoff
//! - health transitions of a managed handler

use anyhow::Result;
use async_trait::async_trait;
use orchestrator::{
    ErrorKind, EventPublisher, EventTopics, HandlerConfiguration, HandlerError, HandlerType,
    HealthStatus, ManagedHandler, OrchestratorEvent, Request, RequestHandler, RequestResult,
    RetryPolicy,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn fixed_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay_ms: 20,
        jitter: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_backoff_curve_until_budget_exhausted() -> Result<()> {
    let policy = fixed_policy(3);
    let calls = AtomicU32::new(0);

    let outcome = policy
        .execute(&CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::new(ErrorKind::Network, "unreachable")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(
        outcome.delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80)
        ]
    );
    assert!(outcome.exhausted);
    assert_eq!(outcome.retries(), 3);
    Ok(())
}

#[tokio::test]
async fn test_success_on_second_attempt() -> Result<()> {
    let policy = fixed_policy(3);

    let outcome = policy
        .execute(&CancellationToken::new(), |attempt| async move {
            if attempt < 2 {
                Err(HandlerError::timeout("slow upstream"))
            } else {
                Ok(attempt)
            }
        })
        .await;

    assert_eq!(outcome.result?, 2);
    assert_eq!(outcome.delays, vec![Duration::from_millis(20)]);
    assert!(!outcome.exhausted);
    Ok(())
}

#[tokio::test]
async fn test_non_retryable_error_is_not_retried() {
    let outcome = fixed_policy(5)
        .execute(&CancellationToken::new(), |_| async {
            Err::<(), _>(HandlerError::new(ErrorKind::InvalidInput, "bad input"))
        })
        .await;

    assert_eq!(outcome.attempts, 1);
    assert!(outcome.delays.is_empty());
    assert!(!outcome.exhausted);
    assert_eq!(outcome.result.map_err(|e| e.kind), Err(ErrorKind::InvalidInput));
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let policy = RetryPolicy {
        max_retries: 3,
        initial_delay_ms: 10_000,
        max_delay_ms: 10_000,
        jitter: false,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = policy
        .execute(&cancel, |_| async {
            Err::<(), _>(HandlerError::new(ErrorKind::ServiceUnavailable, "down"))
        })
        .await;

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.attempts, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_jitter_stays_within_bounds() {
    let policy = RetryPolicy {
        initial_delay_ms: 1_000,
        jitter: true,
        ..Default::default()
    };
    for attempt in 1..=4 {
        let base = policy.base_delay(attempt);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(orchestrator::reliability::MAX_JITTER_FRACTION));
        }
    }
}

#[test]
fn test_delay_is_capped() {
    let policy = RetryPolicy {
        initial_delay_ms: 1_000,
        max_delay_ms: 3_000,
        jitter: false,
        ..Default::default()
    };
    assert_eq!(policy.base_delay(1), Duration::from_millis(1_000));
    assert_eq!(policy.base_delay(2), Duration::from_millis(2_000));
    assert_eq!(policy.base_delay(3), Duration::from_millis(3_000));
    assert_eq!(policy.base_delay(10), Duration::from_millis(3_000));
}

/// Replays a fixed script of outcomes, then succeeds
struct ScriptedHandler {
    script: Mutex<VecDeque<ErrorKind>>,
}

impl ScriptedHandler {
    fn new(script: impl IntoIterator<Item = ErrorKind>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
        })
    }
}

#[async_trait]
impl RequestHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn handler_type(&self) -> HandlerType {
        HandlerType::CodeFix
    }

    fn can_handle(&self, _request: &Request) -> bool {
        true
    }

    async fn execute(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError> {
        match self.script.lock().pop_front() {
            Some(kind) => Err(HandlerError::new(kind, "scripted failure")),
            None => Ok(RequestResult::success("ok", None)),
        }
    }
}

fn managed(handler: Arc<ScriptedHandler>, policy: RetryPolicy, events: EventPublisher) -> ManagedHandler {
    ManagedHandler::new(
        handler,
        HandlerConfiguration {
            retry_policy: policy,
            ..Default::default()
        },
        events,
    )
}

#[tokio::test]
async fn test_managed_handler_waits_between_attempts() -> Result<()> {
    let handler = managed(
        ScriptedHandler::new([ErrorKind::RateLimited, ErrorKind::RateLimited]),
        fixed_policy(3),
        EventPublisher::new(16),
    );

    let started = Instant::now();
    let result = handler
        .handle(&Request::new("fix"), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(handler.metrics().retries, 2);
    assert_eq!(handler.health(), HealthStatus::Healthy);
    Ok(())
}

#[tokio::test]
async fn test_health_transitions_follow_outcomes() -> Result<()> {
    let events = EventPublisher::new(16);
    let mut health_events = events.subscribe(EventTopics::HANDLER_HEALTH_CHANGED);
    let scripted = ScriptedHandler::new([ErrorKind::Internal]);
    let handler = managed(scripted.clone(), RetryPolicy::no_retry(), events);
    assert_eq!(handler.health(), HealthStatus::Unknown);

    let fatal = handler
        .handle(&Request::new("fix"), &CancellationToken::new())
        .await;
    assert!(!fatal.success);
    assert_eq!(handler.health(), HealthStatus::Critical);

    let recovered = handler
        .handle(&Request::new("fix"), &CancellationToken::new())
        .await;
    assert!(recovered.success);
    assert_ne!(handler.health(), HealthStatus::Critical);

    scripted.script.lock().push_back(ErrorKind::Network);
    let exhausted = handler
        .handle(&Request::new("fix"), &CancellationToken::new())
        .await;
    assert_eq!(exhausted.error_kind(), Some(ErrorKind::Network));
    assert_eq!(handler.health(), HealthStatus::Warning);

    let mut transitions = Vec::new();
    while let Ok(envelope) = health_events.try_recv() {
        if let OrchestratorEvent::HandlerHealthChanged { current, .. } = envelope.payload {
            transitions.push(current);
        }
    }
    assert_eq!(transitions.first(), Some(&HealthStatus::Critical));
    assert_eq!(transitions.last(), Some(&HealthStatus::Warning));

    let metrics = handler.metrics();
    assert_eq!(metrics.processed, 3);
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_request_does_not_touch_health() -> Result<()> {
    let handler = managed(
        ScriptedHandler::new([ErrorKind::Timeout]),
        RetryPolicy {
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            jitter: false,
            ..Default::default()
        },
        EventPublisher::new(16),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = handler.handle(&Request::new("fix"), &cancel).await;

    assert!(result.is_cancelled());
    assert_eq!(handler.health(), HealthStatus::Unknown);
    assert_eq!(handler.metrics().cancelled, 1);
    assert_eq!(handler.metrics().failed, 0);
    Ok(())
}
