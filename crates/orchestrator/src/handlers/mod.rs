//! Handler Execution Framework
//!
//! Concrete handlers implement the small [`RequestHandler`] capability trait.
//! [`ManagedHandler`] wraps any of them with lifecycle, validation, retry,
//! timeouts, metrics and health tracking, and [`HandlerRegistry`] holds the
//! managed instances by name.

pub mod managed;
pub mod metrics;
pub mod registry;

pub use managed::{HandlerStatus, ManagedHandler};
pub use metrics::HandlerMetrics;
pub use registry::HandlerRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::request::{HandlerType, Request, RequestResult};

/// Capability implemented by concrete request handlers.
///
/// `execute` reports handled failures as an unsuccessful [`RequestResult`]
/// and unexpected ones as a [`HandlerError`]; only the latter are retried.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handler_type(&self) -> HandlerType;

    fn can_handle(&self, request: &Request) -> bool;

    async fn execute(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<RequestResult, HandlerError>;

    async fn initialize(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Source languages this handler understands, lowercase
    fn supported_languages(&self) -> Vec<String> {
        Vec::new()
    }

    fn supports_language(&self, language: &str) -> bool {
        self.supported_languages()
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(language))
    }
}

/// What the router needs to know about an available handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub name: String,
    pub handler_type: HandlerType,
    pub languages: Vec<String>,
}

impl HandlerDescriptor {
    pub fn new(name: impl Into<String>, handler_type: HandlerType) -> Self {
        Self {
            name: name.into(),
            handler_type,
            languages: Vec::new(),
        }
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(language))
    }
}

/// Lifecycle of a managed handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    /// Ready with at least one request in flight
    Busy,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}
