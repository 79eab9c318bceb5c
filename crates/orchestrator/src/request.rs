//! Request and Result Model
//!
//! Units of work flowing through the orchestrator and the structured results
//! handlers produce for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request priority; one queue bucket per level
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RequestPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl RequestPriority {
    pub const LEVELS: usize = 4;

    /// Highest priority first
    pub const DESCENDING: [RequestPriority; Self::LEVELS] = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPriority::Low => write!(f, "low"),
            RequestPriority::Normal => write!(f, "normal"),
            RequestPriority::High => write!(f, "high"),
            RequestPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of processing a handler offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    CodeAnalysis,
    Refactoring,
    CodeFix,
    CodeGeneration,
    Validation,
    Documentation,
    Knowledge,
    Design,
    Unknown,
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerType::CodeAnalysis => "code_analysis",
            HandlerType::Refactoring => "refactoring",
            HandlerType::CodeFix => "code_fix",
            HandlerType::CodeGeneration => "code_generation",
            HandlerType::Validation => "validation",
            HandlerType::Documentation => "documentation",
            HandlerType::Knowledge => "knowledge",
            HandlerType::Design => "design",
            HandlerType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A discrete unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub prompt: String,
    pub file_path: Option<PathBuf>,
    pub content: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
    /// Skips intent classification when set
    pub preferred_handler: Option<HandlerType>,
    pub priority: RequestPriority,
    pub created_at: DateTime<Utc>,
    pub requester_id: String,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            prompt: prompt.into(),
            file_path: None,
            content: None,
            context: HashMap::new(),
            preferred_handler: None,
            priority: RequestPriority::Normal,
            created_at: Utc::now(),
            requester_id: "anonymous".to_string(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: Option<String>) -> Self {
        self.file_path = Some(path.into());
        self.content = content;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_preferred_handler(mut self, handler_type: HandlerType) -> Self {
        self.preferred_handler = Some(handler_type);
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = requester_id.into();
        self
    }

    /// Lower-cased file extension, if any
    pub fn file_extension(&self) -> Option<String> {
        self.file_path
            .as_ref()
            .and_then(|p| p.extension())
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }
}

/// Error categories used for retry decisions and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Network,
    RateLimited,
    ServiceUnavailable,
    ResourceExhausted,
    InvalidInput,
    Internal,
    Unavailable,
    Cancelled,
    Routing,
    ClarificationRequired,
    NoApplicableStep,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Routing => "routing",
            ErrorKind::ClarificationRequired => "clarification_required",
            ErrorKind::NoApplicableStep => "no_applicable_step",
        };
        f.write_str(name)
    }
}

/// Error carried by a failed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Structured outcome of processing a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub success: bool,
    pub message: String,
    pub content: Option<String>,
    pub handler_name: Option<String>,
    pub processing_time_ms: u64,
    pub error: Option<ErrorDetail>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RequestResult {
    pub fn success(message: impl Into<String>, content: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            content,
            handler_name: None,
            processing_time_ms: 0,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(message: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            success: false,
            message: message.into(),
            content: None,
            handler_name: None,
            processing_time_ms: 0,
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::failure(
            message.clone(),
            ErrorDetail::new(ErrorKind::Cancelled, message),
        )
    }

    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handler_name = Some(name.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.processing_time_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Cancelled)
    }
}
