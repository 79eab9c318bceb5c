//! Error raised by handler bodies and workflow steps.

use crate::request::{ErrorDetail, ErrorKind};
use thiserror::Error;

/// Tagged error returned by a handler's `execute`.
///
/// The kind decides whether the retry loop tries again; the message is kept
/// for diagnostics only.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<HandlerError> for ErrorDetail {
    fn from(error: HandlerError) -> Self {
        ErrorDetail::new(error.kind, error.message)
    }
}

impl From<&HandlerError> for ErrorDetail {
    fn from(error: &HandlerError) -> Self {
        ErrorDetail::new(error.kind, error.message.clone())
    }
}
