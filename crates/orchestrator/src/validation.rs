//! Request validation collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Outcome of validating one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Checks a request before a handler runs it.
///
/// Errors reject the request; warnings are only logged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestValidator: Send + Sync {
    async fn validate(&self, request: &Request) -> ValidationReport;
}

/// Shape checks shared by every handler
#[derive(Debug, Clone)]
pub struct BasicRequestValidator {
    pub max_prompt_chars: usize,
}

impl Default for BasicRequestValidator {
    fn default() -> Self {
        Self {
            max_prompt_chars: 32_000,
        }
    }
}

#[async_trait]
impl RequestValidator for BasicRequestValidator {
    async fn validate(&self, request: &Request) -> ValidationReport {
        let mut report = ValidationReport::valid();

        if request.prompt.trim().is_empty() {
            report.add_error("prompt must not be empty");
        }

        let length = request.prompt.chars().count();
        if length > self.max_prompt_chars {
            report.add_error(format!(
                "prompt is {} characters, limit is {}",
                length, self.max_prompt_chars
            ));
        }

        if request.file_path.is_some() && request.content.is_none() {
            report.add_warning("file path given without file content");
        }

        report
    }
}
