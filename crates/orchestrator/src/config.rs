//! Orchestrator configuration
//!
//! Everything is deserialised from JSON with per-section defaults, so a file
//! only needs the values it changes. Durations are milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::queue::QueueConfig;
use crate::reliability::{HealthCheckConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a dequeued request is executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Route to one handler
    #[default]
    Direct,
    /// Run every applicable workflow step
    Workflow,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Direct => write!(f, "direct"),
            ExecutionMode::Workflow => write!(f, "workflow"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExecutionMode::Direct),
            "workflow" => Ok(ExecutionMode::Workflow),
            other => Err(ConfigError::Invalid(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Router thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Decisions below this confidence are rejected and fallback is tried
    pub min_decision_confidence: f64,
    /// Return a clarification result when classification is below the classifier threshold
    pub ask_follow_up: bool,
    pub max_follow_up_alternatives: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_decision_confidence: 0.3,
            ask_follow_up: true,
            max_follow_up_alternatives: 3,
        }
    }
}

/// Upper bound for `HandlerConfiguration::max_concurrency`
pub const MAX_HANDLER_CONCURRENCY: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Per-handler execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfiguration {
    pub enabled: bool,
    /// Requests one handler may execute at the same time
    pub max_concurrency: usize,
    /// Upper bound of a single attempt
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckConfig>,
}

impl Default for HandlerConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 4,
            timeout_ms: 30_000,
            retry_policy: RetryPolicy::default(),
            health: None,
        }
    }
}

impl HandlerConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }
        if self.max_concurrency > MAX_HANDLER_CONCURRENCY {
            return Err(format!(
                "max_concurrency must be at most {}, got {}",
                MAX_HANDLER_CONCURRENCY, self.max_concurrency
            ));
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".to_string());
        }
        self.retry_policy.validate()
    }
}

/// Source of per-handler settings
pub trait ConfigurationProvider: Send + Sync {
    fn handler_configuration(&self, name: &str) -> HandlerConfiguration;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker tasks spawned by `start`
    pub worker_count: usize,
    pub execution_mode: ExecutionMode,
    /// Capacity of each event topic's broadcast buffer
    pub event_buffer: usize,
    pub queue: QueueConfig,
    pub router: RouterConfig,
    /// Used for handlers without an entry in `handlers`
    pub default_handler: HandlerConfiguration,
    pub handlers: HashMap<String, HandlerConfiguration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            execution_mode: ExecutionMode::Direct,
            event_buffer: 1024,
            queue: QueueConfig::default(),
            router: RouterConfig::default(),
            default_handler: HandlerConfiguration::default(),
            handlers: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_handler(mut self, name: impl Into<String>, config: HandlerConfiguration) -> Self {
        self.handlers.insert(name.into(), config);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.min_decision_confidence) {
            return Err(ConfigError::Invalid(format!(
                "router.min_decision_confidence must be within [0, 1], got {}",
                self.router.min_decision_confidence
            )));
        }

        self.default_handler
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("default_handler: {}", e)))?;
        for (name, handler) in &self.handlers {
            handler
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("handlers.{}: {}", name, e)))?;
        }
        Ok(())
    }
}

impl ConfigurationProvider for OrchestratorConfig {
    fn handler_configuration(&self, name: &str) -> HandlerConfiguration {
        self.handlers
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = OrchestratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.router.min_decision_confidence, 0.3);
        assert_eq!(config.queue.statistics_interval_ms, 30_000);
    }

    #[test]
    fn test_partial_handler_section() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "execution_mode": "workflow",
                "handlers": {
                    "analyzer": {
                        "max_concurrency": 2,
                        "retry_policy": { "max_retries": 5, "retryable_errors": ["timeout"] }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.execution_mode, ExecutionMode::Workflow);
        let analyzer = config.handler_configuration("analyzer");
        assert_eq!(analyzer.max_concurrency, 2);
        assert_eq!(analyzer.timeout_ms, 30_000);
        assert_eq!(analyzer.retry_policy.max_retries, 5);
        assert!(analyzer.retry_policy.is_retryable(ErrorKind::Timeout));
        assert!(!analyzer.retry_policy.is_retryable(ErrorKind::Network));

        let other = config.handler_configuration("unknown");
        assert_eq!(other, config.default_handler);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let err = OrchestratorConfig::from_json_str(r#"{ "worker_count": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validation_names_bad_handler() {
        let err = OrchestratorConfig::from_json_str(
            r#"{ "handlers": { "fixer": { "max_concurrency": 0 } } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("handlers.fixer"));
    }

    #[test]
    fn test_validation_bounds_max_concurrency() {
        let mut handler = HandlerConfiguration {
            max_concurrency: MAX_HANDLER_CONCURRENCY,
            ..Default::default()
        };
        assert!(handler.validate().is_ok());

        handler.max_concurrency = MAX_HANDLER_CONCURRENCY + 1;
        let err = handler.validate().unwrap_err();
        assert!(err.contains("max_concurrency must be at most"));

        let config = OrchestratorConfig::default().with_handler("greedy", handler);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_json() {
        let err = OrchestratorConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "worker_count": 6 }}"#).unwrap();

        let config = OrchestratorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.worker_count, 6);

        let missing = OrchestratorConfig::from_json_file("/definitely/not/here.json");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_execution_mode_parsing() {
        assert_eq!("Workflow".parse::<ExecutionMode>().unwrap(), ExecutionMode::Workflow);
        assert_eq!(" direct ".parse::<ExecutionMode>().unwrap(), ExecutionMode::Direct);
        assert!("batch".parse::<ExecutionMode>().is_err());
    }
}
