//! Intent Classifier & Router
//!
//! Picks a handler for requests that carry no explicit preference:
//! classify the intent, evaluate routing rules, validate the decision and
//! fall back by handler type, then by source language.

pub mod classifier;
pub mod rules;

pub use classifier::KeywordIntentClassifier;
pub use rules::{IntentMappingRule, RoutingRule, RuleBasedRouting, SuggestedTypeRule};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::handlers::HandlerDescriptor;
use crate::request::{HandlerType, Request};

/// Confidence assigned to a fallback matched by handler type
pub const TYPE_FALLBACK_CONFIDENCE: f64 = 0.5;
/// Confidence assigned to a fallback matched by source language
pub const LANGUAGE_FALLBACK_CONFIDENCE: f64 = 0.4;
/// Confidence of a degraded classification
pub const DEGRADED_CONFIDENCE: f64 = 0.1;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierError {
    #[error("classification failed: {0}")]
    Failed(String),

    #[error("classification cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    #[error("no handlers available")]
    NoHandlersAvailable,

    #[error("preferred handler type {0} is not available")]
    PreferredUnavailable(HandlerType),

    #[error("no suitable handler for intent '{intent}': {reason}")]
    NoSuitableHandler { intent: String, reason: String },

    #[error("routing cancelled")]
    Cancelled,
}

/// A ranked alternative reading of the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAlternative {
    pub intent: String,
    pub confidence: f64,
    pub handler_type: HandlerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: String,
    /// Within [0, 1]
    pub confidence: f64,
    pub language: Option<String>,
    pub suggested_handler_type: HandlerType,
    /// Best first
    pub alternatives: Vec<IntentAlternative>,
    pub context: HashMap<String, Value>,
}

impl IntentClassification {
    pub fn new(intent: impl Into<String>, confidence: f64, suggested: HandlerType) -> Self {
        Self {
            intent: intent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            language: None,
            suggested_handler_type: suggested,
            alternatives: Vec::new(),
            context: HashMap::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_alternative(mut self, alternative: IntentAlternative) -> Self {
        self.alternatives.push(alternative);
        self
    }

    /// Classification used when the classifier fails
    pub fn degraded() -> Self {
        Self::new("unknown", DEGRADED_CONFIDENCE, HandlerType::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// `None` when no rule matched
    pub handler_name: Option<String>,
    pub handler_type: HandlerType,
    pub intent: String,
    pub confidence: f64,
    pub reason: String,
    pub is_fallback: bool,
}

impl RoutingDecision {
    pub fn to_handler(
        handler: &HandlerDescriptor,
        intent: impl Into<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            handler_name: Some(handler.name.clone()),
            handler_type: handler.handler_type,
            intent: intent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            is_fallback: false,
        }
    }

    pub fn no_target(classification: &IntentClassification, reason: impl Into<String>) -> Self {
        Self {
            handler_name: None,
            handler_type: classification.suggested_handler_type,
            intent: classification.intent.clone(),
            confidence: 0.0,
            reason: reason.into(),
            is_fallback: false,
        }
    }

    fn as_fallback(mut self) -> Self {
        self.is_fallback = true;
        self
    }
}

/// Clarifying question for a low-confidence classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub question: String,
    pub alternatives: Vec<IntentAlternative>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<IntentClassification, ClassifierError>;

    /// Below this confidence the caller should ask a follow-up question
    fn confidence_threshold(&self) -> f64 {
        DEFAULT_CONFIDENCE_THRESHOLD
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutingRuleEngine: Send + Sync {
    async fn evaluate_rules(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
        cancel: &CancellationToken,
    ) -> RoutingDecision;
}

pub struct IntentRouter {
    classifier: Arc<dyn IntentClassifier>,
    rules: Arc<dyn RoutingRuleEngine>,
    config: RouterConfig,
}

impl IntentRouter {
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        rules: Arc<dyn RoutingRuleEngine>,
        config: RouterConfig,
    ) -> Self {
        Self {
            classifier,
            rules,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.classifier.confidence_threshold()
    }

    /// Classify `request`, degrading on classifier failure.
    ///
    /// Cancellation is not a failure: it returns `RoutingError::Cancelled`.
    pub async fn classify_intent(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<IntentClassification, RoutingError> {
        let classified = self.classifier.classify(request, cancel).await;
        if cancel.is_cancelled() || matches!(classified, Err(ClassifierError::Cancelled)) {
            debug!(request_id = %request.id, "Intent classification cancelled");
            return Err(RoutingError::Cancelled);
        }

        Ok(match classified {
            Ok(mut classification) => {
                classification.confidence = classification.confidence.clamp(0.0, 1.0);
                debug!(
                    request_id = %request.id,
                    intent = %classification.intent,
                    confidence = classification.confidence,
                    language = ?classification.language,
                    "Intent classified"
                );
                classification
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Intent classification failed, using degraded classification");
                IntentClassification::degraded()
            }
        })
    }

    pub async fn route(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
        cancel: &CancellationToken,
    ) -> RoutingDecision {
        if handlers.is_empty() {
            return RoutingDecision::no_target(classification, "no handlers available");
        }
        self.rules
            .evaluate_rules(classification, handlers, cancel)
            .await
    }

    /// `Err` carries the reason the decision cannot be used
    pub fn validate_decision(
        &self,
        decision: &RoutingDecision,
        handlers: &[HandlerDescriptor],
    ) -> Result<(), String> {
        let name = match &decision.handler_name {
            Some(name) => name,
            None => return Err(format!("no target handler ({})", decision.reason)),
        };
        if !handlers.iter().any(|handler| &handler.name == name) {
            return Err(format!("handler '{}' is not available", name));
        }
        if decision.confidence < self.config.min_decision_confidence {
            return Err(format!(
                "confidence {:.2} is below the minimum {:.2}",
                decision.confidence, self.config.min_decision_confidence
            ));
        }
        Ok(())
    }

    /// Suggested-type match first, then detected-language match
    pub fn find_fallback(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
    ) -> Option<RoutingDecision> {
        if let Some(handler) = handlers
            .iter()
            .find(|handler| handler.handler_type == classification.suggested_handler_type)
        {
            return Some(
                RoutingDecision::to_handler(
                    handler,
                    &classification.intent,
                    TYPE_FALLBACK_CONFIDENCE,
                    format!("fallback by handler type {}", handler.handler_type),
                )
                .as_fallback(),
            );
        }

        let language = classification.language.as_deref()?;
        handlers
            .iter()
            .find(|handler| handler.supports_language(language))
            .map(|handler| {
                RoutingDecision::to_handler(
                    handler,
                    &classification.intent,
                    LANGUAGE_FALLBACK_CONFIDENCE,
                    format!("fallback by language {}", language),
                )
                .as_fallback()
            })
    }

    pub fn needs_follow_up(&self, classification: &IntentClassification) -> bool {
        classification.confidence < self.classifier.confidence_threshold()
    }

    /// Question listing the best alternatives, when confidence is too low
    pub fn follow_up_question(
        &self,
        classification: &IntentClassification,
    ) -> Option<FollowUpQuestion> {
        if !self.needs_follow_up(classification) {
            return None;
        }

        let alternatives: Vec<IntentAlternative> = classification
            .alternatives
            .iter()
            .take(self.config.max_follow_up_alternatives)
            .cloned()
            .collect();

        let question = if alternatives.is_empty() {
            "I'm not sure what you would like me to do. Could you describe the task in more detail?"
                .to_string()
        } else {
            let options: Vec<String> = alternatives
                .iter()
                .enumerate()
                .map(|(i, alt)| format!("{}. {}", i + 1, alt.intent.replace('_', " ")))
                .collect();
            format!(
                "I'm not sure what you would like me to do. Did you mean one of these?\n{}",
                options.join("\n")
            )
        };

        Some(FollowUpQuestion {
            question,
            alternatives,
        })
    }

    /// Pick a handler from an existing classification
    pub async fn select_for_classification(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
        cancel: &CancellationToken,
    ) -> Result<RoutingDecision, RoutingError> {
        if handlers.is_empty() {
            return Err(RoutingError::NoHandlersAvailable);
        }

        let decision = self.route(classification, handlers, cancel).await;
        if cancel.is_cancelled() {
            return Err(RoutingError::Cancelled);
        }
        let rejection = match self.validate_decision(&decision, handlers) {
            Ok(()) => {
                info!(
                    handler = ?decision.handler_name,
                    intent = %decision.intent,
                    confidence = decision.confidence,
                    "Routing decision accepted"
                );
                return Ok(decision);
            }
            Err(reason) => reason,
        };

        debug!(reason = %rejection, "Routing decision rejected, trying fallback");
        match self.find_fallback(classification, handlers) {
            Some(fallback) => {
                info!(
                    handler = ?fallback.handler_name,
                    intent = %fallback.intent,
                    confidence = fallback.confidence,
                    "Routing fell back: {}",
                    fallback.reason
                );
                Ok(fallback)
            }
            None => Err(RoutingError::NoSuitableHandler {
                intent: classification.intent.clone(),
                reason: rejection,
            }),
        }
    }

    /// Explicit preference, else classify, route, validate and fall back
    pub async fn select_handler(
        &self,
        request: &Request,
        handlers: &[HandlerDescriptor],
        cancel: &CancellationToken,
    ) -> Result<RoutingDecision, RoutingError> {
        if handlers.is_empty() {
            return Err(RoutingError::NoHandlersAvailable);
        }

        if let Some(preferred) = request.preferred_handler {
            return handlers
                .iter()
                .find(|handler| handler.handler_type == preferred)
                .map(|handler| {
                    RoutingDecision::to_handler(handler, "explicit", 1.0, "explicit handler preference")
                })
                .ok_or(RoutingError::PreferredUnavailable(preferred));
        }

        let classification = self.classify_intent(request, cancel).await?;
        self.select_for_classification(&classification, handlers, cancel)
            .await
    }
}
