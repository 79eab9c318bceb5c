use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{IntentClassification, RoutingDecision, RoutingRuleEngine};
use crate::handlers::HandlerDescriptor;
use crate::request::HandlerType;

/// Confidence factor for handlers reached through an intent mapping
const MAPPED_CONFIDENCE_FACTOR: f64 = 0.8;

/// One routing rule; `None` means the rule does not apply
pub trait RoutingRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
    ) -> Option<RoutingDecision>;
}

/// Prefer a handler that also supports the detected language
fn pick<'a>(
    candidates: impl Iterator<Item = &'a HandlerDescriptor>,
    language: Option<&str>,
) -> Option<&'a HandlerDescriptor> {
    let candidates: Vec<_> = candidates.collect();
    language
        .and_then(|language| {
            candidates
                .iter()
                .copied()
                .find(|handler| handler.supports_language(language))
        })
        .or_else(|| candidates.first().copied())
}

/// Routes to a handler of the classification's suggested type
#[derive(Debug, Default)]
pub struct SuggestedTypeRule;

impl RoutingRule for SuggestedTypeRule {
    fn name(&self) -> &str {
        "suggested_type"
    }

    fn evaluate(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
    ) -> Option<RoutingDecision> {
        if classification.suggested_handler_type == HandlerType::Unknown {
            return None;
        }
        let handler = pick(
            handlers
                .iter()
                .filter(|handler| handler.handler_type == classification.suggested_handler_type),
            classification.language.as_deref(),
        )?;
        Some(RoutingDecision::to_handler(
            handler,
            &classification.intent,
            classification.confidence,
            format!("intent '{}' suggests {}", classification.intent, handler.handler_type),
        ))
    }
}

/// Maps intents to related handler types when the suggested type is missing
#[derive(Debug, Clone)]
pub struct IntentMappingRule {
    mappings: HashMap<String, HandlerType>,
}

impl IntentMappingRule {
    pub fn new() -> Self {
        Self {
            mappings: HashMap::new(),
        }
    }

    pub fn map(mut self, intent: impl Into<String>, handler_type: HandlerType) -> Self {
        self.mappings.insert(intent.into(), handler_type);
        self
    }
}

impl Default for IntentMappingRule {
    fn default() -> Self {
        Self::new()
            .map("ask_question", HandlerType::Knowledge)
            .map("document", HandlerType::Knowledge)
            .map("refactor", HandlerType::CodeFix)
            .map("fix_error", HandlerType::Refactoring)
            .map("validate", HandlerType::CodeAnalysis)
            .map("design", HandlerType::CodeGeneration)
    }
}

impl RoutingRule for IntentMappingRule {
    fn name(&self) -> &str {
        "intent_mapping"
    }

    fn evaluate(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
    ) -> Option<RoutingDecision> {
        let mapped = *self.mappings.get(&classification.intent)?;
        let handler = pick(
            handlers.iter().filter(|handler| handler.handler_type == mapped),
            classification.language.as_deref(),
        )?;
        Some(RoutingDecision::to_handler(
            handler,
            &classification.intent,
            classification.confidence * MAPPED_CONFIDENCE_FACTOR,
            format!("intent '{}' is mapped to {}", classification.intent, mapped),
        ))
    }
}

/// Evaluates rules in order; the first rule that applies decides
pub struct RuleBasedRouting {
    rules: Vec<Box<dyn RoutingRule>>,
}

impl RuleBasedRouting {
    pub fn new(rules: Vec<Box<dyn RoutingRule>>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: Box<dyn RoutingRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }
}

impl Default for RuleBasedRouting {
    fn default() -> Self {
        Self::new(vec![
            Box::new(SuggestedTypeRule),
            Box::new(IntentMappingRule::default()),
        ])
    }
}

#[async_trait]
impl RoutingRuleEngine for RuleBasedRouting {
    async fn evaluate_rules(
        &self,
        classification: &IntentClassification,
        handlers: &[HandlerDescriptor],
        cancel: &CancellationToken,
    ) -> RoutingDecision {
        for rule in &self.rules {
            if cancel.is_cancelled() {
                return RoutingDecision::no_target(classification, "routing cancelled");
            }
            if let Some(decision) = rule.evaluate(classification, handlers) {
                debug!(rule = rule.name(), handler = ?decision.handler_name, "Routing rule matched");
                return decision;
            }
        }
        RoutingDecision::no_target(
            classification,
            format!("no rule matched intent '{}'", classification.intent),
        )
    }
}
