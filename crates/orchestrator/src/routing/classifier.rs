//! Keyword-based intent classification
//!
//! Pattern matching over the prompt, in the same spirit as a first-pass
//! intent analyzer: no model calls, deterministic, cheap enough to run on
//! every request.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use super::{
    ClassifierError, IntentAlternative, IntentClassification, IntentClassifier,
    DEFAULT_CONFIDENCE_THRESHOLD, DEGRADED_CONFIDENCE,
};
use crate::request::{HandlerType, Request};

struct IntentPattern {
    intent: &'static str,
    handler_type: HandlerType,
    keywords: &'static [&'static str],
}

const INTENT_PATTERNS: &[IntentPattern] = &[
    IntentPattern {
        intent: "fix_error",
        handler_type: HandlerType::CodeFix,
        keywords: &["fix", "bug", "error", "broken", "crash", "exception", "failing"],
    },
    IntentPattern {
        intent: "refactor",
        handler_type: HandlerType::Refactoring,
        keywords: &["refactor", "restructure", "rename", "simplify", "extract", "clean up"],
    },
    IntentPattern {
        intent: "generate_code",
        handler_type: HandlerType::CodeGeneration,
        keywords: &["generate", "create", "implement", "scaffold", "write", "add"],
    },
    IntentPattern {
        intent: "analyze_code",
        handler_type: HandlerType::CodeAnalysis,
        keywords: &["analyze", "analyse", "review", "inspect", "complexity", "lint"],
    },
    IntentPattern {
        intent: "validate",
        handler_type: HandlerType::Validation,
        keywords: &["validate", "verify", "check", "test"],
    },
    IntentPattern {
        intent: "document",
        handler_type: HandlerType::Documentation,
        keywords: &["document", "docs", "docstring", "comment", "readme"],
    },
    IntentPattern {
        intent: "design",
        handler_type: HandlerType::Design,
        keywords: &["design", "architecture", "diagram", "pattern"],
    },
    IntentPattern {
        intent: "ask_question",
        handler_type: HandlerType::Knowledge,
        keywords: &["what", "how", "why", "explain", "?"],
    },
];

const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("cs", "csharp"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("java", "java"),
    ("go", "go"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("hpp", "cpp"),
    ("rb", "ruby"),
    ("kt", "kotlin"),
    ("swift", "swift"),
    ("php", "php"),
];

const PROMPT_LANGUAGES: &[(&str, &str)] = &[
    ("rust", "rust"),
    ("python", "python"),
    ("csharp", "csharp"),
    ("javascript", "javascript"),
    ("typescript", "typescript"),
    ("java", "java"),
    ("golang", "go"),
    ("ruby", "ruby"),
    ("kotlin", "kotlin"),
    ("swift", "swift"),
    ("php", "php"),
];

/// Default classifier
#[derive(Debug, Clone)]
pub struct KeywordIntentClassifier {
    confidence_threshold: f64,
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl KeywordIntentClassifier {
    pub fn with_threshold(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
        }
    }

    /// Language from the request context, the file extension, then the prompt
    pub fn detect_language(request: &Request) -> Option<String> {
        if let Some(Value::String(language)) = request.context.get("language") {
            return Some(language.to_lowercase());
        }

        if let Some(extension) = request.file_extension() {
            if let Some((_, language)) = EXTENSION_LANGUAGES
                .iter()
                .find(|(ext, _)| *ext == extension)
            {
                return Some(language.to_string());
            }
        }

        let prompt = request.prompt.to_lowercase();
        if prompt.contains("c#") {
            return Some("csharp".to_string());
        }
        if prompt.contains("c++") {
            return Some("cpp".to_string());
        }
        let words = tokenize(&prompt);
        PROMPT_LANGUAGES
            .iter()
            .find(|(keyword, _)| words.contains(keyword))
            .map(|(_, language)| language.to_string())
    }

    fn matches(pattern: &IntentPattern, prompt: &str, words: &HashSet<&str>) -> Vec<&'static str> {
        pattern
            .keywords
            .iter()
            .copied()
            .filter(|keyword| {
                if keyword.contains(' ') || !keyword.chars().all(char::is_alphanumeric) {
                    prompt.contains(keyword)
                } else {
                    words.contains(keyword)
                }
            })
            .collect()
    }

    /// 1 hit → 0.7, 2 hits → 0.85, 3 or more → 0.95
    fn confidence_for(hits: usize) -> f64 {
        if hits == 0 {
            DEGRADED_CONFIDENCE
        } else {
            (0.55 + 0.15 * hits as f64).min(0.95)
        }
    }
}

fn tokenize(prompt: &str) -> HashSet<&str> {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect()
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<IntentClassification, ClassifierError> {
        if cancel.is_cancelled() {
            return Err(ClassifierError::Cancelled);
        }

        let prompt = request.prompt.to_lowercase();
        let words = tokenize(&prompt);

        let mut scored: Vec<(&IntentPattern, Vec<&'static str>)> = INTENT_PATTERNS
            .iter()
            .map(|pattern| (pattern, Self::matches(pattern, &prompt, &words)))
            .filter(|(_, hits)| !hits.is_empty())
            .collect();
        // stable: ties keep table order
        scored.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let language = Self::detect_language(request);

        let Some((best, best_hits)) = scored.first() else {
            let mut classification =
                IntentClassification::new("unknown", DEGRADED_CONFIDENCE, HandlerType::Unknown);
            classification.language = language;
            return Ok(classification);
        };

        let mut confidence = Self::confidence_for(best_hits.len());
        let tied = scored
            .get(1)
            .map(|(_, hits)| hits.len() == best_hits.len())
            .unwrap_or(false);
        if tied {
            confidence -= 0.2;
        }
        if request.content.is_some() {
            confidence += 0.05;
        }

        let mut classification = IntentClassification::new(best.intent, confidence, best.handler_type);
        classification.language = language;
        classification.context.insert(
            "matched_keywords".to_string(),
            Value::from(best_hits.clone()),
        );
        classification.alternatives = scored
            .iter()
            .skip(1)
            .map(|(pattern, hits)| IntentAlternative {
                intent: pattern.intent.to_string(),
                confidence: Self::confidence_for(hits.len()) - 0.2,
                handler_type: pattern.handler_type,
            })
            .collect();

        Ok(classification)
    }

    fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }
}
