/*
 * Conversation Assistant - Analyzer Registry
 * Copyright (c) 2024 Conversation Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

pub mod behavioral;
pub mod compliance;
pub mod engagement;
pub mod quality;
pub mod sentiment;
pub mod topic;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai::{extract_json, AiProvider, CompletionOptions};
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

pub use behavioral::BehavioralAnalyzer;
pub use compliance::ComplianceAnalyzer;
pub use engagement::EngagementAnalyzer;
pub use quality::QualityAnalyzer;
pub use sentiment::SentimentAnalyzer;
pub use topic::TopicAnalyzer;

/// A pluggable analyzer. Instances are lightweight, hold only configuration
/// and a provider handle, and are constructed per task.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError>;
}

pub type AnalyzerConstructor =
    Arc<dyn Fn(Arc<dyn AiProvider>, Value) -> Box<dyn Analyzer> + Send + Sync>;

/// Maps analysis types to analyzer constructors.
///
/// The registry is built at startup and never mutated afterwards; analyzer
/// instances are created per task.
pub struct AnalyzerRegistry {
    constructors: HashMap<AnalysisType, AnalyzerConstructor>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in analyzer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            AnalysisType::Sentiment,
            Arc::new(|provider, config| Box::new(SentimentAnalyzer::new(provider, config))),
        );
        registry.register(
            AnalysisType::Topic,
            Arc::new(|provider, config| Box::new(TopicAnalyzer::new(provider, config))),
        );
        registry.register(
            AnalysisType::Quality,
            Arc::new(|provider, config| Box::new(QualityAnalyzer::new(provider, config))),
        );
        registry.register(
            AnalysisType::Engagement,
            Arc::new(|provider, config| Box::new(EngagementAnalyzer::new(provider, config))),
        );
        registry.register(
            AnalysisType::Behavioral,
            Arc::new(|provider, config| Box::new(BehavioralAnalyzer::new(provider, config))),
        );
        registry.register(
            AnalysisType::Compliance,
            Arc::new(|provider, config| Box::new(ComplianceAnalyzer::new(provider, config))),
        );
        registry
    }

    pub fn register(&mut self, analyzer_type: AnalysisType, constructor: AnalyzerConstructor) {
        self.constructors.insert(analyzer_type, constructor);
    }

    pub fn contains(&self, analyzer_type: AnalysisType) -> bool {
        self.constructors.contains_key(&analyzer_type)
    }

    /// Construct an analyzer instance for a task.
    pub fn create(
        &self,
        analyzer_type: AnalysisType,
        provider: Arc<dyn AiProvider>,
        config: Value,
    ) -> Result<Box<dyn Analyzer>, AnalysisError> {
        let constructor = self
            .constructors
            .get(&analyzer_type)
            .ok_or(AnalysisError::AnalyzerNotFound(analyzer_type))?;
        Ok(constructor(provider, config))
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Ask the provider for a JSON-shaped analysis; non-JSON output is wrapped
/// as `{"text": ...}` rather than discarded.
pub(crate) async fn get_ai_analysis(
    provider: &dyn AiProvider,
    prompt: &str,
    expected_format: &Value,
) -> Result<Value, AnalysisError> {
    let format_prompt = format!(
        "{prompt}\n\nProvide response in the following JSON format:\n{}\nEnsure all fields are present and properly typed.",
        serde_json::to_string_pretty(expected_format).unwrap_or_default()
    );

    let raw = provider
        .complete(&format_prompt, &CompletionOptions::default())
        .await
        .map_err(|e| AnalysisError::AiFailed(format!("{e:#}")))?;

    Ok(extract_json(&raw).unwrap_or_else(|| json!({"text": raw})))
}

/// Confidence reported by the model, defaulting to 0.5 when absent.
pub(crate) fn ai_confidence(analysis: &Value) -> f64 {
    analysis
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
}

/// Text payload of an analysis request.
pub(crate) fn content_text(content: &Value) -> String {
    content
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

/// Lowercased word tokens.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    lazy_static::lazy_static! {
        static ref WORD: regex::Regex = regex::Regex::new(r"\w+").unwrap();
    }
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Split into sentences, keeping the terminating punctuation with each
/// sentence so question detection still works downstream.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() && trimmed.chars().any(char::is_alphanumeric) {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() && trimmed.chars().any(char::is_alphanumeric) {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// References an insight should carry: the context entry that grounded it.
pub(crate) fn context_references(context: Option<&ContextEntry>) -> Vec<String> {
    context.map(|entry| entry.id.clone()).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::ScriptedProvider;

    #[test]
    fn registry_has_all_defaults() {
        let registry = AnalyzerRegistry::with_defaults();
        for analyzer_type in [
            AnalysisType::Sentiment,
            AnalysisType::Topic,
            AnalysisType::Quality,
            AnalysisType::Engagement,
            AnalysisType::Behavioral,
            AnalysisType::Compliance,
        ] {
            assert!(registry.contains(analyzer_type), "{analyzer_type} missing");
        }
    }

    #[test]
    fn unknown_analyzer_is_an_error() {
        let registry = AnalyzerRegistry::new();
        let result = registry.create(
            AnalysisType::Sentiment,
            ScriptedProvider::empty(),
            Value::Null,
        );
        assert!(matches!(result, Err(AnalysisError::AnalyzerNotFound(_))));
    }

    #[tokio::test]
    async fn ai_analysis_wraps_non_json() {
        let provider = ScriptedProvider::new(["plain prose answer"]);
        let analysis = get_ai_analysis(provider.as_ref(), "analyze", &json!({}))
            .await
            .unwrap();
        assert_eq!(analysis["text"], "plain prose answer");
    }

    #[test]
    fn sentence_split_keeps_terminators() {
        let sentences = split_sentences("How are you? I am fine. Great!");
        assert_eq!(sentences, vec!["How are you?", "I am fine.", "Great!"]);
    }

    #[test]
    fn tokenize_lowercases() {
        assert_eq!(tokenize("Good GOOD bad"), vec!["good", "good", "bad"]);
    }
}
