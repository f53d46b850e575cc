/*
 * Conversation Assistant - Behavioral Analyzer
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

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

use super::{
    ai_confidence, content_text, context_references, get_ai_analysis, split_sentences, Analyzer,
};

lazy_static::lazy_static! {
    static ref ASSERTIVE_WORDS: HashSet<&'static str> = [
        "definitely", "certainly", "absolutely", "must", "should", "will",
    ]
    .into_iter()
    .collect();

    static ref COLLABORATIVE_WORDS: HashSet<&'static str> = [
        "we", "together", "let's", "agree", "share", "help",
    ]
    .into_iter()
    .collect();

    static ref ANALYTICAL_WORDS: HashSet<&'static str> = [
        "analyze", "consider", "evaluate", "data", "evidence", "logic",
    ]
    .into_iter()
    .collect();

    static ref DECISIVE_WORDS: HashSet<&'static str> = [
        "decide", "decided", "chosen", "selected", "will", "plan",
    ]
    .into_iter()
    .collect();

    static ref UNCERTAIN_WORDS: HashSet<&'static str> = [
        "maybe", "perhaps", "might", "possibly", "unsure", "uncertain",
    ]
    .into_iter()
    .collect();
}

/// Profiles communication style and decision patterns in conversation text.
pub struct BehavioralAnalyzer {
    provider: Arc<dyn AiProvider>,
    #[allow(dead_code)]
    config: Value,
}

impl BehavioralAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    fn behavioral_metrics(text: &str) -> Value {
        let words: Vec<String> = text
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let total_words = words.len();

        if total_words == 0 {
            return json!({
                "communication_style": "unknown",
                "style_scores": {},
                "interaction_patterns": [],
                "decisiveness": 0.5,
            });
        }

        let count_in = |lexicon: &HashSet<&str>| {
            words.iter().filter(|w| lexicon.contains(w.as_str())).count() as f64
                / total_words as f64
        };

        let assertive = count_in(&ASSERTIVE_WORDS);
        let collaborative = count_in(&COLLABORATIVE_WORDS);
        let analytical = count_in(&ANALYTICAL_WORDS);

        // Ties break in the fixed order assertive > collaborative > analytical.
        let styles = [
            ("assertive", assertive),
            ("collaborative", collaborative),
            ("analytical", analytical),
        ];
        let dominant = styles
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| *name)
            .unwrap_or("unknown");

        json!({
            "communication_style": dominant,
            "style_scores": {
                "assertive": assertive,
                "collaborative": collaborative,
                "analytical": analytical,
            },
            "interaction_patterns": Self::interaction_patterns(text),
            "decisiveness": Self::decisiveness(&words),
        })
    }

    fn interaction_patterns(text: &str) -> Vec<Value> {
        let mut patterns = Vec::new();
        let sentences = split_sentences(text);

        let questions = sentences.iter().filter(|s| s.contains('?')).count();
        if questions > 0 && questions < sentences.len() {
            patterns.push(json!({"type": "turn_taking", "strength": "high"}));
        }
        if sentences.len() > 3 {
            patterns.push(json!({"type": "active_discussion", "strength": "medium"}));
        }
        let lowered = text.to_lowercase();
        if ["solve", "solution", "fix", "issue", "problem"]
            .iter()
            .any(|kw| lowered.contains(kw))
        {
            patterns.push(json!({"type": "problem_solving", "strength": "high"}));
        }
        patterns
    }

    /// Ratio of decisive to uncertain markers; 0.5 when neither appears.
    fn decisiveness(words: &[String]) -> f64 {
        let decisive = words
            .iter()
            .filter(|w| DECISIVE_WORDS.contains(w.as_str()))
            .count();
        let uncertain = words
            .iter()
            .filter(|w| UNCERTAIN_WORDS.contains(w.as_str()))
            .count();

        let total = decisive + uncertain;
        if total == 0 {
            0.5
        } else {
            decisive as f64 / total as f64
        }
    }
}

#[async_trait]
impl Analyzer for BehavioralAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        _task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let text = content_text(content);
        let references = context_references(context);

        let ai_prompt = format!(
            "Analyze behavioral patterns in this conversation. Consider:\n\
             1. Communication styles\n\
             2. Decision-making patterns\n\
             3. Problem-solving approaches\n\
             4. Interpersonal dynamics\n\n\
             Text: {text}"
        );
        let expected_format = json!({
            "behaviors": [{
                "type": "string",
                "frequency": "float (0-1)",
                "context": "string",
                "impact": "string",
            }],
            "patterns": [{
                "description": "string",
                "evidence": ["list of string"],
                "significance": "float (0-1)",
            }],
            "recommendations": ["list of string"],
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;
        let ai_conf = if ai_analysis.get("confidence").is_some() {
            ai_confidence(&ai_analysis)
        } else {
            0.7
        };

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(AnalysisType::Behavioral, ai_analysis, ai_conf, "ai_analysis")
                .with_references(references.clone()),
        );
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Behavioral,
                Self::behavioral_metrics(&text),
                0.8,
                "metric_analysis",
            )
            .with_references(references),
        );

        Ok(insights)
    }
}
