/*
 * Conversation Assistant - Quality Analyzer
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
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

use super::{
    ai_confidence, content_text, context_references, get_ai_analysis, split_sentences, Analyzer,
};

/// Scores conversation quality with a model pass and sentence-level metrics.
pub struct QualityAnalyzer {
    provider: Arc<dyn AiProvider>,
    #[allow(dead_code)]
    config: Value,
}

impl QualityAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    /// Sentence statistics and the turn-taking ratio
    /// `min(questions, responses) / max(questions, responses)`.
    fn quality_metrics(text: &str) -> Value {
        let sentences = split_sentences(text);

        let avg_sentence_length = if sentences.is_empty() {
            0.0
        } else {
            sentences
                .iter()
                .map(|s| s.split_whitespace().count())
                .sum::<usize>() as f64
                / sentences.len() as f64
        };

        let questions = sentences.iter().filter(|s| s.contains('?')).count();
        let responses = sentences.len() - questions;

        let max_side = questions.max(responses);
        let turn_taking_ratio = if max_side == 0 {
            0.0
        } else {
            questions.min(responses) as f64 / max_side as f64
        };

        json!({
            "avg_sentence_length": avg_sentence_length,
            "turn_taking_ratio": turn_taking_ratio,
            "question_count": questions,
            "response_count": responses,
            "total_turns": sentences.len(),
        })
    }
}

#[async_trait]
impl Analyzer for QualityAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        _task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let text = content_text(content);
        let references = context_references(context);

        let ai_prompt = format!(
            "Analyze the conversation quality, providing:\n\
             1. Clarity score (0-1)\n\
             2. Engagement level (0-1)\n\
             3. Communication effectiveness (0-1)\n\
             4. Suggestions for improvement (aspects, suggestions, priorities (high/medium/low))\n\
             5. Metrics for coherence, relevance, and completeness\n\n\
             Text: {text}"
        );
        let expected_format = json!({
            "clarity": "float (0-1)",
            "engagement": "float (0-1)",
            "effectiveness": "float (0-1)",
            "improvements": [{
                "aspect": "string",
                "suggestion": "string",
                "priority": "string (high/medium/low)",
            }],
            "metrics": {
                "coherence": "float (0-1)",
                "relevance": "float (0-1)",
                "completeness": "float (0-1)",
            },
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Quality,
                json!({
                    "clarity": ai_analysis.get("clarity").cloned().unwrap_or(json!(0.0)),
                    "engagement": ai_analysis.get("engagement").cloned().unwrap_or(json!(0.0)),
                    "effectiveness": ai_analysis.get("effectiveness").cloned().unwrap_or(json!(0.0)),
                    "improvements": ai_analysis.get("improvements").cloned().unwrap_or(json!([])),
                }),
                ai_confidence(&ai_analysis),
                "ai_analysis",
            )
            .with_references(references.clone()),
        );

        insights.push(
            AnalysisInsight::new(
                AnalysisType::Quality,
                Self::quality_metrics(&text),
                0.9,
                "metric_analysis",
            )
            .with_references(references),
        );

        Ok(insights)
    }
}
