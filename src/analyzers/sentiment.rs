/*
 * Conversation Assistant - Sentiment Analyzer
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

use super::{ai_confidence, content_text, context_references, get_ai_analysis, Analyzer};

lazy_static::lazy_static! {
    static ref POSITIVE_WORDS: HashSet<&'static str> = [
        "good", "great", "excellent", "happy", "positive",
        "wonderful", "fantastic", "amazing", "helpful",
    ]
    .into_iter()
    .collect();

    static ref NEGATIVE_WORDS: HashSet<&'static str> = [
        "bad", "poor", "terrible", "unhappy", "negative",
        "awful", "horrible", "useless", "disappointing",
    ]
    .into_iter()
    .collect();
}

/// Scores sentiment with a model pass and a fixed-lexicon metric pass.
pub struct SentimentAnalyzer {
    provider: Arc<dyn AiProvider>,
    #[allow(dead_code)]
    config: Value,
}

impl SentimentAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    /// Lexicon counts: `(pos - neg) / (pos + neg)`, zero when neither
    /// lexicon matches.
    fn sentiment_metrics(text: &str) -> Value {
        let words: Vec<&str> = text.split_whitespace().collect();
        let lowered: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();

        let positive = lowered
            .iter()
            .filter(|w| POSITIVE_WORDS.contains(w.as_str()))
            .count();
        let negative = lowered
            .iter()
            .filter(|w| NEGATIVE_WORDS.contains(w.as_str()))
            .count();

        let total = positive + negative;
        let sentiment_score = if total == 0 {
            0.0
        } else {
            (positive as f64 - negative as f64) / total as f64
        };

        json!({
            "sentiment_score": sentiment_score,
            "positive_words": positive,
            "negative_words": negative,
            "word_count": words.len(),
        })
    }
}

#[async_trait]
impl Analyzer for SentimentAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        _task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let text = content_text(content);
        let references = context_references(context);

        let ai_prompt = format!(
            "Analyze the sentiment in this text. Consider:\n\
             1. Overall sentiment polarity (positive/negative/neutral)\n\
             2. Confidence in analysis (0-1)\n\
             3. Specific sentiment indicators (words/phrases)\n\
             4. Emotional undertones\n\
             5. Sentiment intensity\n\
             6. Key sentiment-bearing phrases\n\n\
             Text: {text}"
        );
        let expected_format = json!({
            "sentiment": "string (positive/negative/neutral)",
            "confidence": "float (0-1)",
            "indicators": ["list of string"],
            "emotions": ["list of string"],
            "intensity": "float (0-1)",
            "key_phrases": ["list of string"],
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Sentiment,
                json!({
                    "sentiment": ai_analysis.get("sentiment").cloned().unwrap_or(json!("neutral")),
                    "indicators": ai_analysis.get("indicators").cloned().unwrap_or(json!([])),
                    "emotions": ai_analysis.get("emotions").cloned().unwrap_or(json!([])),
                }),
                ai_confidence(&ai_analysis),
                "ai_analysis",
            )
            .with_references(references.clone()),
        );

        insights.push(
            AnalysisInsight::new(
                AnalysisType::Sentiment,
                Self::sentiment_metrics(&text),
                0.7,
                "metric_analysis",
            )
            .with_references(references),
        );

        Ok(insights)
    }
}
