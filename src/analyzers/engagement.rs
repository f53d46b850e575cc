/*
 * Conversation Assistant - Engagement Analyzer
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
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

use super::{ai_confidence, context_references, get_ai_analysis, tokenize, Analyzer};

const ACTIVE_LISTENING_PHRASES: &[&str] = &[
    "i see",
    "understood",
    "right",
    "got it",
    "makes sense",
    "exactly",
];

/// Measures engagement over conversation turns: responsiveness, balance,
/// and recurring interaction patterns.
pub struct EngagementAnalyzer {
    provider: Arc<dyn AiProvider>,
    #[allow(dead_code)]
    config: Value,
}

impl EngagementAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    fn engagement_metrics(turns: &[Value]) -> Value {
        if turns.is_empty() {
            return json!({
                "response_rate": 0.0,
                "avg_response_time": 0.0,
                "turn_distribution": {},
                "engagement_patterns": [],
            });
        }

        let mut turn_distribution: Map<String, Value> = Map::new();
        let mut response_times = Vec::new();
        let mut previous_time: Option<f64> = None;

        for turn in turns {
            let speaker = turn
                .get("speaker")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let count = turn_distribution
                .get(speaker)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            turn_distribution.insert(speaker.to_string(), json!(count + 1));

            if let Some(timestamp) = turn.get("timestamp").and_then(Value::as_f64) {
                if let Some(previous) = previous_time {
                    response_times.push(timestamp - previous);
                }
                previous_time = Some(timestamp);
            }
        }

        let avg_response_time = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<f64>() / response_times.len() as f64
        };

        json!({
            "response_rate": response_times.len() as f64 / turns.len() as f64,
            "avg_response_time": avg_response_time,
            "turn_distribution": turn_distribution,
            "engagement_patterns": Self::detect_patterns(turns),
        })
    }

    /// Slide a three-turn window looking for question-answer sequences,
    /// topic continuation and active-listening signals.
    fn detect_patterns(turns: &[Value]) -> Vec<Value> {
        let mut patterns = Vec::new();
        let window = 3;
        if turns.len() < window {
            return patterns;
        }

        for sequence in turns.windows(window) {
            if let Some(pattern) = Self::analyze_sequence(sequence) {
                patterns.push(pattern);
            }
        }
        patterns
    }

    fn analyze_sequence(sequence: &[Value]) -> Option<Value> {
        let texts: Vec<&str> = sequence
            .iter()
            .map(|turn| turn.get("text").and_then(Value::as_str).unwrap_or(""))
            .collect();

        let is_qa = texts.iter().any(|t| t.contains('?'));
        let is_topic_continuation = Self::check_topic_continuation(&texts);
        let has_active_listening = texts.iter().any(|t| {
            let lowered = t.to_lowercase();
            ACTIVE_LISTENING_PHRASES
                .iter()
                .any(|phrase| lowered.contains(phrase))
        });

        if !(is_qa || is_topic_continuation || has_active_listening) {
            return None;
        }

        let pattern_type = if is_qa {
            "qa"
        } else if is_topic_continuation {
            "topic_continuation"
        } else {
            "active_listening"
        };

        let speakers: HashSet<&str> = sequence
            .iter()
            .filter_map(|turn| turn.get("speaker").and_then(Value::as_str))
            .collect();

        Some(json!({
            "type": pattern_type,
            "turns": sequence.len(),
            "speakers": speakers.into_iter().collect::<Vec<_>>(),
        }))
    }

    /// Repeated key terms across consecutive turns mark a continued topic.
    fn check_topic_continuation(texts: &[&str]) -> bool {
        let mut seen: HashSet<String> = HashSet::new();
        for text in texts {
            let words: HashSet<String> = tokenize(text).into_iter().collect();
            if !seen.is_empty() && words.intersection(&seen).next().is_some() {
                return true;
            }
            seen.extend(words);
        }
        false
    }
}

#[async_trait]
impl Analyzer for EngagementAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        _task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let turns = content
            .get("turns")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let references = context_references(context);

        let ai_prompt = format!(
            "Analyze the conversation engagement level. Consider:\n\
             1. Participant responsiveness\n\
             2. Turn-taking patterns\n\
             3. Response depth and relevance\n\
             4. Active listening indicators\n\n\
             Conversation turns: {}",
            Value::Array(turns.clone())
        );
        let expected_format = json!({
            "engagement_score": "float (0-1)",
            "participation_balance": "float (0-1)",
            "interaction_quality": [{
                "aspect": "string",
                "score": "float (0-1)",
                "evidence": ["list of string"],
            }],
            "recommendations": ["list of string"],
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;
        let ai_conf = if ai_analysis.get("confidence").is_some() {
            ai_confidence(&ai_analysis)
        } else {
            0.8
        };

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(AnalysisType::Engagement, ai_analysis, ai_conf, "ai_analysis")
                .with_references(references.clone()),
        );
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Engagement,
                Self::engagement_metrics(&turns),
                0.9,
                "metric_analysis",
            )
            .with_references(references),
        );

        Ok(insights)
    }
}
