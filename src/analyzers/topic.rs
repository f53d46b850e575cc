/*
 * Conversation Assistant - Topic Analyzer
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
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

use super::{ai_confidence, content_text, context_references, get_ai_analysis, tokenize, Analyzer};

lazy_static::lazy_static! {
    static ref STOPWORDS: HashSet<&'static str> = [
        "the", "be", "to", "of", "and", "a", "in", "that",
        "have", "i", "it", "for", "not", "on", "with", "he",
        "as", "you", "do", "at",
    ]
    .into_iter()
    .collect();
}

/// Extracts topics with a model pass and a frequency-based metric pass.
pub struct TopicAnalyzer {
    provider: Arc<dyn AiProvider>,
    #[allow(dead_code)]
    config: Value,
}

impl TopicAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    /// Top-10 tokens after stopword removal, grouped by 4-character prefix.
    ///
    /// Ties break alphabetically so the distribution is deterministic.
    fn topic_distribution(text: &str) -> Value {
        let words: Vec<String> = tokenize(text)
            .into_iter()
            .filter(|w| !STOPWORDS.contains(w.as_str()))
            .collect();

        let mut frequencies: HashMap<&str, u64> = HashMap::new();
        for word in &words {
            *frequencies.entry(word.as_str()).or_insert(0) += 1;
        }

        let mut ranked: Vec<(&str, u64)> = frequencies.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(10);

        let mut top_words = Map::new();
        for (word, count) in &ranked {
            top_words.insert(word.to_string(), json!(count));
        }

        // Prefix grouping is a cheap stemmer: "analyz" and "analysis" meet
        // under "anal".
        let mut groups: HashMap<String, (u64, Vec<String>)> = HashMap::new();
        for (word, count) in &ranked {
            let stem: String = word.chars().take(4).collect();
            let group = groups.entry(stem).or_default();
            group.0 += count;
            group.1.push(word.to_string());
        }

        let mut topic_groups = Map::new();
        let mut ordered_groups: Vec<(String, (u64, Vec<String>))> = groups.into_iter().collect();
        ordered_groups.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(&b.0)));
        for (stem, (count, group_words)) in ordered_groups {
            topic_groups.insert(
                stem,
                json!({"count": count, "words": group_words}),
            );
        }

        json!({
            "top_words": top_words,
            "topic_groups": topic_groups,
            "total_words": words.len(),
        })
    }
}

#[async_trait]
impl Analyzer for TopicAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        _task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let text = content_text(content);
        let references = context_references(context);

        let ai_prompt = format!(
            "Analyze the main topics in this text, providing:\n\
             1. List of topics (name, relevance (0-1), mentions, related terms)\n\
             2. Relationships between topics (strength, type)\n\
             3. Importance of each topic\n\n\
             Text: {text}"
        );
        let expected_format = json!({
            "topics": [{
                "name": "string",
                "relevance": "float (0-1)",
                "mentions": "integer",
                "related_terms": ["list of string"],
            }],
            "relationships": [{
                "topic1": "string",
                "topic2": "string",
                "strength": "float (0-1)",
                "type": "string",
            }],
            "importance": {"topic_name": "float (0-1)"},
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Topic,
                json!({
                    "topics": ai_analysis.get("topics").cloned().unwrap_or(json!([])),
                    "relationships": ai_analysis.get("relationships").cloned().unwrap_or(json!([])),
                    "importance": ai_analysis.get("importance").cloned().unwrap_or(json!({})),
                }),
                ai_confidence(&ai_analysis),
                "ai_analysis",
            )
            .with_references(references.clone()),
        );

        insights.push(
            AnalysisInsight::new(
                AnalysisType::Topic,
                Self::topic_distribution(&text),
                0.8,
                "metric_analysis",
            )
            .with_references(references),
        );

        Ok(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::ScriptedProvider;

    #[test]
    fn stopwords_are_removed() {
        let distribution =
            TopicAnalyzer::topic_distribution("the budget and the budget for the team");
        let top_words = distribution["top_words"].as_object().unwrap();
        assert!(top_words.contains_key("budget"));
        assert!(!top_words.contains_key("the"));
        assert_eq!(distribution["total_words"], 3); // budget, budget, team
    }

    #[test]
    fn top_words_capped_at_ten() {
        let text = (0..15)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let distribution = TopicAnalyzer::topic_distribution(&text);
        assert_eq!(distribution["top_words"].as_object().unwrap().len(), 10);
    }

    #[test]
    fn prefix_groups_accumulate_counts() {
        let distribution =
            TopicAnalyzer::topic_distribution("planning planned planner meeting meeting");
        let groups = distribution["topic_groups"].as_object().unwrap();
        let plan_group = &groups["plan"];
        assert_eq!(plan_group["count"], 3);
        assert_eq!(plan_group["words"].as_array().unwrap().len(), 3);
        assert_eq!(groups["meet"]["count"], 2);
    }

    #[test]
    fn frequency_ties_break_alphabetically() {
        let distribution = TopicAnalyzer::topic_distribution("zebra apple zebra apple");
        let top_words: Vec<&String> =
            distribution["top_words"].as_object().unwrap().keys().collect();
        assert_eq!(top_words, vec!["apple", "zebra"]);
    }

    #[tokio::test]
    async fn returns_ai_and_metric_insights() {
        let provider = ScriptedProvider::new(
            [r#"{"topics": [{"name": "budget"}], "confidence": 0.75}"#],
        );
        let analyzer = TopicAnalyzer::new(provider, Value::Null);
        let insights = analyzer
            .analyze(&json!({"text": "budget planning session"}), None, None)
            .await
            .unwrap();

        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].source, "ai_analysis");
        assert_eq!(insights[1].source, "metric_analysis");
        assert!((insights[1].confidence - 0.8).abs() < 1e-9);
    }
}
