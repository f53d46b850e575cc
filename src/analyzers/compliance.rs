/*
 * Conversation Assistant - Compliance Analyzer
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
use regex::RegexBuilder;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::analysis_types::{AnalysisError, AnalysisInsight, AnalysisType};
use crate::context_store::ContextEntry;

use super::{ai_confidence, content_text, context_references, get_ai_analysis, Analyzer};

/// Risk classes with their base severity scores. Each pattern captures the
/// keyword plus the rest of the clause so span length reflects how much
/// sensitive context surrounds the match.
const RISK_PATTERNS: &[(&str, &str, f64)] = &[
    ("pii_exposure", r"\b(?:ssn|passport|credit.?card)\b[^.!?\n]*", 0.9),
    (
        "confidential",
        r"\b(?:confidential|classified|restricted)\b[^.!?\n]*",
        0.8,
    ),
    (
        "financial",
        r"\b(?:account.?number|routing.?number)\b[^.!?\n]*",
        0.7,
    ),
    (
        "security",
        r"\b(?:password|credentials|authentication)\b[^.!?\n]*",
        0.6,
    ),
];

/// Spans longer than this gain a severity bump.
const LONG_SPAN_CHARS: usize = 20;

#[derive(Debug, Clone, Copy)]
struct RiskThresholds {
    high: f64,
    medium: f64,
    #[allow(dead_code)]
    low: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            high: 0.8,
            medium: 0.5,
            low: 0.2,
        }
    }
}

impl RiskThresholds {
    fn from_config(config: &Value) -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: f64| {
            config
                .get("risk_thresholds")
                .and_then(|t| t.get(key))
                .and_then(Value::as_f64)
                .unwrap_or(fallback)
        };
        Self {
            high: read("high", defaults.high),
            medium: read("medium", defaults.medium),
            low: read("low", defaults.low),
        }
    }

    fn bucket(&self, score: f64) -> &'static str {
        if score >= self.high {
            "high"
        } else if score >= self.medium {
            "medium"
        } else {
            "low"
        }
    }
}

/// Flags regulatory risk: fixed risk-indicator patterns plus configurable
/// keyword and regex rules.
pub struct ComplianceAnalyzer {
    provider: Arc<dyn AiProvider>,
    config: Value,
}

impl ComplianceAnalyzer {
    pub fn new(provider: Arc<dyn AiProvider>, config: Value) -> Self {
        Self { provider, config }
    }

    fn thresholds(&self, task_config: Option<&Value>) -> RiskThresholds {
        match task_config {
            Some(config) if config.get("risk_thresholds").is_some() => {
                RiskThresholds::from_config(config)
            }
            _ => RiskThresholds::from_config(&self.config),
        }
    }

    /// Scan the fixed risk-pattern table.
    fn risk_indicators(text: &str, thresholds: &RiskThresholds) -> Vec<Value> {
        let mut indicators = Vec::new();
        for (risk_type, pattern, base_score) in RISK_PATTERNS {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("risk patterns are valid");

            for found in regex.find_iter(text) {
                let matched = found.as_str().trim_end();
                let mut score = *base_score;
                if matched.len() > LONG_SPAN_CHARS {
                    score += 0.1;
                }
                indicators.push(json!({
                    "type": risk_type,
                    "text": matched,
                    "position": found.start(),
                    "score": score,
                    "severity": thresholds.bucket(score),
                }));
            }
        }
        indicators
    }

    /// Apply configured keyword/regex rules (general plus role-specific).
    fn rule_checks(&self, text: &str, role: &str) -> (Vec<Value>, Vec<Value>) {
        let rules = self.config.get("compliance_rules");
        let apply = |key: &str| -> Vec<Value> {
            let mut results = Vec::new();
            let Some(rule_list) = rules.and_then(|r| r.get(key)).and_then(Value::as_array) else {
                return results;
            };
            for rule in rule_list {
                if let Some(result) = apply_rule(text, rule) {
                    results.push(result);
                }
            }
            results
        };
        (apply(role), apply("general"))
    }
}

fn apply_rule(text: &str, rule: &Value) -> Option<Value> {
    let rule_type = rule.get("type").and_then(Value::as_str)?;
    let pattern = rule.get("pattern").and_then(Value::as_str)?;

    let violations: Vec<Value> = match rule_type {
        "regex" => {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .ok()?;
            regex
                .find_iter(text)
                .map(|m| json!({"text": m.as_str(), "start": m.start(), "end": m.end()}))
                .collect()
        }
        "keyword" => {
            let keywords: Vec<&str> = pattern.split('|').collect();
            let lowered = text.to_lowercase();
            keywords
                .iter()
                .filter(|kw| lowered.split_whitespace().any(|w| w == **kw))
                .map(|kw| json!(kw))
                .collect()
        }
        _ => return None,
    };

    if violations.is_empty() {
        return None;
    }

    Some(json!({
        "rule": rule.get("name").cloned().unwrap_or(json!("unnamed")),
        "severity": rule.get("severity").cloned().unwrap_or(json!("medium")),
        "violations": violations,
        "remediation": rule.get("remediation").cloned().unwrap_or(Value::Null),
    }))
}

#[async_trait]
impl Analyzer for ComplianceAnalyzer {
    async fn analyze(
        &self,
        content: &Value,
        context: Option<&ContextEntry>,
        task_config: Option<&Value>,
    ) -> Result<Vec<AnalysisInsight>, AnalysisError> {
        let text = content_text(content);
        let role = content
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("general");
        let references = context_references(context);
        let thresholds = self.thresholds(task_config);

        let ai_prompt = format!(
            "Analyze compliance and regulatory aspects. Consider:\n\
             1. Data privacy compliance\n\
             2. Regulatory requirements\n\
             3. Policy adherence\n\
             4. Risk assessment\n\n\
             Text: {text}\nRole: {role}"
        );
        let expected_format = json!({
            "compliance_status": {
                "overall": "string (compliant/non_compliant/needs_review)",
                "risk_level": "string (high/medium/low)",
                "violations": [{
                    "type": "string",
                    "severity": "float (0-1)",
                    "context": "string",
                    "remediation": "string",
                }],
            },
            "risk_assessment": {
                "risk_factors": ["list of string"],
                "risk_score": "float (0-1)",
                "mitigation_steps": ["list of string"],
            },
        });

        let ai_analysis =
            get_ai_analysis(self.provider.as_ref(), &ai_prompt, &expected_format).await?;
        let ai_conf = if ai_analysis.get("confidence").is_some() {
            ai_confidence(&ai_analysis)
        } else {
            0.8
        };

        let (role_checks, general_checks) = self.rule_checks(&text, role);

        let mut insights = Vec::with_capacity(2);
        insights.push(
            AnalysisInsight::new(AnalysisType::Compliance, ai_analysis, ai_conf, "ai_analysis")
                .with_references(references.clone()),
        );
        insights.push(
            AnalysisInsight::new(
                AnalysisType::Compliance,
                json!({
                    "role_specific_checks": role_checks,
                    "general_checks": general_checks,
                    "risk_indicators": Self::risk_indicators(&text, &thresholds),
                }),
                0.9,
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
    fn long_confidential_span_is_high_risk() {
        // The matched clause exceeds 20 characters: base 0.8 + 0.1 = 0.9.
        let thresholds = RiskThresholds::default();
        let indicators = ComplianceAnalyzer::risk_indicators(
            "this covers the confidential project plan for merger",
            &thresholds,
        );
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0]["type"], "confidential");
        let score = indicators[0]["score"].as_f64().unwrap();
        assert!((score - 0.9).abs() < 1e-9);
        assert_eq!(indicators[0]["severity"], "high");
    }

    #[test]
    fn bare_keyword_keeps_base_score() {
        let thresholds = RiskThresholds::default();
        let indicators = ComplianceAnalyzer::risk_indicators("password", &thresholds);
        assert_eq!(indicators.len(), 1);
        let score = indicators[0]["score"].as_f64().unwrap();
        assert!((score - 0.6).abs() < 1e-9);
        assert_eq!(indicators[0]["severity"], "medium");
    }

    #[test]
    fn severity_buckets_follow_thresholds() {
        let thresholds = RiskThresholds::default();
        assert_eq!(thresholds.bucket(0.9), "high");
        assert_eq!(thresholds.bucket(0.8), "high");
        assert_eq!(thresholds.bucket(0.6), "medium");
        assert_eq!(thresholds.bucket(0.3), "low");
    }

    #[test]
    fn custom_thresholds_override_defaults() {
        let config = json!({"risk_thresholds": {"high": 0.95, "medium": 0.7, "low": 0.1}});
        let thresholds = RiskThresholds::from_config(&config);
        assert_eq!(thresholds.bucket(0.9), "medium");
    }

    #[test]
    fn keyword_rule_matches_whole_words() {
        let rule = json!({
            "type": "keyword",
            "name": "banned_terms",
            "pattern": "secret|internal",
            "severity": "high",
        });
        let result = apply_rule("this is a secret roadmap", &rule).unwrap();
        assert_eq!(result["rule"], "banned_terms");
        assert_eq!(result["violations"].as_array().unwrap().len(), 1);

        // Substrings do not count as violations.
        assert!(apply_rule("secretary of the board", &rule).is_none());
    }

    #[test]
    fn regex_rule_reports_positions() {
        let rule = json!({
            "type": "regex",
            "name": "ticket_ids",
            "pattern": r"PROJ-\d+",
        });
        let result = apply_rule("see PROJ-12 and PROJ-99", &rule).unwrap();
        assert_eq!(result["violations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn returns_ai_and_metric_insights() {
        let provider = ScriptedProvider::new(
            [r#"{"compliance_status": {"overall": "needs_review"}}"#],
        );
        let analyzer = ComplianceAnalyzer::new(provider, Value::Null);
        let insights = analyzer
            .analyze(
                &json!({"text": "the password is hunter2", "role": "support"}),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].source, "ai_analysis");
        assert_eq!(insights[1].source, "metric_analysis");
        let indicators = insights[1].content["risk_indicators"].as_array().unwrap();
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0]["type"], "security");
    }
}
