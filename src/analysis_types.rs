/*
 * Conversation Assistant - Analysis Types
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::types::Role;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analyzer not found: {0}")]
    AnalyzerNotFound(AnalysisType),

    #[error("Analyzer not enabled: {0}")]
    AnalyzerNotEnabled(AnalysisType),

    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Maximum concurrent tasks exceeded ({active} active, {max} allowed)")]
    ResourceExhausted { active: usize, max: usize },

    #[error("Pipeline aborted at stage {stage}: {message}")]
    PipelineAborted { stage: usize, message: String },

    #[error("Analysis canceled")]
    Canceled,

    #[error("AI analysis failed: {0}")]
    AiFailed(String),
}

/// Types of analysis the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Sentiment,
    Topic,
    Quality,
    Engagement,
    Behavioral,
    Compliance,
}

impl AnalysisType {
    /// Fixed weight applied when aggregating insight confidences.
    pub fn confidence_weight(&self) -> f64 {
        match self {
            AnalysisType::Sentiment => 1.0,
            AnalysisType::Topic => 0.8,
            AnalysisType::Quality => 1.0,
            AnalysisType::Engagement => 0.9,
            AnalysisType::Behavioral => 0.7,
            AnalysisType::Compliance => 1.0,
        }
    }

    /// Weight for types outside the fixed table.
    pub const DEFAULT_WEIGHT: f64 = 0.5;
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisType::Sentiment => write!(f, "sentiment"),
            AnalysisType::Topic => write!(f, "topic"),
            AnalysisType::Quality => write!(f, "quality"),
            AnalysisType::Engagement => write!(f, "engagement"),
            AnalysisType::Behavioral => write!(f, "behavioral"),
            AnalysisType::Compliance => write!(f, "compliance"),
        }
    }
}

/// Priority levels for analysis tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl AnalysisPriority {
    pub fn value(&self) -> f64 {
        match self {
            AnalysisPriority::Critical => 3.0,
            AnalysisPriority::High => 2.0,
            AnalysisPriority::Medium => 1.0,
            AnalysisPriority::Low => 0.5,
        }
    }
}

/// Lifecycle states of an analysis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Individual analysis insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisInsight {
    pub insight_type: AnalysisType,
    pub content: Value,
    pub confidence: f64,
    /// Origin tag: `"ai_analysis"`, `"metric_analysis"`, ...
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tags: HashSet<String>,
    pub references: HashSet<String>,
}

impl AnalysisInsight {
    pub fn new(insight_type: AnalysisType, content: Value, confidence: f64, source: &str) -> Self {
        Self {
            insight_type,
            content,
            confidence,
            source: source.to_string(),
            timestamp: Utc::now(),
            tags: HashSet::new(),
            references: HashSet::new(),
        }
    }

    pub fn with_references<I: IntoIterator<Item = String>>(mut self, references: I) -> Self {
        self.references.extend(references);
        self
    }
}

/// Task configuration for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: String,
    pub task_type: AnalysisType,
    pub priority: AnalysisPriority,
    pub role: Option<Role>,
    pub config: Value,
    pub dependencies: Vec<String>,
    /// Per-task timeout in milliseconds; engine default when absent.
    pub timeout_ms: Option<u64>,
}

impl AnalysisTask {
    pub fn new(id: &str, task_type: AnalysisType) -> Self {
        Self {
            id: id.to_string(),
            task_type,
            priority: AnalysisPriority::Medium,
            role: None,
            config: Value::Null,
            dependencies: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_dependencies<I: IntoIterator<Item = String>>(mut self, deps: I) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Result of one analysis task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub task_id: String,
    pub result_type: AnalysisType,
    pub insights: Vec<AnalysisInsight>,
    pub confidence: f64,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Weighted mean of insight confidences with the fixed per-type table.
pub fn aggregate_confidence(insights: &[AnalysisInsight]) -> f64 {
    if insights.is_empty() {
        return 0.0;
    }
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for insight in insights {
        let weight = insight.insight_type.confidence_weight();
        weighted_sum += insight.confidence * weight;
        total_weight += weight;
    }
    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    }
}

/// How a pipeline reacts to a failing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Skip the failing task; dependents never become runnable.
    Continue,
    /// Abort the pipeline and surface the first error.
    Fail,
}

/// One pipeline stage: named groups of tasks.
pub type PipelineStage = Vec<(String, Vec<AnalysisTask>)>;

/// Ordered stages of analysis tasks.
#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    pub stages: Vec<PipelineStage>,
    pub parallel_stages: bool,
    pub error_handling: ErrorHandling,
    pub max_stage_duration_ms: u64,
}

impl AnalysisPipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self {
            stages,
            parallel_stages: true,
            error_handling: ErrorHandling::Continue,
            max_stage_duration_ms: 60_000,
        }
    }

    /// Single-stage pipeline with one task group.
    pub fn single_stage(group: &str, tasks: Vec<AnalysisTask>) -> Self {
        Self::new(vec![vec![(group.to_string(), tasks)]])
    }

    pub fn sequential(mut self) -> Self {
        self.parallel_stages = false;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.error_handling = ErrorHandling::Fail;
        self
    }
}

/// Request for analysis processing.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub session_id: String,
    pub content: Value,
    pub context: Option<crate::context_store::ContextEntry>,
    pub role: Option<Role>,
    pub pipeline: Option<AnalysisPipeline>,
}

impl AnalysisRequest {
    pub fn new(session_id: &str, content: Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            content,
            context: None,
            role: None,
            pipeline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weight_table_is_fixed() {
        assert_eq!(AnalysisType::Sentiment.confidence_weight(), 1.0);
        assert_eq!(AnalysisType::Topic.confidence_weight(), 0.8);
        assert_eq!(AnalysisType::Quality.confidence_weight(), 1.0);
        assert_eq!(AnalysisType::Engagement.confidence_weight(), 0.9);
        assert_eq!(AnalysisType::Behavioral.confidence_weight(), 0.7);
        assert_eq!(AnalysisType::Compliance.confidence_weight(), 1.0);
    }

    #[test]
    fn aggregate_confidence_weighted_mean() {
        // (0.8 * 1.0 + 0.6 * 0.9) / (1.0 + 0.9) ≈ 0.7053
        let insights = vec![
            AnalysisInsight::new(AnalysisType::Sentiment, json!({}), 0.8, "metric_analysis"),
            AnalysisInsight::new(AnalysisType::Engagement, json!({}), 0.6, "metric_analysis"),
        ];
        let aggregate = aggregate_confidence(&insights);
        assert!((aggregate - 1.34 / 1.9).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&aggregate));
    }

    #[test]
    fn aggregate_confidence_empty_is_zero() {
        assert_eq!(aggregate_confidence(&[]), 0.0);
    }

    #[test]
    fn priority_values() {
        assert_eq!(AnalysisPriority::Critical.value(), 3.0);
        assert_eq!(AnalysisPriority::High.value(), 2.0);
        assert_eq!(AnalysisPriority::Medium.value(), 1.0);
        assert_eq!(AnalysisPriority::Low.value(), 0.5);
    }
}
