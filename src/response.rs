/*
 * Conversation Assistant - Response Generator
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
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::ai::{extract_json, AiProvider, CompletionOptions};
use crate::analysis_types::AnalysisResult;
use crate::config::ResponseConfig;
use crate::context_store::ContextEntry;
use crate::event_bus::EventBus;
use crate::types::{Event, EventType, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Direct,
    Clarification,
    FollowUp,
    Suggestion,
    Summary,
    Action,
    Fallback,
}

impl ResponseType {
    fn parse(value: &str) -> ResponseType {
        match value {
            "direct" => ResponseType::Direct,
            "clarify" | "clarification" => ResponseType::Clarification,
            "follow_up" => ResponseType::FollowUp,
            "suggest" | "suggestion" => ResponseType::Suggestion,
            "summary" => ResponseType::Summary,
            "action" => ResponseType::Action,
            _ => ResponseType::Direct,
        }
    }
}

/// Template for response generation; rendering fails closed when any
/// required variable lacks a value.
#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    pub name: String,
    pub content: String,
    pub response_type: ResponseType,
    pub required_variables: HashSet<String>,
    /// When set, the template only matches requests carrying this role.
    pub role: Option<Role>,
}

impl ResponseTemplate {
    pub fn new(name: &str, response_type: ResponseType, content: &str) -> Self {
        lazy_static::lazy_static! {
            static ref VARIABLE: Regex = Regex::new(r"\{(\w+)\}").unwrap();
        }
        let required_variables = VARIABLE
            .captures_iter(content)
            .map(|captures| captures[1].to_string())
            .collect();
        Self {
            name: name.to_string(),
            content: content.to_string(),
            response_type,
            required_variables,
            role: None,
        }
    }

    pub fn for_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    fn matches(&self, response_type: ResponseType, role: Option<Role>) -> bool {
        if self.response_type != response_type {
            return false;
        }
        match self.role {
            None => true,
            Some(template_role) => role == Some(template_role),
        }
    }

    /// Render with the given variable values; `None` when any required
    /// variable is missing.
    fn render(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        let mut rendered = self.content.clone();
        for variable in &self.required_variables {
            let value = lookup(variable)?;
            rendered = rendered.replace(&format!("{{{variable}}}"), &value);
        }
        Some(rendered)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseCandidate {
    pub content: String,
    pub response_type: ResponseType,
    pub confidence: f64,
    pub context_refs: Vec<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub session_id: String,
    pub query: String,
    pub role: Option<Role>,
    pub response_type: Option<ResponseType>,
    pub context: Option<ContextEntry>,
    pub analysis: Option<AnalysisResult>,
}

impl ResponseRequest {
    pub fn new(session_id: &str, query: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            query: query.to_string(),
            role: None,
            response_type: None,
            context: None,
            analysis: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedResponse {
    pub content: String,
    pub response_type: ResponseType,
    pub confidence: f64,
    pub alternatives: Vec<ResponseCandidate>,
    pub context_used: Vec<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Generates suggestions by combining AI candidates with template
/// candidates, selecting on confidence, and falling back to a fixed
/// response when nothing viable survives.
pub struct ResponseGenerator {
    event_bus: Arc<EventBus>,
    provider: Arc<dyn AiProvider>,
    config: ResponseConfig,
    templates: Vec<ResponseTemplate>,
}

impl ResponseGenerator {
    pub fn new(
        event_bus: Arc<EventBus>,
        provider: Arc<dyn AiProvider>,
        config: ResponseConfig,
    ) -> Self {
        Self {
            event_bus,
            provider,
            config,
            templates: default_templates(),
        }
    }

    pub fn with_templates(mut self, templates: Vec<ResponseTemplate>) -> Self {
        self.templates = templates;
        self
    }

    /// Generate a response; failures degrade to the fixed fallback rather
    /// than erroring.
    pub async fn generate(&self, request: &ResponseRequest) -> GeneratedResponse {
        let requested_type = request.response_type.unwrap_or(ResponseType::Direct);

        let mut candidates = match self.ai_candidates(request).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("AI candidate generation failed: {e:#}");
                Vec::new()
            }
        };
        candidates.extend(self.template_candidates(request, requested_type));

        let selected = self.select_candidates(candidates);
        let response = match selected.split_first() {
            Some((best, rest)) => GeneratedResponse {
                content: best.content.clone(),
                response_type: best.response_type,
                confidence: best.confidence,
                alternatives: rest.to_vec(),
                context_used: best.context_refs.clone(),
                metadata: json!({
                    "candidates_generated": selected.len(),
                    "request_type": requested_type,
                }),
                timestamp: Utc::now(),
            },
            None => self.fallback(requested_type, "no viable candidates"),
        };

        self.event_bus
            .publish(Event::new(
                EventType::ResponseReceived,
                json!({
                    "status": "response_generated",
                    "session_id": request.session_id.as_str(),
                    "type": response.response_type,
                    "confidence": response.confidence,
                }),
            ))
            .await;

        response
    }

    /// One prompt asking the model for a JSON list of candidates.
    async fn ai_candidates(
        &self,
        request: &ResponseRequest,
    ) -> anyhow::Result<Vec<ResponseCandidate>> {
        let context_blurb = request
            .context
            .as_ref()
            .map(|entry| format!("\nContext: {}", entry.content))
            .unwrap_or_default();
        let analysis_blurb = request
            .analysis
            .as_ref()
            .map(|analysis| {
                format!(
                    "\nAnalysis ({}): confidence {:.2}",
                    analysis.result_type, analysis.confidence
                )
            })
            .unwrap_or_default();

        let prompt = format!(
            "Generate response candidates for this query.{context_blurb}{analysis_blurb}\n\
             Query: {}\n\n\
             Respond with JSON only:\n\
             {{\"candidates\": [{{\"content\": \"string\", \"type\": \
             \"direct|clarify|follow_up|suggest|summary|action\", \"confidence\": 0.0, \
             \"context_refs\": [\"string\"], \"metadata\": {{}}}}]}}",
            request.query
        );

        let raw = self
            .provider
            .complete(&prompt, &CompletionOptions::default())
            .await?;

        let Some(parsed) = extract_json(&raw) else {
            // Unstructured output still yields one usable candidate.
            return Ok(vec![ResponseCandidate {
                content: raw,
                response_type: ResponseType::Direct,
                confidence: 0.5,
                context_refs: Vec::new(),
                metadata: json!({"source": "ai_unstructured"}),
            }]);
        };

        let candidates = parsed
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(candidates
            .into_iter()
            .filter_map(|candidate| {
                let content = candidate.get("content")?.as_str()?.to_string();
                Some(ResponseCandidate {
                    content,
                    response_type: ResponseType::parse(
                        candidate.get("type").and_then(Value::as_str).unwrap_or("direct"),
                    ),
                    confidence: candidate
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.5),
                    context_refs: candidate
                        .get("context_refs")
                        .and_then(Value::as_array)
                        .map(|refs| {
                            refs.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    metadata: candidate.get("metadata").cloned().unwrap_or(json!({})),
                })
            })
            .collect())
    }

    /// One candidate per matching template that renders completely.
    fn template_candidates(
        &self,
        request: &ResponseRequest,
        requested_type: ResponseType,
    ) -> Vec<ResponseCandidate> {
        let mut candidates = Vec::new();
        for template in &self.templates {
            if !template.matches(requested_type, request.role) {
                continue;
            }
            let Some(content) = template.render(|variable| {
                extract_variable(variable, request.context.as_ref(), &request.query)
            }) else {
                // A template missing a value is skipped, never an error.
                continue;
            };
            candidates.push(ResponseCandidate {
                content,
                response_type: requested_type,
                confidence: 0.7,
                context_refs: request
                    .context
                    .as_ref()
                    .map(|entry| vec![entry.id.clone()])
                    .unwrap_or_default(),
                metadata: json!({"source": "template", "template": template.name}),
            });
        }
        candidates
    }

    fn select_candidates(&self, candidates: Vec<ResponseCandidate>) -> Vec<ResponseCandidate> {
        let mut viable: Vec<ResponseCandidate> = candidates
            .into_iter()
            .filter(|candidate| candidate.confidence >= self.config.min_confidence)
            .collect();
        viable.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        viable.truncate(self.config.max_candidates);
        viable
    }

    fn fallback(&self, requested_type: ResponseType, reason: &str) -> GeneratedResponse {
        let content = match requested_type {
            ResponseType::Clarification => "Could you tell me more about what you mean?",
            ResponseType::FollowUp => "Is there anything else you would like to explore?",
            ResponseType::Suggestion => "Let me gather more context before suggesting anything.",
            ResponseType::Summary => "I don't have enough information to summarize yet.",
            ResponseType::Action => "I need more detail before proposing an action.",
            _ => "I'm not sure how to respond to that.",
        };

        GeneratedResponse {
            content: content.to_string(),
            response_type: ResponseType::Fallback,
            confidence: 0.5,
            alternatives: Vec::new(),
            context_used: Vec::new(),
            metadata: json!({"reason": reason, "original_type": requested_type}),
            timestamp: Utc::now(),
        }
    }
}

/// Resolve a template variable from the context entry's content map, with
/// `query` always available.
fn extract_variable(
    variable: &str,
    context: Option<&ContextEntry>,
    query: &str,
) -> Option<String> {
    if variable == "query" {
        return Some(query.to_string());
    }
    let entry = context?;
    match entry.content.get(variable) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn default_templates() -> Vec<ResponseTemplate> {
    vec![
        ResponseTemplate::new(
            "clarify_topic",
            ResponseType::Clarification,
            "Could you clarify what you mean by {topic}?",
        ),
        ResponseTemplate::new(
            "clarify_restate",
            ResponseType::Clarification,
            "Just to make sure I understand correctly: {summary}?",
        ),
        ResponseTemplate::new(
            "follow_up_topic",
            ResponseType::FollowUp,
            "That's interesting. Could you tell me more about {topic}?",
        ),
        ResponseTemplate::new(
            "suggestion_basic",
            ResponseType::Suggestion,
            "Have you considered {suggestion}?",
        ),
        ResponseTemplate::new(
            "suggestion_contextual",
            ResponseType::Suggestion,
            "Based on {topic}, I recommend {suggestion}.",
        ),
        ResponseTemplate::new(
            "summary_points",
            ResponseType::Summary,
            "To summarize: {summary}",
        ),
        ResponseTemplate::new(
            "interview_follow_up",
            ResponseType::FollowUp,
            "You mentioned {topic}. How did that shape your approach?",
        )
        .for_role(Role::Interviewer),
    ]
}
