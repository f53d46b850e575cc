/*
 * Conversation Assistant - AI Provider
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

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::AiConfig;

/// Options for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.5,
            system_prompt: None,
        }
    }
}

/// Narrow seam to the remote model used by analyzers and the response
/// generator.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiClient {
    client: Client,
    config: AiConfig,
}

impl OpenAiClient {
    pub fn new(config: AiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl AiProvider for OpenAiClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .context("AI completion request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("AI API error ({status}): {error_text}"));
        }

        let payload: Value = response
            .json()
            .await
            .context("Failed to parse AI response body")?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|content| content.trim().to_string())
            .ok_or_else(|| anyhow!("AI response missing completion content"))
    }
}

/// Pull a JSON value out of model output, tolerating fenced code blocks and
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // Fenced block: ```json ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    // First brace to last brace.
    let open = trimmed.find(['{', '['])?;
    let close = trimmed.rfind(['}', ']'])?;
    if close > open {
        serde_json::from_str(&trimmed[open..=close]).ok()
    } else {
        None
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Provider returning canned responses in order; errors once exhausted.
    pub struct ScriptedProvider {
        responses: parking_lot::Mutex<VecDeque<String>>,
    }

    impl ScriptedProvider {
        pub fn new<I, S>(responses: I) -> std::sync::Arc<Self>
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            std::sync::Arc::new(Self {
                responses: parking_lot::Mutex::new(
                    responses.into_iter().map(Into::into).collect(),
                ),
            })
        }

        pub fn empty() -> std::sync::Arc<Self> {
            Self::new(Vec::<String>::new())
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted response available"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"sentiment\": \"positive\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["sentiment"], "positive");
    }

    #[test]
    fn extracts_embedded_object() {
        let text = "The result is {\"score\": 0.5} as requested.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["score"], 0.5);
    }

    #[test]
    fn rejects_non_json() {
        assert!(extract_json("no structure here").is_none());
    }
}
