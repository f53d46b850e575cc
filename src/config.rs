/*
 * Conversation Assistant - Rust Edition
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

use anyhow::{Context, Result};
use dirs::home_dir;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use crate::analysis_types::AnalysisType;
use crate::types::AudioConfig;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub audio: AudioConfig,
    pub buffer: BufferConfig,
    pub transcription: TranscriptionSettings,
    pub analysis: AnalysisConfig,
    pub context: ContextConfig,
    pub response: ResponseConfig,
    pub ai: AiConfig,
    pub temp_dir: PathBuf,
    /// Interval for engine metrics events, in milliseconds.
    pub metrics_interval_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let audio = AudioConfig {
            sample_rate: env_or("AUDIO_SAMPLE_RATE", 16000),
            channels: env_or("AUDIO_CHANNELS", 1),
            chunk_duration_ms: env_or("AUDIO_CHUNK_DURATION_MS", 100),
            format: crate::types::AudioFormat::Pcm16,
            mic_device: env::var("AUDIO_MIC_DEVICE").ok(),
            loopback_device: env::var("AUDIO_LOOPBACK_DEVICE").ok(),
        };

        let buffer = BufferConfig {
            max_size: env_or("BUFFER_MAX_SIZE", 32768),
            chunk_size: env_or("BUFFER_CHUNK_SIZE", 1024),
        };

        let transcription = TranscriptionSettings {
            language_code: env::var("ASR_LANGUAGE_CODE").unwrap_or_else(|_| "en-US".to_string()),
            media_sample_rate_hz: env_or("ASR_SAMPLE_RATE", 16000),
            media_encoding: env::var("ASR_MEDIA_ENCODING").unwrap_or_else(|_| "pcm".to_string()),
            enable_speaker_separation: env_or("ASR_SPEAKER_SEPARATION", true),
            enable_channel_identification: env_or("ASR_CHANNEL_IDENTIFICATION", true),
            number_of_channels: env_or("ASR_CHANNELS", 2),
            enable_partial_results_stabilization: env_or("ASR_PARTIAL_STABILIZATION", true),
            max_retries: env_or("ASR_MAX_RETRIES", 3),
            retry_delay_ms: env_or("ASR_RETRY_DELAY_MS", 1000),
            max_event_bytes: env_or("ASR_MAX_EVENT_BYTES", 16384),
        };

        let temp_dir = env::var("TEMP_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".conversation-assistant")
                .join("temp")
        });

        std::fs::create_dir_all(&temp_dir).context("Failed to create temporary directory")?;

        let ai = AiConfig {
            api_key: env::var("AI_API_KEY").unwrap_or_default(),
            base_url: env::var("AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            max_tokens: env_or("AI_MAX_TOKENS", 1000),
            temperature: env_or("AI_TEMPERATURE", 0.5),
        };

        Ok(Config {
            audio,
            buffer,
            transcription,
            analysis: AnalysisConfig::default(),
            context: ContextConfig::default(),
            response: ResponseConfig::default(),
            ai,
            temp_dir,
            metrics_interval_ms: env_or("METRICS_INTERVAL_MS", 1000),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            buffer: BufferConfig::default(),
            transcription: TranscriptionSettings::default(),
            analysis: AnalysisConfig::default(),
            context: ContextConfig::default(),
            response: ResponseConfig::default(),
            ai: AiConfig::default(),
            temp_dir: std::env::temp_dir().join("conversation-assistant"),
            metrics_interval_ms: 1000,
        }
    }
}

/// Ring buffer sizing.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum bytes retained per channel.
    pub max_size: usize,
    /// Size of chunks yielded by `read_stream`.
    pub chunk_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 32768,
            chunk_size: 1024,
        }
    }
}

/// Settings handed to the ASR transport when opening a stream.
#[derive(Debug, Clone)]
pub struct TranscriptionSettings {
    pub language_code: String,
    pub media_sample_rate_hz: u32,
    pub media_encoding: String,
    pub enable_speaker_separation: bool,
    pub enable_channel_identification: bool,
    pub number_of_channels: u16,
    pub enable_partial_results_stabilization: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Server-side maximum event size; chunks are coalesced up to this.
    pub max_event_bytes: usize,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            language_code: "en-US".to_string(),
            media_sample_rate_hz: 16000,
            media_encoding: "pcm".to_string(),
            enable_speaker_separation: true,
            enable_channel_identification: true,
            number_of_channels: 2,
            enable_partial_results_stabilization: true,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_event_bytes: 16384,
        }
    }
}

/// Configuration for the analysis engine.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub enabled_analyzers: HashSet<AnalysisType>,
    pub max_concurrent_tasks: usize,
    /// Default per-task timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Cap on a single pipeline stage, in milliseconds.
    pub max_stage_duration_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled_analyzers: [
                AnalysisType::Sentiment,
                AnalysisType::Topic,
                AnalysisType::Quality,
                AnalysisType::Engagement,
                AnalysisType::Behavioral,
                AnalysisType::Compliance,
            ]
            .into_iter()
            .collect(),
            max_concurrent_tasks: 10,
            default_timeout_ms: 30_000,
            max_stage_duration_ms: 60_000,
        }
    }
}

/// Configuration for the context store.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_entries: usize,
    /// Retention period in seconds; entries older than this are swept.
    pub retention_period_secs: Option<u64>,
    pub auto_archive: bool,
    /// Background sweep cadence in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            retention_period_secs: None,
            auto_archive: true,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Configuration for response generation.
#[derive(Debug, Clone)]
pub struct ResponseConfig {
    pub min_confidence: f64,
    pub max_candidates: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.4,
            max_candidates: 3,
        }
    }
}

/// Settings for the bundled OpenAI-compatible chat provider.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1000,
            temperature: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.analysis.max_concurrent_tasks, 10);
        assert_eq!(config.analysis.default_timeout_ms, 30_000);
        assert_eq!(config.analysis.max_stage_duration_ms, 60_000);
        assert_eq!(config.context.cleanup_interval_secs, 3600);
        assert_eq!(config.metrics_interval_ms, 1000);
        assert_eq!(config.buffer.max_size, 32768);
    }

    #[test]
    fn analysis_defaults_enable_required_analyzers() {
        let analysis = AnalysisConfig::default();
        assert!(analysis.enabled_analyzers.contains(&AnalysisType::Sentiment));
        assert!(analysis.enabled_analyzers.contains(&AnalysisType::Compliance));
        assert_eq!(analysis.enabled_analyzers.len(), 6);
    }
}
