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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Conversation roles used for event filtering and role-specific behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Interviewer,
    Interviewee,
    Support,
    Sales,
    Facilitator,
    General,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Interviewer => write!(f, "interviewer"),
            Role::Interviewee => write!(f, "interviewee"),
            Role::Support => write!(f, "support"),
            Role::Sales => write!(f, "sales"),
            Role::Facilitator => write!(f, "facilitator"),
            Role::General => write!(f, "general"),
        }
    }
}

/// Closed set of event types flowing over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AudioChunk,
    Transcript,
    DocumentProcessed,
    Assistance,
    ToolUse,
    ContextUpdate,
    MessageSent,
    ResponseReceived,
    DocumentAdded,
    Error,
    Metrics,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::AudioChunk => write!(f, "audio_chunk"),
            EventType::Transcript => write!(f, "transcript"),
            EventType::DocumentProcessed => write!(f, "document_processed"),
            EventType::Assistance => write!(f, "assistance"),
            EventType::ToolUse => write!(f, "tool_use"),
            EventType::ContextUpdate => write!(f, "context_update"),
            EventType::MessageSent => write!(f, "message_sent"),
            EventType::ResponseReceived => write!(f, "response_received"),
            EventType::DocumentAdded => write!(f, "document_added"),
            EventType::Error => write!(f, "error"),
            EventType::Metrics => write!(f, "metrics"),
        }
    }
}

/// Immutable event delivered through the bus.
///
/// Payloads are structured JSON maps. A `session_id` key inside the payload
/// scopes the event to one session; its absence means process-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub role: Option<Role>,
    pub metadata: Option<Value>,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            role: None,
            metadata: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Session id from the payload, if the event is session-scoped.
    pub fn session_id(&self) -> Option<&str> {
        self.data.get("session_id").and_then(Value::as_str)
    }
}

/// Channel keys for the audio ring buffer.
///
/// `Main` holds the mixed stream, `Ch0` the microphone, `Ch1` the desktop
/// loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKey {
    Main,
    Ch0,
    Ch1,
}

impl ChannelKey {
    pub const ALL: [ChannelKey; 3] = [ChannelKey::Main, ChannelKey::Ch0, ChannelKey::Ch1];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKey::Main => "main",
            ChannelKey::Ch0 => "ch_0",
            ChannelKey::Ch1 => "ch_1",
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audio sample formats. PCM16 little-endian is canonical internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
}

impl AudioFormat {
    /// Bytes per sample for a single channel.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
        }
    }
}

/// Immutable per-session audio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_ms: u64,
    pub format: AudioFormat,
    pub mic_device: Option<String>,
    pub loopback_device: Option<String>,
}

impl AudioConfig {
    /// Frame size in bytes: one sample across all channels.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// Samples per chunk at the configured cadence.
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_duration_ms / 1000) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_duration_ms: 100,
            format: AudioFormat::Pcm16,
            mic_device: None,
            loopback_device: None,
        }
    }
}

/// One unit of audio delivered by the capture layer.
///
/// Invariant: `data.len() % (channels * bytes_per_sample) == 0`.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: bytes::Bytes,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn alignment(&self) -> usize {
        self.channels as usize * AudioFormat::Pcm16.bytes_per_sample()
    }

    pub fn is_aligned(&self) -> bool {
        !self.data.is_empty() && self.data.len() % self.alignment() == 0
    }

    /// Chunk duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        let frames = self.data.len() / self.alignment();
        frames as f64 / self.sample_rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_session_id_extraction() {
        let event = Event::new(
            EventType::Transcript,
            serde_json::json!({"session_id": "s1", "text": "hello"}),
        );
        assert_eq!(event.session_id(), Some("s1"));

        let scoped = Event::new(EventType::Metrics, serde_json::json!({"uptime": 12}));
        assert_eq!(scoped.session_id(), None);
    }

    #[test]
    fn channel_keys_are_stable_strings() {
        assert_eq!(ChannelKey::Main.as_str(), "main");
        assert_eq!(ChannelKey::Ch0.as_str(), "ch_0");
        assert_eq!(ChannelKey::Ch1.as_str(), "ch_1");
    }

    #[test]
    fn chunk_alignment_stereo() {
        let chunk = AudioChunk {
            data: bytes::Bytes::from(vec![0u8; 16]),
            sequence: 0,
            timestamp: Utc::now(),
            channels: 2,
            sample_rate: 16000,
        };
        assert_eq!(chunk.alignment(), 4);
        assert!(chunk.is_aligned());
    }

    #[test]
    fn chunk_duration() {
        // 320 mono frames at 16 kHz = 20 ms
        let chunk = AudioChunk {
            data: bytes::Bytes::from(vec![0u8; 640]),
            sequence: 0,
            timestamp: Utc::now(),
            channels: 1,
            sample_rate: 16000,
        };
        assert!((chunk.duration_ms() - 20.0).abs() < f64::EPSILON);
    }
}
