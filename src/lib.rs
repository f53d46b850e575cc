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

//! Real-time conversation assistance engine.
//!
//! Captures microphone and desktop-loopback audio, streams it to a
//! transcription service, fuses transcripts with document- and
//! conversation-derived context, runs pluggable analyzers over a staged
//! pipeline, and produces response suggestions, all coordinated through a
//! typed in-process event bus.

pub mod ai;
pub mod analysis_engine;
pub mod analysis_types;
pub mod analyzers;
pub mod assistant;
pub mod audio_buffer;
pub mod audio_capture;
pub mod audio_mixer;
pub mod audio_processor;
pub mod config;
pub mod context_store;
pub mod event_bus;
pub mod response;
pub mod transcription;
pub mod transcription_store;
pub mod types;

pub use assistant::ConversationAssistant;
pub use config::Config;
pub use event_bus::EventBus;
pub use types::{Event, EventType, Role};
