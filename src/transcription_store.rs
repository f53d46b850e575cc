/*
 * Conversation Assistant - Transcription Store
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
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::TranscriptionSettings;
use crate::transcription::TranscriptionResult;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Rolling statistics for one speaker label across a session.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerProfile {
    pub first_seen: DateTime<Utc>,
    pub total_segments: u64,
    pub total_words: u64,
    pub total_duration: f64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    pub processed_chunks: u64,
    pub stable_segments: u64,
    pub partial_updates: u64,
    pub total_words: u64,
    pub stable_words: u64,
    pub speaker_times: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub last_sequence: u64,
    pub current_speaker: Option<String>,
    pub speakers_seen: HashSet<String>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Active transcription session.
#[derive(Debug, Clone)]
pub struct TranscriptionSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub config: TranscriptionSettings,
    pub state: SessionState,
    pub metrics: SessionMetrics,
}

/// Structured snapshot returned by [`TranscriptionStore::get_session_results`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub duration_secs: f64,
    pub metrics: SessionMetrics,
    pub results: Vec<TranscriptionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<HashMap<String, TranscriptionResult>>,
    pub speakers: HashMap<String, SpeakerProfile>,
}

/// Transcripts grouped by capture source, derived from stored segments.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelTranscripts {
    pub mic: Vec<String>,
    pub desktop: Vec<String>,
    pub combined: Vec<String>,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, TranscriptionSession>,
    results: HashMap<String, Vec<TranscriptionResult>>,
    partials: HashMap<String, HashMap<String, TranscriptionResult>>,
    speaker_profiles: HashMap<String, SpeakerProfile>,
}

/// Authoritative holder of per-session transcription state.
///
/// Stable results append and become immutable; partial results upsert by
/// result id and are dropped once the stable result with the same id lands.
pub struct TranscriptionStore {
    inner: RwLock<StoreInner>,
}

impl TranscriptionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner::default()),
        })
    }

    pub async fn create_session(&self, session_id: &str, config: TranscriptionSettings) {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(
            session_id.to_string(),
            TranscriptionSession {
                session_id: session_id.to_string(),
                start_time: Utc::now(),
                config,
                state: SessionState::default(),
                metrics: SessionMetrics::default(),
            },
        );
        inner.results.insert(session_id.to_string(), Vec::new());
        inner.partials.insert(session_id.to_string(), HashMap::new());
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(session_id)
    }

    /// Count one processed audio chunk against the session.
    pub async fn record_chunk(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.metrics.processed_chunks += 1;
        }
    }

    /// Ingest a transcription result.
    ///
    /// Partials upsert their chain; a stable result finalizes the chain,
    /// removes the matching partial and updates metrics, session state and
    /// speaker profiles.
    pub async fn add_result(
        &self,
        session_id: &str,
        result: TranscriptionResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        if result.is_partial {
            if let Some(partials) = inner.partials.get_mut(session_id) {
                partials.insert(result.result_id.clone(), result);
            }
            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.metrics.partial_updates += 1;
            }
            return Ok(());
        }

        // The stable result supersedes every partial sharing its id.
        if let Some(partials) = inner.partials.get_mut(session_id) {
            partials.remove(&result.result_id);
        }

        for segment in &result.segments {
            let duration = segment.end_time - segment.start_time;
            let profile = inner
                .speaker_profiles
                .entry(segment.speaker.clone())
                .or_insert_with(|| SpeakerProfile {
                    first_seen: Utc::now(),
                    total_segments: 0,
                    total_words: 0,
                    total_duration: 0.0,
                    average_confidence: 0.0,
                });
            profile.total_segments += 1;
            profile.total_words += segment.words.len() as u64;
            profile.total_duration += duration;
            // Incremental mean over segment confidences.
            profile.average_confidence = (profile.average_confidence
                * (profile.total_segments - 1) as f64
                + segment.avg_confidence)
                / profile.total_segments as f64;
        }

        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.metrics.stable_segments += result.segments.len() as u64;
            session.metrics.total_words += result.words.len() as u64;
            session.metrics.stable_words +=
                result.words.iter().filter(|w| w.stable).count() as u64;
            for segment in &result.segments {
                let duration = segment.end_time - segment.start_time;
                *session
                    .metrics
                    .speaker_times
                    .entry(segment.speaker.clone())
                    .or_insert(0.0) += duration;
            }

            session.state.last_sequence += 1;
            session.state.current_speaker =
                result.segments.last().map(|s| s.speaker.clone());
            session
                .state
                .speakers_seen
                .extend(result.segments.iter().map(|s| s.speaker.clone()));
            session.state.last_update = Some(Utc::now());
        }

        inner
            .results
            .entry(session_id.to_string())
            .or_default()
            .push(result);
        Ok(())
    }

    /// Snapshot of stable results, metrics and speaker profiles; the partial
    /// map is included on request.
    pub async fn get_session_results(
        &self,
        session_id: &str,
        include_partial: bool,
    ) -> Result<SessionSnapshot, StoreError> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        let speakers = session
            .state
            .speakers_seen
            .iter()
            .filter_map(|speaker| {
                inner
                    .speaker_profiles
                    .get(speaker)
                    .map(|profile| (speaker.clone(), profile.clone()))
            })
            .collect();

        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            duration_secs: (Utc::now() - session.start_time).num_milliseconds() as f64 / 1000.0,
            metrics: session.metrics.clone(),
            results: inner.results.get(session_id).cloned().unwrap_or_default(),
            partial: include_partial
                .then(|| inner.partials.get(session_id).cloned().unwrap_or_default()),
            speakers,
        })
    }

    /// Stable transcripts grouped by source channel.
    pub async fn channel_transcripts(
        &self,
        session_id: &str,
    ) -> Result<ChannelTranscripts, StoreError> {
        let inner = self.inner.read().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let mut views = ChannelTranscripts::default();
        for result in inner.results.get(session_id).into_iter().flatten() {
            for segment in &result.segments {
                views.combined.push(segment.transcript.clone());
                match segment.channel.as_deref() {
                    Some("ch_0") => views.mic.push(segment.transcript.clone()),
                    Some("ch_1") => views.desktop.push(segment.transcript.clone()),
                    _ => {}
                }
            }
        }
        Ok(views)
    }

    /// Drop every table belonging to the session.
    pub async fn cleanup_session(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(session_id);
        inner.results.remove(session_id);
        inner.partials.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::{SpeakerSegment, Word};

    fn make_word(content: &str, confidence: f64, stable: bool) -> Word {
        Word {
            content: content.to_string(),
            confidence,
            start_time: 0.0,
            end_time: 1.0,
            speaker: Some("spk_0".to_string()),
            speaker_confidence: Some(confidence),
            stable,
        }
    }

    fn make_result(result_id: &str, is_partial: bool, transcript: &str) -> TranscriptionResult {
        let words: Vec<Word> = transcript
            .split_whitespace()
            .map(|w| make_word(w, 0.9, !is_partial))
            .collect();
        TranscriptionResult {
            session_id: "s1".to_string(),
            result_id: result_id.to_string(),
            segments: vec![SpeakerSegment {
                speaker: "spk_0".to_string(),
                channel: Some("ch_0".to_string()),
                start_time: 0.0,
                end_time: 2.0,
                transcript: transcript.to_string(),
                avg_confidence: 0.9,
                words: words.clone(),
            }],
            words,
            is_partial,
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn partial_then_stable_chain() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;

        store
            .add_result("s1", make_result("r1", true, "hel"))
            .await
            .unwrap();
        store
            .add_result("s1", make_result("r1", true, "hello"))
            .await
            .unwrap();
        store
            .add_result("s1", make_result("r1", false, "hello world"))
            .await
            .unwrap();

        let snapshot = store.get_session_results("s1", true).await.unwrap();
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.results[0].segments[0].transcript, "hello world");
        // The chain is finalized: no partial survives under r1.
        assert!(snapshot.partial.as_ref().unwrap().is_empty());
        assert_eq!(snapshot.metrics.partial_updates, 2);
        assert_eq!(snapshot.metrics.stable_segments, 1);
        assert_eq!(snapshot.metrics.total_words, 2);
        assert_eq!(snapshot.metrics.stable_words, 2);
    }

    #[tokio::test]
    async fn latest_partial_wins_per_result_id() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;

        store
            .add_result("s1", make_result("r1", true, "first"))
            .await
            .unwrap();
        store
            .add_result("s1", make_result("r1", true, "first second"))
            .await
            .unwrap();

        let snapshot = store.get_session_results("s1", true).await.unwrap();
        let partial = &snapshot.partial.as_ref().unwrap()["r1"];
        assert_eq!(partial.segments[0].transcript, "first second");
    }

    #[tokio::test]
    async fn speaker_profiles_use_incremental_mean() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;

        let mut first = make_result("r1", false, "one");
        first.segments[0].avg_confidence = 0.8;
        let mut second = make_result("r2", false, "two");
        second.segments[0].avg_confidence = 0.6;

        store.add_result("s1", first).await.unwrap();
        store.add_result("s1", second).await.unwrap();

        let snapshot = store.get_session_results("s1", false).await.unwrap();
        let profile = &snapshot.speakers["spk_0"];
        assert_eq!(profile.total_segments, 2);
        assert!((profile.average_confidence - 0.7).abs() < 1e-9);
        assert!((profile.total_duration - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn speaker_times_accumulate() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;
        store
            .add_result("s1", make_result("r1", false, "a"))
            .await
            .unwrap();
        store
            .add_result("s1", make_result("r2", false, "b"))
            .await
            .unwrap();

        let snapshot = store.get_session_results("s1", false).await.unwrap();
        assert!((snapshot.metrics.speaker_times["spk_0"] - 4.0).abs() < 1e-9);
        assert_eq!(snapshot.metrics.stable_segments, 2);
    }

    #[tokio::test]
    async fn channel_views_group_by_source() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;

        let mut mic_result = make_result("r1", false, "from mic");
        mic_result.segments[0].channel = Some("ch_0".to_string());
        let mut desktop_result = make_result("r2", false, "from desktop");
        desktop_result.segments[0].channel = Some("ch_1".to_string());

        store.add_result("s1", mic_result).await.unwrap();
        store.add_result("s1", desktop_result).await.unwrap();

        let views = store.channel_transcripts("s1").await.unwrap();
        assert_eq!(views.mic, vec!["from mic"]);
        assert_eq!(views.desktop, vec!["from desktop"]);
        assert_eq!(views.combined.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_drops_all_tables() {
        let store = TranscriptionStore::new();
        store
            .create_session("s1", TranscriptionSettings::default())
            .await;
        store
            .add_result("s1", make_result("r1", false, "text"))
            .await
            .unwrap();

        store.cleanup_session("s1").await;
        assert!(!store.has_session("s1").await);
        assert!(matches!(
            store.get_session_results("s1", false).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let store = TranscriptionStore::new();
        let result = store
            .add_result("missing", make_result("r1", false, "x"))
            .await;
        assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
    }
}
