/*
 * Conversation Assistant - Streaming Transcription Client
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
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Duration;

use crate::config::TranscriptionSettings;
use crate::event_bus::EventBus;
use crate::types::{Event, EventType};

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Transcription rate limit exceeded")]
    RateLimited,

    #[error("Transcription service unavailable")]
    ServiceUnavailable,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream not started")]
    NotStreaming,

    #[error("Invalid state for operation: {0:?}")]
    InvalidState(TranscriptionState),

    #[error("Failed to start stream: {0}")]
    StartFailed(String),
}

/// Error classes reported by the transport for a single operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("throttled")]
    Throttled,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Error,
}

/// One recognized item from the server: a word or punctuation mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrItem {
    pub content: String,
    pub item_type: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    pub speaker: Option<String>,
    pub stable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrAlternative {
    pub transcript: String,
    pub items: Vec<AsrItem>,
}

/// Raw server event surfaced by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrEvent {
    pub result_id: String,
    pub is_partial: bool,
    pub channel_id: Option<u16>,
    pub alternatives: Vec<AsrAlternative>,
}

/// Sending half of an open ASR session.
#[async_trait]
pub trait AsrSink: Send {
    async fn send_audio(&mut self, chunk: Bytes) -> Result<(), TransportError>;
    async fn end_stream(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of an open ASR session.
#[async_trait]
pub trait AsrSource: Send {
    /// Next server event; `None` once the stream is closed.
    async fn next_event(&mut self) -> Option<Result<AsrEvent, TransportError>>;
}

pub struct AsrSession {
    pub sink: Box<dyn AsrSink>,
    pub source: Box<dyn AsrSource>,
}

/// Implementation-provided streaming transcription transport.
#[async_trait]
pub trait AsrTransport: Send + Sync {
    async fn start_stream(
        &self,
        settings: &TranscriptionSettings,
    ) -> Result<AsrSession, TransportError>;
}

/// Word-level transcription data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub content: String,
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub speaker: Option<String>,
    pub speaker_confidence: Option<f64>,
    pub stable: bool,
}

/// Contiguous run of words attributed to one speaker on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker: String,
    pub channel: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub transcript: String,
    pub avg_confidence: f64,
    pub words: Vec<Word>,
}

/// Parsed transcription result; partials sharing a result id are superseded
/// by the stable result that finalizes the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub session_id: String,
    pub result_id: String,
    pub segments: Vec<SpeakerSegment>,
    pub words: Vec<Word>,
    pub is_partial: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

pub type TranscriptionResultSender = mpsc::UnboundedSender<TranscriptionResult>;
pub type TranscriptionResultReceiver = mpsc::UnboundedReceiver<TranscriptionResult>;

/// Streaming client over an [`AsrTransport`].
///
/// State machine: IDLE → STARTING → STREAMING → STOPPING → IDLE, with ERROR
/// reachable from any state on transport failure. Audio sends coalesce up to
/// the server's maximum event size and retry with exponential back-off for
/// throttling and availability errors; bad requests fail fast.
pub struct TranscriptionClient {
    transport: Arc<dyn AsrTransport>,
    settings: TranscriptionSettings,
    event_bus: Arc<EventBus>,
    session_id: String,
    state: RwLock<TranscriptionState>,
    sink: Mutex<Option<Box<dyn AsrSink>>>,
    pending: Mutex<BytesMut>,
    results_tx: TranscriptionResultSender,
    receiver_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TranscriptionClient {
    /// Returns the client plus the receiver for parsed results. The store is
    /// the authoritative consumer of that channel.
    pub fn new(
        transport: Arc<dyn AsrTransport>,
        settings: TranscriptionSettings,
        event_bus: Arc<EventBus>,
        session_id: String,
    ) -> (Arc<Self>, TranscriptionResultReceiver) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            transport,
            settings,
            event_bus,
            session_id,
            state: RwLock::new(TranscriptionState::Idle),
            sink: Mutex::new(None),
            pending: Mutex::new(BytesMut::new()),
            results_tx,
            receiver_task: Mutex::new(None),
        });
        (client, results_rx)
    }

    pub async fn state(&self) -> TranscriptionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: TranscriptionState) {
        *self.state.write().await = state;
    }

    /// Open the stream, retrying with exponential back-off on retryable
    /// transport errors.
    pub async fn start_stream(self: &Arc<Self>) -> Result<(), TranscriptionError> {
        {
            let state = self.state.read().await;
            if *state != TranscriptionState::Idle && *state != TranscriptionState::Error {
                return Err(TranscriptionError::InvalidState(*state));
            }
        }
        self.set_state(TranscriptionState::Starting).await;

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(TranscriptionState::Error).await;
                return Err(e);
            }
        };

        *self.sink.lock().await = Some(session.sink);
        self.spawn_receiver(session.source).await;
        self.set_state(TranscriptionState::Streaming).await;
        Ok(())
    }

    async fn open_session(&self) -> Result<AsrSession, TranscriptionError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.start_stream(&self.settings).await {
                Ok(session) => return Ok(session),
                Err(TransportError::BadRequest(message)) => {
                    return Err(TranscriptionError::BadRequest(message));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.settings.max_retries {
                        return Err(match e {
                            TransportError::Throttled => TranscriptionError::RateLimited,
                            TransportError::ServiceUnavailable => {
                                TranscriptionError::ServiceUnavailable
                            }
                            TransportError::Transport(message) => {
                                TranscriptionError::StartFailed(message)
                            }
                            TransportError::BadRequest(message) => {
                                TranscriptionError::BadRequest(message)
                            }
                        });
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.settings.retry_delay_ms * 2u64.saturating_pow(attempt - 1))
    }

    async fn spawn_receiver(self: &Arc<Self>, source: Box<dyn AsrSource>) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            client.receive_loop(source).await;
        });
        let mut slot = self.receiver_task.lock().await;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Forward an audio chunk; valid only while STREAMING.
    ///
    /// Chunks accumulate until a full event-sized buffer is available, and a
    /// failed send is retried with the same bytes only because no later
    /// chunk can be sent concurrently (sends serialize on the sink).
    pub async fn process_audio(self: &Arc<Self>, chunk: Bytes) -> Result<(), TranscriptionError> {
        {
            let state = self.state.read().await;
            if *state != TranscriptionState::Streaming {
                return Err(TranscriptionError::InvalidState(*state));
            }
        }

        let to_send = {
            let mut pending = self.pending.lock().await;
            pending.extend_from_slice(&chunk);
            if pending.len() < self.settings.max_event_bytes {
                return Ok(());
            }
            let take = pending.len().min(self.settings.max_event_bytes);
            pending.split_to(take).freeze()
        };

        self.send_with_retry(to_send).await
    }

    /// Flush any coalesced remainder immediately.
    pub async fn flush(self: &Arc<Self>) -> Result<(), TranscriptionError> {
        let to_send = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(());
            }
            pending.split().freeze()
        };
        self.send_with_retry(to_send).await
    }

    async fn send_with_retry(self: &Arc<Self>, chunk: Bytes) -> Result<(), TranscriptionError> {
        let mut guard = self.sink.lock().await;

        let mut attempt: u32 = 0;
        let mut reopened = false;
        loop {
            let sink = guard.as_mut().ok_or(TranscriptionError::NotStreaming)?;
            match sink.send_audio(chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(TransportError::BadRequest(message)) => {
                    self.set_state(TranscriptionState::Error).await;
                    self.publish_error("bad_request", &message).await;
                    return Err(TranscriptionError::BadRequest(message));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.settings.max_retries {
                        // Service outages get one transparent session
                        // reopen; the pending chunk is resent on the new
                        // session before anything later can go out.
                        if matches!(e, TransportError::ServiceUnavailable) && !reopened {
                            if let Ok(session) = self.open_session().await {
                                tracing::info!("transcription session reopened after outage");
                                *guard = Some(session.sink);
                                self.spawn_receiver(session.source).await;
                                reopened = true;
                                attempt = 0;
                                continue;
                            }
                        }
                        self.set_state(TranscriptionState::Error).await;
                        let (kind, error) = match e {
                            TransportError::Throttled => {
                                ("throttled", TranscriptionError::RateLimited)
                            }
                            TransportError::ServiceUnavailable => {
                                ("service_unavailable", TranscriptionError::ServiceUnavailable)
                            }
                            TransportError::Transport(message) => {
                                self.publish_error("transport", &message).await;
                                return Err(TranscriptionError::Transport(message));
                            }
                            TransportError::BadRequest(_) => unreachable!(),
                        };
                        self.publish_error(kind, &error.to_string()).await;
                        return Err(error);
                    }
                    tracing::debug!(
                        attempt,
                        "retryable send failure, backing off: {e}"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }

    /// Close the stream: flush the coalescing buffer, end the transport
    /// session and return to IDLE.
    pub async fn stop_stream(self: &Arc<Self>) -> Result<(), TranscriptionError> {
        {
            let state = self.state.read().await;
            if *state != TranscriptionState::Streaming {
                return Err(TranscriptionError::InvalidState(*state));
            }
        }
        self.set_state(TranscriptionState::Stopping).await;

        let _ = self.flush().await;

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.end_stream().await {
                tracing::warn!("error ending transcription stream: {e}");
            }
        }
        if let Some(task) = self.receiver_task.lock().await.take() {
            // The source ends once the server closes; give it a moment.
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        self.set_state(TranscriptionState::Idle).await;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, mut source: Box<dyn AsrSource>) {
        while let Some(event) = source.next_event().await {
            match event {
                Ok(event) => match self.parse_event(event) {
                    Some(result) => {
                        self.event_bus
                            .publish(Event::new(
                                EventType::Transcript,
                                json!({
                                    "session_id": self.session_id.as_str(),
                                    "result_id": result.result_id.as_str(),
                                    "is_partial": result.is_partial,
                                    "transcript": result
                                        .segments
                                        .iter()
                                        .map(|s| s.transcript.as_str())
                                        .collect::<Vec<_>>()
                                        .join(" "),
                                    "confidence": result.confidence,
                                }),
                            ))
                            .await;
                        let _ = self.results_tx.send(result);
                    }
                    None => {
                        tracing::debug!("skipping unparseable transcription event");
                    }
                },
                Err(e) => {
                    self.publish_error("receive", &e.to_string()).await;
                    if !matches!(e, TransportError::Throttled) {
                        self.set_state(TranscriptionState::Error).await;
                        break;
                    }
                }
            }
        }
    }

    /// Translate a server event into a [`TranscriptionResult`].
    ///
    /// The first alternative wins. Channel 0 is tagged `ch_0` (microphone),
    /// channel 1 `ch_1` (desktop) when channel identification is enabled;
    /// speaker labels are retained verbatim.
    fn parse_event(&self, event: AsrEvent) -> Option<TranscriptionResult> {
        let alternative = event.alternatives.into_iter().next()?;

        let channel = if self.settings.enable_channel_identification {
            event.channel_id.map(|id| match id {
                0 => "ch_0".to_string(),
                1 => "ch_1".to_string(),
                other => format!("ch_{other}"),
            })
        } else {
            None
        };

        let words: Vec<Word> = alternative
            .items
            .iter()
            .filter(|item| item.item_type == "pronunciation")
            .map(|item| Word {
                content: item.content.clone(),
                confidence: item.confidence,
                start_time: item.start_time,
                end_time: item.end_time,
                speaker: item.speaker.clone(),
                speaker_confidence: item.speaker.as_ref().map(|_| item.confidence),
                stable: item.stable || !event.is_partial,
            })
            .collect();

        let segments = group_into_segments(&words, channel.as_deref(), &alternative.transcript);

        let confidence = if words.is_empty() {
            0.0
        } else {
            words.iter().map(|w| w.confidence).sum::<f64>() / words.len() as f64
        };

        Some(TranscriptionResult {
            session_id: self.session_id.clone(),
            result_id: event.result_id,
            segments,
            words,
            is_partial: event.is_partial,
            confidence,
            timestamp: Utc::now(),
        })
    }

    async fn publish_error(&self, kind: &str, message: &str) {
        self.event_bus
            .publish(Event::new(
                EventType::Error,
                json!({
                    "status": "transcription_error",
                    "kind": kind,
                    "session_id": self.session_id.as_str(),
                    "error": message,
                }),
            ))
            .await;
    }
}

/// Group time-ordered words into per-speaker segments.
fn group_into_segments(
    words: &[Word],
    channel: Option<&str>,
    fallback_transcript: &str,
) -> Vec<SpeakerSegment> {
    if words.is_empty() {
        if fallback_transcript.is_empty() {
            return Vec::new();
        }
        // Transcript without item detail: a single unattributed segment.
        return vec![SpeakerSegment {
            speaker: "unknown".to_string(),
            channel: channel.map(str::to_string),
            start_time: 0.0,
            end_time: 0.0,
            transcript: fallback_transcript.to_string(),
            avg_confidence: 0.0,
            words: Vec::new(),
        }];
    }

    let mut segments: Vec<SpeakerSegment> = Vec::new();
    for word in words {
        let speaker = word
            .speaker
            .clone()
            .or_else(|| channel.map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        match segments.last_mut() {
            Some(segment) if segment.speaker == speaker => {
                segment.end_time = word.end_time;
                segment.transcript.push(' ');
                segment.transcript.push_str(&word.content);
                segment.words.push(word.clone());
            }
            _ => {
                segments.push(SpeakerSegment {
                    speaker,
                    channel: channel.map(str::to_string),
                    start_time: word.start_time,
                    end_time: word.end_time,
                    transcript: word.content.clone(),
                    avg_confidence: 0.0,
                    words: vec![word.clone()],
                });
            }
        }
    }

    for segment in &mut segments {
        if !segment.words.is_empty() {
            segment.avg_confidence = segment.words.iter().map(|w| w.confidence).sum::<f64>()
                / segment.words.len() as f64;
        }
    }
    segments
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process transport used by client and integration tests.
    pub struct FakeTransport {
        pub events: parking_lot::Mutex<VecDeque<Result<AsrEvent, TransportError>>>,
        /// Errors returned by successive `send_audio` calls before success.
        pub send_failures: parking_lot::Mutex<VecDeque<TransportError>>,
        pub sent: Arc<parking_lot::Mutex<Vec<Bytes>>>,
        pub start_failures: AtomicUsize,
    }

    impl FakeTransport {
        pub fn new(events: Vec<Result<AsrEvent, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                events: parking_lot::Mutex::new(events.into()),
                send_failures: parking_lot::Mutex::new(VecDeque::new()),
                sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
                start_failures: AtomicUsize::new(0),
            })
        }
    }

    pub struct FakeSink {
        failures: VecDeque<TransportError>,
        sent: Arc<parking_lot::Mutex<Vec<Bytes>>>,
    }

    pub struct FakeSource {
        events: VecDeque<Result<AsrEvent, TransportError>>,
    }

    #[async_trait]
    impl AsrSink for FakeSink {
        async fn send_audio(&mut self, chunk: Bytes) -> Result<(), TransportError> {
            if let Some(failure) = self.failures.pop_front() {
                return Err(failure);
            }
            self.sent.lock().push(chunk);
            Ok(())
        }

        async fn end_stream(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl AsrSource for FakeSource {
        async fn next_event(&mut self) -> Option<Result<AsrEvent, TransportError>> {
            self.events.pop_front()
        }
    }

    #[async_trait]
    impl AsrTransport for FakeTransport {
        async fn start_stream(
            &self,
            _settings: &TranscriptionSettings,
        ) -> Result<AsrSession, TransportError> {
            if self.start_failures.load(Ordering::SeqCst) > 0 {
                self.start_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::ServiceUnavailable);
            }
            Ok(AsrSession {
                sink: Box::new(FakeSink {
                    failures: std::mem::take(&mut *self.send_failures.lock()),
                    sent: Arc::clone(&self.sent),
                }),
                source: Box::new(FakeSource {
                    events: std::mem::take(&mut *self.events.lock()),
                }),
            })
        }
    }

    pub fn word_event(
        result_id: &str,
        is_partial: bool,
        words: &[(&str, f64, Option<&str>)],
    ) -> AsrEvent {
        let items = words
            .iter()
            .enumerate()
            .map(|(i, (content, confidence, speaker))| AsrItem {
                content: content.to_string(),
                item_type: "pronunciation".to_string(),
                start_time: i as f64,
                end_time: i as f64 + 0.9,
                confidence: *confidence,
                speaker: speaker.map(str::to_string),
                stable: !is_partial,
            })
            .collect::<Vec<_>>();
        let transcript = words
            .iter()
            .map(|(content, _, _)| *content)
            .collect::<Vec<_>>()
            .join(" ");
        AsrEvent {
            result_id: result_id.to_string(),
            is_partial,
            channel_id: Some(0),
            alternatives: vec![AsrAlternative { transcript, items }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn settings() -> TranscriptionSettings {
        TranscriptionSettings {
            retry_delay_ms: 1,
            max_event_bytes: 8,
            ..TranscriptionSettings::default()
        }
    }

    #[tokio::test]
    async fn state_machine_happy_path() {
        let transport = FakeTransport::new(vec![]);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());

        assert_eq!(client.state().await, TranscriptionState::Idle);
        client.start_stream().await.unwrap();
        assert_eq!(client.state().await, TranscriptionState::Streaming);
        client.stop_stream().await.unwrap();
        assert_eq!(client.state().await, TranscriptionState::Idle);
    }

    #[tokio::test]
    async fn process_audio_requires_streaming() {
        let transport = FakeTransport::new(vec![]);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());

        let err = client.process_audio(Bytes::from_static(&[0, 0])).await;
        assert!(matches!(err, Err(TranscriptionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn coalesces_up_to_max_event_bytes() {
        let transport = FakeTransport::new(vec![]);
        let sent = Arc::clone(&transport.sent);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());
        client.start_stream().await.unwrap();

        // 6 bytes: under the 8-byte target, held back.
        client
            .process_audio(Bytes::from_static(&[1, 2, 3, 4, 5, 6]))
            .await
            .unwrap();
        assert!(sent.lock().is_empty());

        // 4 more bytes crosses the threshold: exactly 8 go out.
        client
            .process_audio(Bytes::from_static(&[7, 8, 9, 10]))
            .await
            .unwrap();
        {
            let sent = sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].len(), 8);
        }

        // The remainder flushes on demand.
        client.flush().await.unwrap();
        assert_eq!(sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn bad_request_fails_fast() {
        let transport = FakeTransport::new(vec![]);
        transport
            .send_failures
            .lock()
            .push_back(TransportError::BadRequest("bad pcm".to_string()));
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());
        client.start_stream().await.unwrap();

        let err = client
            .process_audio(Bytes::from(vec![0u8; 8]))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::BadRequest(_)));
        assert_eq!(client.state().await, TranscriptionState::Error);
    }

    #[tokio::test]
    async fn throttling_retries_then_succeeds() {
        let transport = FakeTransport::new(vec![]);
        transport
            .send_failures
            .lock()
            .push_back(TransportError::Throttled);
        let sent = Arc::clone(&transport.sent);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());
        client.start_stream().await.unwrap();

        client.process_audio(Bytes::from(vec![0u8; 8])).await.unwrap();
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(client.state().await, TranscriptionState::Streaming);
    }

    #[tokio::test]
    async fn unavailable_send_reopens_session() {
        let transport = FakeTransport::new(vec![]);
        {
            let mut failures = transport.send_failures.lock();
            for _ in 0..3 {
                failures.push_back(TransportError::ServiceUnavailable);
            }
        }
        let sent = Arc::clone(&transport.sent);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());
        client.start_stream().await.unwrap();

        // Every send on the first session fails; the client reopens a
        // session transparently and resends the same bytes.
        client.process_audio(Bytes::from(vec![0u8; 8])).await.unwrap();
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(client.state().await, TranscriptionState::Streaming);
    }

    #[tokio::test]
    async fn start_retries_on_unavailable() {
        let transport = FakeTransport::new(vec![]);
        transport
            .start_failures
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let bus = EventBus::new();
        let (client, _rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());

        client.start_stream().await.unwrap();
        assert_eq!(client.state().await, TranscriptionState::Streaming);
    }

    #[tokio::test]
    async fn receiver_parses_and_forwards_results() {
        let transport = FakeTransport::new(vec![
            Ok(word_event("r1", true, &[("hel", 0.5, Some("spk_0"))])),
            Ok(word_event(
                "r1",
                false,
                &[("hello", 0.9, Some("spk_0")), ("world", 0.8, Some("spk_1"))],
            )),
        ]);
        let bus = EventBus::new();
        let (client, mut rx) =
            TranscriptionClient::new(transport, settings(), bus, "s1".to_string());
        client.start_stream().await.unwrap();

        let partial = rx.recv().await.unwrap();
        assert!(partial.is_partial);
        assert_eq!(partial.result_id, "r1");

        let stable = rx.recv().await.unwrap();
        assert!(!stable.is_partial);
        assert_eq!(stable.words.len(), 2);
        // Two speakers produce two segments; labels kept verbatim.
        assert_eq!(stable.segments.len(), 2);
        assert_eq!(stable.segments[0].speaker, "spk_0");
        assert_eq!(stable.segments[1].speaker, "spk_1");
        assert_eq!(stable.segments[0].channel.as_deref(), Some("ch_0"));
        assert!((stable.confidence - 0.85).abs() < 1e-9);
    }
}
