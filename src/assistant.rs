/*
 * Conversation Assistant - Session Orchestrator
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
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::ai::AiProvider;
use crate::analysis_engine::{AnalysisEngine, AnalysisSummary};
use crate::analysis_types::{AnalysisError, AnalysisRequest, AnalysisResult};
use crate::analyzers::AnalyzerRegistry;
use crate::audio_buffer::AudioRingBuffer;
use crate::audio_capture::AudioCapture;
use crate::audio_mixer::{bytes_to_pcm, AudioMixer, MixedChunk};
use crate::config::Config;
use crate::context_store::{ContextLevel, ContextMetadata, ContextSource, ContextStore};
use crate::event_bus::EventBus;
use crate::response::{GeneratedResponse, ResponseGenerator, ResponseRequest};
use crate::transcription::{
    AsrTransport, TranscriptionClient, TranscriptionResult, TranscriptionResultReceiver,
};
use crate::transcription_store::{SessionSnapshot, TranscriptionStore};
use crate::types::{ChannelKey, Event, EventType};

struct SessionHandle {
    buffer: Arc<AudioRingBuffer>,
    capture: Option<Arc<AudioCapture>>,
    client: Arc<TranscriptionClient>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Top-level engine: owns the bus and every subsystem, and manages session
/// lifecycle. Dropping a session through [`cleanup_session`] releases its
/// buffers, transcription state, context and analysis records.
///
/// [`cleanup_session`]: ConversationAssistant::cleanup_session
pub struct ConversationAssistant {
    config: Config,
    event_bus: Arc<EventBus>,
    transport: Arc<dyn AsrTransport>,
    provider: Arc<dyn AiProvider>,
    pub transcription_store: Arc<TranscriptionStore>,
    pub context_store: Arc<ContextStore>,
    pub engine: Arc<AnalysisEngine>,
    response_generator: Arc<ResponseGenerator>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    cancel: CancellationToken,
}

impl ConversationAssistant {
    pub fn new(
        config: Config,
        transport: Arc<dyn AsrTransport>,
        provider: Arc<dyn AiProvider>,
    ) -> Arc<Self> {
        let event_bus = EventBus::new();
        let transcription_store = TranscriptionStore::new();
        let context_store = ContextStore::new(Arc::clone(&event_bus), config.context.clone());
        let engine = AnalysisEngine::new(
            Arc::clone(&event_bus),
            Arc::new(AnalyzerRegistry::with_defaults()),
            Arc::clone(&provider),
            config.analysis.clone(),
        );
        let response_generator = Arc::new(ResponseGenerator::new(
            Arc::clone(&event_bus),
            Arc::clone(&provider),
            config.response.clone(),
        ));

        Arc::new(Self {
            config,
            event_bus,
            transport,
            provider,
            transcription_store,
            context_store,
            engine,
            response_generator,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn provider(&self) -> Arc<dyn AiProvider> {
        Arc::clone(&self.provider)
    }

    /// Start the engine, context sweeps and the metrics loop.
    pub async fn start(self: &Arc<Self>) {
        self.engine.start().await;
        self.context_store.start();
        self.spawn_metrics_loop();
        tracing::info!("conversation assistant started");
    }

    /// Stop every session and background loop.
    pub async fn stop(self: &Arc<Self>) {
        let session_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in session_ids {
            if let Err(e) = self.cleanup_session(&session_id).await {
                tracing::warn!("session cleanup during shutdown failed: {e:#}");
            }
        }
        self.cancel.cancel();
        self.context_store.stop();
        self.engine.stop().await;
        self.event_bus.shutdown().await;
        tracing::info!("conversation assistant stopped");
    }

    fn spawn_metrics_loop(self: &Arc<Self>) {
        let assistant = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.config.metrics_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let metrics = assistant.engine.metrics_snapshot().await;
                assistant
                    .event_bus
                    .publish(Event::new(
                        EventType::Metrics,
                        json!({
                            "status": "engine_metrics",
                            "active_tasks": metrics.active_tasks,
                            "running_pipelines": metrics.running_pipelines,
                            "sessions": assistant.sessions.read().await.len(),
                        }),
                    ))
                    .await;
            }
        });
    }

    /// Create the session plumbing: ring buffer, transcription stream, the
    /// audio pump and the result ingestion task. Device capture is started
    /// separately by [`start_capture`](ConversationAssistant::start_capture).
    pub async fn create_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            anyhow::bail!("session already exists: {session_id}");
        }

        let buffer = AudioRingBuffer::new(
            self.config.buffer.max_size,
            self.config.buffer.chunk_size,
            self.config.audio.sample_rate,
        );
        self.transcription_store
            .create_session(session_id, self.config.transcription.clone())
            .await;

        let (client, results_rx) = TranscriptionClient::new(
            Arc::clone(&self.transport),
            self.config.transcription.clone(),
            Arc::clone(&self.event_bus),
            session_id.to_string(),
        );
        client
            .start_stream()
            .await
            .context("failed to open transcription stream")?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(self.spawn_audio_pump(
            session_id.to_string(),
            Arc::clone(&buffer),
            Arc::clone(&client),
            cancel.clone(),
        ));
        tasks.push(self.spawn_result_ingest(session_id.to_string(), results_rx, cancel.clone()));

        sessions.insert(
            session_id.to_string(),
            SessionHandle {
                buffer,
                capture: None,
                client,
                cancel,
                tasks,
            },
        );
        tracing::info!(session_id, "session created");
        Ok(())
    }

    /// Open the configured devices and start the capture loop for a
    /// session. Device failures surface to the caller.
    pub async fn start_capture(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let buffer = {
            let sessions = self.sessions.read().await;
            let handle = sessions
                .get(session_id)
                .with_context(|| format!("unknown session: {session_id}"))?;
            Arc::clone(&handle.buffer)
        };

        let capture = Arc::new(AudioCapture::new(
            Arc::clone(&self.event_bus),
            buffer,
            self.config.audio.clone(),
            session_id.to_string(),
        ));
        capture.start().await.context("failed to start capture")?;

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get_mut(session_id) {
            handle.capture = Some(capture);
        }
        Ok(())
    }

    /// Ring buffer for a session, for callers feeding audio directly.
    pub async fn session_buffer(&self, session_id: &str) -> Option<Arc<AudioRingBuffer>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|handle| Arc::clone(&handle.buffer))
    }

    /// Pump: drain the ring buffer at the chunk cadence and forward to the
    /// transcription client. In two-channel mode ch_0/ch_1 are interleaved
    /// LRLR; otherwise the mixed main channel streams as mono.
    fn spawn_audio_pump(
        self: &Arc<Self>,
        session_id: String,
        buffer: Arc<AudioRingBuffer>,
        client: Arc<TranscriptionClient>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let assistant = Arc::clone(self);
        let stereo = self.config.transcription.number_of_channels == 2;
        let chunk_size = self.config.buffer.chunk_size;
        let read_timeout = Duration::from_millis(self.config.audio.chunk_duration_ms.max(10) * 2);

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let payload = if stereo {
                    let ch0 = tokio::select! {
                        _ = cancel.cancelled() => break,
                        data = buffer.read(Some(chunk_size), Some(ChannelKey::Ch0), Some(read_timeout)) => data,
                    };
                    let ch1 = buffer
                        .read(Some(chunk_size), Some(ChannelKey::Ch1), None)
                        .await;
                    match (ch0, ch1) {
                        (None, None) => continue,
                        (ch0, ch1) => {
                            let chunk = MixedChunk {
                                combined: Vec::new(),
                                ch0: ch0.as_deref().map(bytes_to_pcm).unwrap_or_default(),
                                ch1: ch1.as_deref().map(bytes_to_pcm).unwrap_or_default(),
                            };
                            AudioMixer::create_stereo_chunk(&chunk)
                        }
                    }
                } else {
                    let main = tokio::select! {
                        _ = cancel.cancelled() => break,
                        data = buffer.read(Some(chunk_size), Some(ChannelKey::Main), Some(read_timeout)) => data,
                    };
                    match main {
                        Some(data) => data,
                        None => continue,
                    }
                };

                if payload.is_empty() {
                    continue;
                }

                assistant.transcription_store.record_chunk(&session_id).await;
                if let Err(e) = client.process_audio(payload).await {
                    tracing::debug!(session_id, "audio forward failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        })
    }

    /// Ingest parsed transcription results: the store stays authoritative
    /// for partial chains, and stable results also land in the context
    /// store for downstream analysis.
    fn spawn_result_ingest(
        self: &Arc<Self>,
        session_id: String,
        mut results_rx: TranscriptionResultReceiver,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let assistant = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = results_rx.recv() => result,
                };
                let Some(result) = result else { break };
                assistant.ingest_result(&session_id, result).await;
            }
        })
    }

    async fn ingest_result(&self, session_id: &str, result: TranscriptionResult) {
        let is_partial = result.is_partial;
        let transcript = result
            .segments
            .iter()
            .map(|segment| segment.transcript.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let speakers: Vec<String> = result
            .segments
            .iter()
            .map(|segment| segment.speaker.clone())
            .collect();

        if let Err(e) = self.transcription_store.add_result(session_id, result).await {
            tracing::warn!(session_id, "failed to store transcription result: {e}");
            return;
        }

        if !is_partial && !transcript.is_empty() {
            let metadata =
                ContextMetadata::new(ContextSource::Conversation, ContextLevel::Relevant)
                    .with_tags(["transcript".to_string()])
                    .with_references([format!("session:{session_id}")]);
            if let Err(e) = self
                .context_store
                .add_entry(
                    json!({
                        "text": transcript,
                        "speakers": speakers,
                        "session_id": session_id,
                    }),
                    metadata,
                )
                .await
            {
                tracing::warn!(session_id, "failed to add transcript context: {e}");
            }
        }
    }

    /// Submit an analysis request for a session.
    pub async fn analyze(
        self: &Arc<Self>,
        request: AnalysisRequest,
    ) -> Result<
        (String, UnboundedReceiverStream<Result<AnalysisResult, AnalysisError>>),
        AnalysisError,
    > {
        self.engine.submit_request(request).await
    }

    /// Generate a response suggestion.
    pub async fn respond(&self, request: &ResponseRequest) -> GeneratedResponse {
        self.response_generator.generate(request).await
    }

    pub async fn analysis_summary(&self, session_id: &str) -> AnalysisSummary {
        self.engine.aggregator.get_summary(session_id).await
    }

    pub async fn session_results(
        &self,
        session_id: &str,
        include_partial: bool,
    ) -> Result<SessionSnapshot> {
        Ok(self
            .transcription_store
            .get_session_results(session_id, include_partial)
            .await?)
    }

    /// Cancel a session's in-flight work and release everything it owns:
    /// audio streams, transcription session, analysis tasks, buffers and
    /// stores. The cancellation cascades; cleanup leaves no half-drained
    /// state behind.
    pub async fn cleanup_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .with_context(|| format!("unknown session: {session_id}"))?
        };

        handle.cancel.cancel();
        if let Some(capture) = &handle.capture {
            capture.stop().await;
        }
        if let Err(e) = handle.client.stop_stream().await {
            tracing::debug!(session_id, "transcription stop during cleanup: {e}");
        }
        for task in handle.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        handle.buffer.clear(None).await;

        self.engine.cancel_analysis(session_id).await;
        self.engine.cleanup_session(session_id).await;
        self.transcription_store.cleanup_session(session_id).await;

        tracing::info!(session_id, "session cleaned up");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
