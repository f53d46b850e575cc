/*
 * Conversation Assistant - Audio Capture
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

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio_buffer::AudioRingBuffer;
use crate::audio_mixer::{pcm_to_bytes, AudioMixer, TARGET_SAMPLE_RATE};
use crate::audio_processor::{AudioProcessor, ProcessingOptions};
use crate::event_bus::EventBus;
use crate::types::{AudioConfig, ChannelKey, Event, EventType};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Audio device failed: {0}")]
    DeviceFailed(String),
}

/// Name keywords that mark an input as a system-output loopback.
const LOOPBACK_KEYWORDS: &[&str] = &[
    "monitor of",
    "loopback",
    "stereo mix",
    "what u hear",
    "what you hear",
    "virtual output",
];

fn is_loopback_like(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// How a capture stream picks its device.
#[derive(Debug, Clone)]
pub enum DeviceSelector {
    /// The system default input device.
    DefaultInput,
    /// An input device matched by (substring of) name.
    ByName(String),
    /// The first input that looks like a loopback of the output device.
    Loopback,
}

/// One open input stream.
///
/// The cpal stream lives on a dedicated thread (cpal streams are not Send);
/// its real-time callback downmixes to mono f32 and pushes into a lock-free
/// SPSC ring whose consumer half is handed to the capture task.
pub struct DeviceStream {
    consumer: HeapCons<f32>,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    error: Arc<parking_lot::Mutex<Option<String>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceStream {
    pub fn open(selector: DeviceSelector) -> Result<Self, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let error = Arc::new(parking_lot::Mutex::new(None));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_stop = Arc::clone(&stop);
        let thread_error = Arc::clone(&error);
        let thread = std::thread::spawn(move || {
            run_stream_thread(selector, ready_tx, thread_stop, thread_error);
        });

        match ready_rx.recv() {
            Ok(Ok((consumer, sample_rate))) => Ok(Self {
                consumer,
                sample_rate,
                stop,
                error,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "stream thread exited before reporting readiness".to_string(),
            )),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Drain every sample currently queued by the device callback.
    pub fn drain(&mut self, scratch: &mut Vec<f32>) {
        let queued = self.consumer.occupied_len();
        if queued == 0 {
            scratch.clear();
            return;
        }
        scratch.resize(queued, 0.0);
        let read = self.consumer.pop_slice(scratch);
        scratch.truncate(read);
    }

    /// Error reported by the device callback, if any.
    pub fn take_error(&self) -> Option<String> {
        self.error.lock().take()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

type ReadyResult = Result<(HeapCons<f32>, u32), CaptureError>;

fn run_stream_thread(
    selector: DeviceSelector,
    ready_tx: std::sync::mpsc::Sender<ReadyResult>,
    stop: Arc<AtomicBool>,
    error: Arc<parking_lot::Mutex<Option<String>>>,
) {
    let host = cpal::default_host();

    let device = match find_device(&host, &selector) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready_tx.send(Err(CaptureError::DeviceUnavailable(e.to_string())));
            return;
        }
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;

    // Four seconds of headroom between callback and capture task.
    let ring = HeapRb::<f32>::new(sample_rate as usize * 4);
    let (mut producer, consumer) = ring.split();

    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_slot = Arc::clone(&error);
    let err_fn = move |e: cpal::StreamError| {
        tracing::error!("audio stream error: {e}");
        *err_slot.lock() = Some(e.to_string());
    };

    let mut mono_buf: Vec<f32> = Vec::new();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info| {
                downmix_into(data, channels, &mut mono_buf);
                let written = producer.push_slice(&mono_buf);
                if written < mono_buf.len() {
                    tracing::warn!("capture ring full: dropped {} frames", mono_buf.len() - written);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info| {
                let frames = data.len() / channels;
                mono_buf.resize(frames, 0.0);
                for f in 0..frames {
                    let base = f * channels;
                    let mut sum = 0f32;
                    for c in 0..channels {
                        sum += data[base + c] as f32 / 32768.0;
                    }
                    mono_buf[f] = sum / channels as f32;
                }
                let written = producer.push_slice(&mono_buf);
                if written < mono_buf.len() {
                    tracing::warn!("capture ring full: dropped {} frames", mono_buf.len() - written);
                }
            },
            err_fn,
            None,
        ),
        fmt => {
            let _ = ready_tx.send(Err(CaptureError::StreamBuild(format!(
                "unsupported sample format: {fmt:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(CaptureError::StreamBuild(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::StreamBuild(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok((consumer, sample_rate)));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    drop(stream);
}

fn downmix_into(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.clear();
        out.extend_from_slice(data);
        return;
    }
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for f in 0..frames {
        let base = f * channels;
        let sum: f32 = data[base..base + channels].iter().sum();
        out[f] = sum / channels as f32;
    }
}

fn find_device(host: &cpal::Host, selector: &DeviceSelector) -> Result<cpal::Device, CaptureError> {
    match selector {
        DeviceSelector::DefaultInput => host.default_input_device().ok_or_else(|| {
            CaptureError::DeviceUnavailable("no default input device".to_string())
        }),
        DeviceSelector::ByName(name) => {
            let wanted = name.to_ascii_lowercase();
            let devices = host
                .input_devices()
                .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
            for device in devices {
                if let Ok(device_name) = device.name() {
                    if device_name.to_ascii_lowercase().contains(&wanted) {
                        return Ok(device);
                    }
                }
            }
            Err(CaptureError::DeviceUnavailable(format!(
                "no input device matching '{name}'"
            )))
        }
        DeviceSelector::Loopback => {
            let devices = host
                .input_devices()
                .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
            for device in devices {
                if let Ok(device_name) = device.name() {
                    if is_loopback_like(&device_name) {
                        tracing::info!(device = device_name.as_str(), "using loopback input");
                        return Ok(device);
                    }
                }
            }
            Err(CaptureError::DeviceUnavailable(
                "no loopback-like input device found".to_string(),
            ))
        }
    }
}

/// Coordinates device streams, mixing, processing and ring-buffer writes
/// for one session.
pub struct AudioCapture {
    event_bus: Arc<EventBus>,
    buffer: Arc<AudioRingBuffer>,
    config: AudioConfig,
    session_id: String,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl AudioCapture {
    pub fn new(
        event_bus: Arc<EventBus>,
        buffer: Arc<AudioRingBuffer>,
        config: AudioConfig,
        session_id: String,
    ) -> Self {
        Self {
            event_bus,
            buffer,
            config,
            session_id,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            task: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Open the devices and start the capture loop.
    ///
    /// Device errors during open are returned to the caller; the loopback
    /// stream is optional and capture degrades to microphone-only when it
    /// cannot be found.
    pub async fn start(&self) -> Result<(), CaptureError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning);
        }

        let mic_selector = match &self.config.mic_device {
            Some(name) => DeviceSelector::ByName(name.clone()),
            None => DeviceSelector::DefaultInput,
        };
        let mic = match DeviceStream::open(mic_selector) {
            Ok(stream) => stream,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let loopback_selector = match &self.config.loopback_device {
            Some(name) => DeviceSelector::ByName(name.clone()),
            None => DeviceSelector::Loopback,
        };
        let loopback = match DeviceStream::open(loopback_selector) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!("loopback capture unavailable, continuing with microphone only: {e}");
                None
            }
        };

        let mixer = AudioMixer::new(
            mic.sample_rate(),
            loopback.as_ref().map_or(TARGET_SAMPLE_RATE, DeviceStream::sample_rate),
        )
        .map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            CaptureError::StreamBuild(e.to_string())
        })?;

        let task = tokio::spawn(capture_loop(CaptureLoop {
            event_bus: Arc::clone(&self.event_bus),
            buffer: Arc::clone(&self.buffer),
            config: self.config.clone(),
            session_id: self.session_id.clone(),
            cancel: self.cancel.clone(),
            running: Arc::clone(&self.running),
            mic,
            loopback,
            mixer,
        }));
        *self.task.write().await = Some(task);

        Ok(())
    }

    /// Stop the capture loop and release the device streams.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.write().await.take() {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

struct CaptureLoop {
    event_bus: Arc<EventBus>,
    buffer: Arc<AudioRingBuffer>,
    config: AudioConfig,
    session_id: String,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    mic: DeviceStream,
    loopback: Option<DeviceStream>,
    mixer: AudioMixer,
}

async fn capture_loop(mut ctx: CaptureLoop) {
    let mut processor = AudioProcessor::new(1.5, 1.0, TARGET_SAMPLE_RATE);
    let options = ProcessingOptions::default();
    let mut interval =
        tokio::time::interval(Duration::from_millis(ctx.config.chunk_duration_ms.max(10)));
    let mut sequence: u64 = 0;
    let mut mic_scratch = Vec::new();
    let mut loopback_scratch = Vec::new();

    // Noise-gate calibration window: the first second of combined audio.
    let mut calibration: Vec<i16> = Vec::new();
    let calibration_target = TARGET_SAMPLE_RATE as usize;

    tracing::info!(session_id = ctx.session_id.as_str(), "audio capture started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Some(message) = device_failure(&ctx) {
            tracing::error!("audio device failed: {message}");
            ctx.event_bus
                .publish(Event::new(
                    EventType::Error,
                    json!({
                        "status": "device_failed",
                        "session_id": ctx.session_id.as_str(),
                        "error": message,
                    }),
                ))
                .await;
            break;
        }

        ctx.mic.drain(&mut mic_scratch);
        let loopback_data = match ctx.loopback.as_mut() {
            Some(stream) => {
                stream.drain(&mut loopback_scratch);
                Some(loopback_scratch.as_slice())
            }
            None => None,
        };

        let mixed = ctx.mixer.prepare_for_transcription(
            (!mic_scratch.is_empty()).then_some(mic_scratch.as_slice()),
            loopback_data.filter(|d| !d.is_empty()),
        );
        if mixed.is_empty() {
            continue;
        }

        if !processor.is_calibrated() {
            calibration.extend_from_slice(&mixed.combined);
            if calibration.len() >= calibration_target {
                processor.calibrate_noise(&calibration);
                calibration = Vec::new();
                tracing::debug!("noise gate calibrated");
            }
        }

        let (processed, info) = processor.process_chunk(&mixed.combined, &options);

        let write_result = async {
            ctx.buffer
                .write(pcm_to_bytes(&processed), Some(ChannelKey::Main))
                .await?;
            ctx.buffer
                .write(pcm_to_bytes(&mixed.ch0), Some(ChannelKey::Ch0))
                .await?;
            ctx.buffer
                .write(pcm_to_bytes(&mixed.ch1), Some(ChannelKey::Ch1))
                .await
        }
        .await;

        if let Err(e) = write_result {
            // Per-chunk failure: log and continue after a short back-off.
            tracing::warn!("dropping malformed capture chunk: {e}");
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        ctx.event_bus
            .publish(Event::new(
                EventType::AudioChunk,
                json!({
                    "status": "processed_chunk",
                    "session_id": ctx.session_id.as_str(),
                    "sequence": sequence,
                    "samples": processed.len(),
                    "is_silence": info.is_silence,
                    "peak_amplitude": info.peak_amplitude,
                }),
            ))
            .await;
        sequence += 1;

        tokio::task::yield_now().await;
    }

    ctx.mic.stop();
    if let Some(mut loopback) = ctx.loopback.take() {
        loopback.stop();
    }
    ctx.running.store(false, Ordering::SeqCst);
    tracing::info!(session_id = ctx.session_id.as_str(), "audio capture stopped");
}

fn device_failure(ctx: &CaptureLoop) -> Option<String> {
    if let Some(message) = ctx.mic.take_error() {
        return Some(format!("microphone: {message}"));
    }
    if let Some(loopback) = ctx.loopback.as_ref() {
        if let Some(message) = loopback.take_error() {
            return Some(format!("loopback: {message}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_name_heuristic() {
        assert!(is_loopback_like("Monitor of Built-in Audio"));
        assert!(is_loopback_like("Stereo Mix (Realtek)"));
        assert!(!is_loopback_like("USB Microphone"));
    }

    #[test]
    fn downmix_averages_interleaved_frames() {
        let mut out = Vec::new();
        downmix_into(&[1.0, 0.0, 0.5, 0.5], 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn downmix_mono_is_copy() {
        let mut out = Vec::new();
        downmix_into(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.1, 0.2]);
    }
}
