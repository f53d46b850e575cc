/*
 * Conversation Assistant - Audio Mixer
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

use bytes::{Bytes, BytesMut};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;

/// Canonical rate every stream is brought to before transcription.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Input frames rubato consumes per conversion pass.
const RESAMPLE_BLOCK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error("Failed to initialize resampler: {0}")]
    ResamplerInit(String),
}

/// Rate-conversion state for one capture source.
///
/// A lane whose source already runs at 16 kHz has no converter and its
/// queue is never touched. Otherwise samples wait in `pending` until the
/// converter asks for enough frames to run a pass; the tail shorter than a
/// pass carries over to the next feed.
struct SourceLane {
    converter: Option<FastFixedIn<f32>>,
    pending: VecDeque<f32>,
}

impl SourceLane {
    fn new(source_rate: u32) -> Result<Self, MixerError> {
        let converter = if source_rate == TARGET_SAMPLE_RATE {
            None
        } else {
            let ratio = f64::from(TARGET_SAMPLE_RATE) / f64::from(source_rate);
            let converter =
                FastFixedIn::new(ratio, 1.0, PolynomialDegree::Cubic, RESAMPLE_BLOCK, 1)
                    .map_err(|e| MixerError::ResamplerInit(e.to_string()))?;
            Some(converter)
        };
        Ok(Self {
            converter,
            pending: VecDeque::new(),
        })
    }

    /// Queue incoming samples and emit every full conversion pass the
    /// converter will accept right now.
    fn feed(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(converter) = self.converter.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend(samples.iter().copied());

        let mut out = Vec::new();
        let mut pass = Vec::new();
        loop {
            let needed = converter.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            pass.clear();
            pass.extend(self.pending.drain(..needed));
            match converter.process(&[pass.as_slice()], None) {
                Ok(mut channels) => out.append(&mut channels.remove(0)),
                Err(e) => {
                    tracing::warn!("dropping {needed} samples after failed rate conversion: {e}");
                }
            }
        }
        out
    }
}

/// Output of one mix pass: the averaged stream plus the separated sources,
/// all PCM16 at 16 kHz mono.
#[derive(Debug, Clone, Default)]
pub struct MixedChunk {
    pub combined: Vec<i16>,
    pub ch0: Vec<i16>,
    pub ch1: Vec<i16>,
}

impl MixedChunk {
    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }
}

/// Mixes microphone and desktop audio while keeping the sources separated
/// for channel-identified transcription.
pub struct AudioMixer {
    mic: SourceLane,
    desktop: SourceLane,
}

impl AudioMixer {
    /// `mic_rate` / `desktop_rate` are the native rates of the two capture
    /// streams.
    pub fn new(mic_rate: u32, desktop_rate: u32) -> Result<Self, MixerError> {
        Ok(Self {
            mic: SourceLane::new(mic_rate)?,
            desktop: SourceLane::new(desktop_rate)?,
        })
    }

    /// Resample both sources to 16 kHz mono, pad to equal length, and
    /// produce the halved sum alongside the separated channels.
    pub fn prepare_for_transcription(
        &mut self,
        mic_data: Option<&[f32]>,
        desktop_data: Option<&[f32]>,
    ) -> MixedChunk {
        if mic_data.is_none() && desktop_data.is_none() {
            return MixedChunk::default();
        }

        let mut mic = mic_data.map(|d| self.mic.feed(d)).unwrap_or_default();
        let mut desktop = desktop_data
            .map(|d| self.desktop.feed(d))
            .unwrap_or_default();

        let target_len = mic.len().max(desktop.len());
        mic.resize(target_len, 0.0);
        desktop.resize(target_len, 0.0);

        let combined = mic
            .iter()
            .zip(&desktop)
            .map(|(&m, &d)| float_to_pcm((m + d) / 2.0))
            .collect();

        MixedChunk {
            combined,
            ch0: mic.into_iter().map(float_to_pcm).collect(),
            ch1: desktop.into_iter().map(float_to_pcm).collect(),
        }
    }

    /// Interleave ch_0/ch_1 into an LRLR stereo PCM16 byte stream for
    /// two-channel transcription. Shorter channels are zero-padded.
    pub fn create_stereo_chunk(chunk: &MixedChunk) -> Bytes {
        let frames = chunk.ch0.len().max(chunk.ch1.len());
        let mut out = BytesMut::with_capacity(frames * 4);
        for i in 0..frames {
            let left = chunk.ch0.get(i).copied().unwrap_or(0);
            let right = chunk.ch1.get(i).copied().unwrap_or(0);
            out.extend_from_slice(&left.to_le_bytes());
            out.extend_from_slice(&right.to_le_bytes());
        }
        out.freeze()
    }

    /// Duration of a stereo interleaved chunk in milliseconds.
    pub fn stereo_chunk_duration_ms(chunk: &[u8]) -> f64 {
        let frames = chunk.len() / 4;
        frames as f64 / TARGET_SAMPLE_RATE as f64 * 1000.0
    }
}

pub fn float_to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out.freeze()
}

/// Parse little-endian PCM16 bytes back into samples.
pub fn bytes_to_pcm(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
