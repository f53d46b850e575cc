/*
 * Conversation Assistant - Audio Processing
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

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Noise profile not calibrated")]
    NotCalibrated,
}

/// Per-chunk processing report.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingInfo {
    pub peak_amplitude: f32,
    pub is_silence: bool,
    pub applied_gain: f32,
}

fn to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Noise gating, normalization, gain control and silence detection over
/// PCM16 chunks.
///
/// Stateful: the noise profile is learned from a calibration window, the
/// normalization peak decays across chunks, and silence duration accumulates
/// until it crosses `min_duration`.
pub struct AudioProcessor {
    noise_threshold: f32,
    gain: f32,
    sample_rate: u32,
    noise_profile: Option<f32>,
    running_max: f32,
    silence_secs: f32,
}

impl AudioProcessor {
    pub fn new(noise_threshold: f32, gain: f32, sample_rate: u32) -> Self {
        Self {
            noise_threshold,
            gain,
            sample_rate,
            noise_profile: None,
            running_max: 0.0,
            silence_secs: 0.0,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.noise_profile.is_some()
    }

    /// Learn the gate threshold: mean absolute amplitude of the calibration
    /// chunk.
    pub fn calibrate_noise(&mut self, audio: &[i16]) {
        if audio.is_empty() {
            self.noise_profile = Some(0.0);
            return;
        }
        let mean_abs =
            audio.iter().map(|&s| to_float(s).abs()).sum::<f32>() / audio.len() as f32;
        self.noise_profile = Some(mean_abs);
    }

    /// Zero samples whose magnitude falls below `threshold × calibration_mean`.
    pub fn reduce_noise(&self, audio: &[i16]) -> Result<Vec<i16>, ProcessingError> {
        let profile = self.noise_profile.ok_or(ProcessingError::NotCalibrated)?;
        let gate = profile * self.noise_threshold;
        Ok(audio
            .iter()
            .map(|&s| {
                let f = to_float(s);
                if f.abs() > gate {
                    s
                } else {
                    0
                }
            })
            .collect())
    }

    /// Normalize towards `target_peak` using a decaying running maximum.
    ///
    /// Returns the scaled chunk and the running peak after the update.
    pub fn normalize(&mut self, audio: &[i16], target_peak: f32) -> (Vec<i16>, f32) {
        let current_peak = audio
            .iter()
            .map(|&s| to_float(s).abs())
            .fold(0.0f32, f32::max);
        self.running_max = current_peak.max(self.running_max * 0.95);

        let out = if self.running_max > 0.0 {
            let factor = target_peak / self.running_max;
            audio.iter().map(|&s| to_pcm(to_float(s) * factor)).collect()
        } else {
            audio.to_vec()
        };
        (out, self.running_max)
    }

    /// Apply static gain and clip to [-1, 1].
    pub fn apply_gain(&self, audio: &[i16]) -> Vec<i16> {
        audio
            .iter()
            .map(|&s| to_pcm(to_float(s) * self.gain))
            .collect()
    }

    /// Accumulate silence duration while RMS stays under `threshold`;
    /// reports silence once the accumulated run reaches `min_duration`.
    pub fn detect_silence(&mut self, audio: &[i16], threshold: f32, min_duration: f32) -> bool {
        if audio.is_empty() {
            return self.silence_secs >= min_duration;
        }
        let rms = (audio.iter().map(|&s| to_float(s).powi(2)).sum::<f32>()
            / audio.len() as f32)
            .sqrt();

        if rms < threshold {
            self.silence_secs += audio.len() as f32 / self.sample_rate as f32;
        } else {
            self.silence_secs = 0.0;
        }
        self.silence_secs >= min_duration
    }

    /// Run the configured stages in order over one chunk.
    pub fn process_chunk(&mut self, audio: &[i16], options: &ProcessingOptions) -> (Vec<i16>, ProcessingInfo) {
        let mut processed = audio.to_vec();
        let mut info = ProcessingInfo {
            peak_amplitude: 0.0,
            is_silence: false,
            applied_gain: self.gain,
        };

        if options.noise_reduction && self.is_calibrated() {
            if let Ok(gated) = self.reduce_noise(&processed) {
                processed = gated;
            }
        }

        if options.normalization {
            let (normalized, peak) = self.normalize(&processed, options.target_peak);
            processed = normalized;
            info.peak_amplitude = peak;
        }

        if options.gain_control {
            processed = self.apply_gain(&processed);
        }

        info.is_silence =
            self.detect_silence(&processed, options.silence_threshold, options.silence_min_duration);

        (processed, info)
    }
}

/// Which processing stages run, and their tunables.
#[derive(Debug, Clone)]
pub struct ProcessingOptions {
    pub noise_reduction: bool,
    pub normalization: bool,
    pub gain_control: bool,
    pub target_peak: f32,
    pub silence_threshold: f32,
    pub silence_min_duration: f32,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            noise_reduction: true,
            normalization: true,
            gain_control: true,
            target_peak: 0.95,
            silence_threshold: 0.01,
            silence_min_duration: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn calibration_stores_mean_amplitude() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        assert!(!processor.is_calibrated());
        // Constant amplitude of 3276 ≈ 0.1 in float
        processor.calibrate_noise(&[3276; 160]);
        assert!(processor.is_calibrated());
        assert_relative_eq!(processor.noise_profile.unwrap(), 0.09997559, epsilon = 1e-4);
    }

    #[test]
    fn noise_gate_zeroes_quiet_samples() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        processor.calibrate_noise(&[3276; 160]); // profile ~0.1

        let input = vec![100i16, 16000, -50, -16000];
        let out = processor.reduce_noise(&input).unwrap();
        assert_eq!(out, vec![0, 16000, 0, -16000]);
    }

    #[test]
    fn uncalibrated_gate_is_an_error() {
        let processor = AudioProcessor::new(1.0, 1.0, 16000);
        assert!(matches!(
            processor.reduce_noise(&[1, 2]),
            Err(ProcessingError::NotCalibrated)
        ));
    }

    #[test]
    fn normalize_scales_to_target_peak() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        // Peak 0.5 → factor 1.9 for target 0.95
        let input = vec![16384i16, -16384, 8192];
        let (out, peak) = processor.normalize(&input, 0.95);
        assert_relative_eq!(peak, 0.5, epsilon = 1e-3);
        assert_relative_eq!(to_float(out[0]), 0.95, epsilon = 1e-2);
        assert_relative_eq!(to_float(out[2]), 0.475, epsilon = 1e-2);
    }

    #[test]
    fn running_max_decays_between_chunks() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        let loud = vec![32000i16; 16];
        let (_, peak1) = processor.normalize(&loud, 0.95);
        let quiet = vec![100i16; 16];
        let (_, peak2) = processor.normalize(&quiet, 0.95);
        assert!(peak2 < peak1);
        assert_relative_eq!(peak2, peak1 * 0.95, epsilon = 1e-4);
    }

    #[test]
    fn gain_clips_at_full_scale() {
        let processor = AudioProcessor::new(1.0, 4.0, 16000);
        let out = processor.apply_gain(&[16384, -16384]);
        assert_eq!(out, vec![32767, -32767]);
    }

    #[test]
    fn silence_accumulates_across_chunks() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        // 0.25 s of silence per chunk, threshold 0.5 s
        let quiet = vec![0i16; 4000];
        assert!(!processor.detect_silence(&quiet, 0.01, 0.5));
        assert!(processor.detect_silence(&quiet, 0.01, 0.5));

        // Loud audio resets the run.
        let loud = vec![20000i16; 4000];
        assert!(!processor.detect_silence(&loud, 0.01, 0.5));
        assert!(!processor.detect_silence(&quiet, 0.01, 0.5));
    }

    #[test]
    fn process_chunk_reports_info() {
        let mut processor = AudioProcessor::new(1.0, 1.0, 16000);
        let input = vec![16384i16; 1600];
        let (out, info) = processor.process_chunk(&input, &ProcessingOptions::default());
        assert_eq!(out.len(), input.len());
        assert!(info.peak_amplitude > 0.0);
        assert!(!info.is_silence);
    }
}
