//! # Speech Enhancement
//!
//! The segmenter runs every candidate block of loud audio through an [`Enhancer`]
//! before deciding whether it is really voice. A good enhancer strips background
//! noise, so noise that tripped the energy detector no longer does afterwards.
//!
//! ## Key Components:
//! - **Enhancer trait**: `pcm in -> pcm out`, same rate and channel count, synchronous
//! - **DspEnhancer**: DC offset removal, noise-floor gate, peak limiter, 3-point smoothing
//! - **SerializedEnhancer**: wraps a shared enhancer so concurrent sessions take turns
//! - **Passthrough**: used when enhancement is disabled
//!
//! ## Thread Safety:
//! One enhancer instance is shared by every session's worker thread. Heavy models
//! are not re-entrant, so the shared instance is usually wrapped in `SerializedEnhancer`.

use crate::audio::convert::{bytes_to_samples, samples_to_bytes};
use crate::config::EnhancementSettings;
use crate::error::{EngineError, EngineResult};
use std::sync::{Mutex, PoisonError};

/// Noise-suppression collaborator.
pub trait Enhancer: Send + Sync {
    /// Enhance 16-bit little-endian PCM. Output has the same format as the input.
    fn enhance(&self, pcm: &[u8]) -> EngineResult<Vec<u8>>;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Enhancer for Passthrough {
    fn enhance(&self, pcm: &[u8]) -> EngineResult<Vec<u8>> {
        Ok(pcm.to_vec())
    }
}

/// Lightweight noise suppression in the time domain.
///
/// Never raises the level of its input: the detector re-checks the output
/// against the same energy threshold, so any gain would turn noise into voice.
///
/// ## Processing Steps:
/// 1. **Remove DC offset**: center audio around zero
/// 2. **Noise gate**: estimate the noise floor from the quietest blocks, mute blocks
///    that do not rise `noise_gate_ratio` times above it and subtract the floor's
///    power from the rest
/// 3. **Peak limit**: scale down when the peak exceeds `peak_ceiling`
/// 4. **Smoothing**: 3-point moving average to knock down high-frequency hiss
#[derive(Debug, Clone)]
pub struct DspEnhancer {
    noise_gate_ratio: f64,
    peak_ceiling: i16,
    smoothing: bool,
}

/// 10ms at 16kHz.
const BLOCK_SAMPLES: usize = 160;

/// Blocks below this RMS are digital silence and say nothing about the noise floor.
const MIN_BLOCK_RMS: f64 = 1.0;

/// A buffer of steady loud audio is voice, not a noise floor.
const MAX_NOISE_FLOOR: f64 = 1000.0;

impl DspEnhancer {
    pub fn new(noise_gate_ratio: f64, peak_ceiling: i16, smoothing: bool) -> Self {
        Self {
            noise_gate_ratio,
            peak_ceiling,
            smoothing,
        }
    }

    pub fn from_settings(settings: &EnhancementSettings) -> Self {
        Self::new(settings.noise_gate_ratio, settings.peak_ceiling, settings.smoothing)
    }

    /// Apply all enabled steps to a sample buffer.
    pub fn process(&self, samples: &[i16]) -> Vec<i16> {
        let mut processed = samples.to_vec();

        let dc_offset = dc_offset(&processed);
        for sample in &mut processed {
            *sample = sample.saturating_sub(dc_offset);
        }

        self.gate_noise(&mut processed);
        self.limit_peak(&mut processed);

        if self.smoothing {
            smooth(&mut processed);
        }

        processed
    }

    fn gate_noise(&self, samples: &mut [i16]) {
        let floor = noise_floor(samples);
        if floor == 0.0 {
            return;
        }

        let open_above = floor * self.noise_gate_ratio;
        for block in samples.chunks_mut(BLOCK_SAMPLES) {
            let level = block_rms(block);
            if level <= open_above {
                block.fill(0);
                continue;
            }
            // Power subtraction: what is left after removing the floor's energy
            let gain = (level * level - floor * floor).sqrt() / level;
            for sample in block.iter_mut() {
                *sample = (*sample as f64 * gain).round() as i16;
            }
        }
    }

    /// Scale down so the loudest sample sits at `peak_ceiling`. Quieter audio is untouched.
    fn limit_peak(&self, samples: &mut [i16]) {
        let max_abs = samples
            .iter()
            .map(|&s| s.saturating_abs())
            .max()
            .unwrap_or(0);

        if max_abs <= self.peak_ceiling {
            return;
        }

        let scale_factor = self.peak_ceiling as f32 / max_abs as f32;
        for sample in samples {
            *sample = (*sample as f32 * scale_factor) as i16;
        }
    }
}

impl Enhancer for DspEnhancer {
    fn enhance(&self, pcm: &[u8]) -> EngineResult<Vec<u8>> {
        let samples = bytes_to_samples(pcm).map_err(|e| EngineError::Model(e.to_string()))?;
        Ok(samples_to_bytes(&self.process(&samples)))
    }
}

fn dc_offset(samples: &[i16]) -> i16 {
    if samples.is_empty() {
        return 0;
    }
    let sum: i64 = samples.iter().map(|&s| s as i64).sum();
    (sum / samples.len() as i64) as i16
}

fn block_rms(block: &[i16]) -> f64 {
    if block.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = block.iter().map(|&s| s as f64 * s as f64).sum();
    (sum_squares / block.len() as f64).sqrt()
}

/// 20th percentile of the per-block RMS, ignoring digital silence.
///
/// Returns 0 when every block is silent.
fn noise_floor(samples: &[i16]) -> f64 {
    let mut levels: Vec<f64> = samples
        .chunks(BLOCK_SAMPLES)
        .map(block_rms)
        .filter(|&level| level >= MIN_BLOCK_RMS)
        .collect();
    if levels.is_empty() {
        return 0.0;
    }
    levels.sort_by(f64::total_cmp);
    levels[levels.len() / 5].min(MAX_NOISE_FLOOR)
}

fn smooth(samples: &mut [i16]) {
    if samples.len() < 3 {
        return;
    }
    let original = samples.to_vec();
    for i in 1..samples.len() - 1 {
        let avg = (original[i - 1] as i32 + original[i] as i32 + original[i + 1] as i32) / 3;
        samples[i] = avg as i16;
    }
}

/// Serializes access to an enhancer shared across sessions.
pub struct SerializedEnhancer<E> {
    inner: Mutex<E>,
}

impl<E: Enhancer> SerializedEnhancer<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<E: Enhancer> Enhancer for SerializedEnhancer<E> {
    fn enhance(&self, pcm: &[u8]) -> EngineResult<Vec<u8>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.enhance(pcm)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::detector::{detect_noise, rms, SampleWidth};
    use crate::config::AppConfig;

    /// Deterministic uniform noise in [-450, 450], RMS about 260.
    pub(crate) fn noise(len: usize, seed: u64) -> Vec<i16> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) % 901) as i16 - 450
            })
            .collect()
    }

    /// 500Hz square wave at 16kHz.
    pub(crate) fn square(len: usize, amplitude: i16) -> Vec<i16> {
        (0..len)
            .map(|i| if (i / 16) % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn default_enhancer() -> SerializedEnhancer<DspEnhancer> {
        SerializedEnhancer::new(DspEnhancer::from_settings(&AppConfig::default().enhancement))
    }

    fn peak(samples: &[i16]) -> i16 {
        samples.iter().map(|s| s.saturating_abs()).max().unwrap_or(0)
    }

    #[test]
    fn test_dc_offset_removed() {
        let enhancer = DspEnhancer::new(2.0, 28000, false);
        let shifted: Vec<i16> = (0..100).map(|i| if i % 2 == 0 { 1500 } else { 500 }).collect();
        let processed = enhancer.process(&shifted);
        let mean: i64 = processed.iter().map(|&s| s as i64).sum::<i64>() / processed.len() as i64;
        assert!(mean.abs() <= 1);
    }

    #[test]
    fn test_background_noise_above_threshold_is_suppressed() {
        let hiss = samples_to_bytes(&noise(16000, 7));
        assert!(detect_noise(&hiss, SampleWidth::I16, 200.0));

        let out = default_enhancer().enhance(&hiss).unwrap();
        assert_eq!(out.len(), hiss.len());
        assert!(!detect_noise(&out, SampleWidth::I16, 200.0));
    }

    #[test]
    fn test_speech_between_noise_survives() {
        // 200ms bursts separated by 100ms of background noise
        let mut input = Vec::new();
        for seed in 0..3 {
            input.extend(square(3200, 6000));
            input.extend(noise(1600, seed));
        }

        let out_bytes = default_enhancer().enhance(&samples_to_bytes(&input)).unwrap();
        let out = bytes_to_samples(&out_bytes).unwrap();

        assert!(detect_noise(&out_bytes, SampleWidth::I16, 200.0));
        assert!(peak(&out) <= peak(&input));
        // The pause is gated to silence; smoothing bleeds one sample in at each edge
        assert!(rms(&samples_to_bytes(&out[3210..4790]), SampleWidth::I16) < 1.0);
    }

    #[test]
    fn test_quiet_speech_is_never_boosted() {
        let enhancer = DspEnhancer::new(2.0, 28000, false);
        let speech = square(1600, 5000);
        let out = enhancer.process(&speech);
        assert!(peak(&out) <= 5000);
        assert!(peak(&out) > 4000);
    }

    #[test]
    fn test_peaks_above_ceiling_are_limited() {
        let enhancer = DspEnhancer::new(2.0, 28000, false);
        let out = enhancer.process(&square(1600, 32000));
        assert!(peak(&out) <= 28000);
        assert!(peak(&out) >= 27900);
    }

    #[test]
    fn test_silence_stays_silent() {
        let enhancer = SerializedEnhancer::new(DspEnhancer::new(2.0, 28000, true));
        let silence = vec![0u8; 3200];
        let out = enhancer.enhance(&silence).unwrap();
        assert_eq!(out.len(), silence.len());
        assert!(!detect_noise(&out, SampleWidth::I16, 200.0));
    }

    #[test]
    fn test_odd_length_is_a_model_error() {
        let err = DspEnhancer::new(2.0, 28000, true).enhance(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, EngineError::Model(_)));
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(Passthrough.enhance(&[1, 2, 3, 4]).unwrap(), vec![1, 2, 3, 4]);
    }
}
