//! # Audio Format Conversion
//!
//! Conversions between the representations the engine passes around:
//!
//! - **Raw bytes ⇄ samples**: 16-bit little-endian PCM to `i16` and back
//! - **Samples ⇄ floats**: `[-32768, 32767]` to `[-1.0, 1.0]` for the transcription model
//! - **Channel mixing**: interleaved N-channel audio to M channels
//! - **Resampling**: linear interpolation between sample rates
//! - **WAV**: encode/decode RIFF containers with the `wav` crate
//!
//! ## Resampling:
//! Linear interpolation is cheap and good enough for speech. It is applied per
//! frame on the inbound path, so it keeps no filter state between calls.

use crate::error::{EngineError, EngineResult};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Sample rate and channel layout of 16-bit PCM audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Bytes per second of 16-bit PCM in this format.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(EngineError::InvalidAudio(format!(
                "unsupported format: {}Hz x {} channels",
                self.sample_rate, self.channels
            )));
        }
        Ok(())
    }
}

/// Decode 16-bit little-endian PCM bytes.
///
/// ## Returns:
/// - **Err**: odd byte count (not whole 16-bit samples)
pub fn bytes_to_samples(pcm: &[u8]) -> EngineResult<Vec<i16>> {
    if pcm.len() % 2 != 0 {
        return Err(EngineError::InvalidAudio(
            "audio data length must be even for 16-bit samples".to_string(),
        ));
    }
    let mut samples = vec![0i16; pcm.len() / 2];
    LittleEndian::read_i16_into(pcm, &mut samples);
    Ok(samples)
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Scale 16-bit samples to `[-1.0, 1.0]`.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Re-lay interleaved audio from `from` channels to `to` channels.
///
/// Going to mono averages all channels. Going up from mono duplicates the
/// signal. Any other combination goes through mono.
pub fn mix_channels(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let mono: Vec<i16> = if from == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(from as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / from as i32) as i16
            })
            .collect()
    };

    if to == 1 {
        return mono;
    }

    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(to as usize))
        .collect()
}

/// Linear-interpolation resample of interleaved audio.
pub fn resample_linear(samples: &[i16], channels: u16, from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let channels = channels.max(1) as usize;
    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }

    let out_frames = ((in_frames as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = in_frames - 1;

    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let position = i as f64 * step;
        let left = (position.floor() as usize).min(last);
        let right = (left + 1).min(last);
        let frac = position - left as f64;
        for ch in 0..channels {
            let a = samples[left * channels + ch] as f64;
            let b = samples[right * channels + ch] as f64;
            let value = a + (b - a) * frac;
            out.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
        }
    }
    out
}

/// Format conversion for one continuous stream delivered in frames.
///
/// Output frame `k` sits at input position `k * from_rate / to_rate` counted from
/// the start of the stream, so the fractional position carries over between
/// frames and rounding never accumulates into drift.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    from: AudioFormat,
    to: AudioFormat,
    frames_in: u64,
    frames_out: u64,
    /// Last input frame of the previous call, already mixed to `to.channels`.
    carry: Vec<i16>,
}

impl StreamResampler {
    pub fn new(from: AudioFormat, to: AudioFormat) -> Self {
        Self {
            from,
            to,
            frames_in: 0,
            frames_out: 0,
            carry: Vec::new(),
        }
    }

    /// Format of the stream being converted.
    pub fn source(&self) -> AudioFormat {
        self.from
    }

    /// Convert the next frame of the stream.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let mixed = mix_channels(samples, self.from.channels, self.to.channels);
        let from_rate = self.from.sample_rate as u64;
        let to_rate = self.to.sample_rate as u64;
        if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
            return mixed;
        }

        let channels = self.to.channels.max(1) as usize;
        let in_frames = (mixed.len() / channels) as u64;
        if in_frames == 0 {
            return Vec::new();
        }

        // Absolute index of window[0]; the carried frame sits just before this call's input
        let carried = (self.carry.len() / channels) as u64;
        let base = self.frames_in - carried;
        let last = self.frames_in + in_frames - 1;
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(&mixed[..in_frames as usize * channels]);

        let mut out = Vec::new();
        let mut k = self.frames_out;
        while k * from_rate <= last * to_rate {
            let position = k * from_rate;
            let left = position / to_rate;
            let right = (left + 1).min(last);
            let frac = (position % to_rate) as f64 / to_rate as f64;
            let (a, b) = ((left - base) as usize * channels, (right - base) as usize * channels);
            for ch in 0..channels {
                let value = window[a + ch] as f64 + (window[b + ch] as f64 - window[a + ch] as f64) * frac;
                out.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
            }
            k += 1;
        }

        let tail = window.len() - channels;
        self.carry = window.split_off(tail);
        self.frames_in = last + 1;
        self.frames_out = k;
        out
    }
}

/// Convert interleaved samples between formats (channel mix, then resample).
pub fn convert(samples: &[i16], from: AudioFormat, to: AudioFormat) -> Vec<i16> {
    if from == to {
        return samples.to_vec();
    }
    let mixed = mix_channels(samples, from.channels, to.channels);
    resample_linear(&mixed, to.channels, from.sample_rate, to.sample_rate)
}

/// Decode a RIFF/WAV payload into interleaved 16-bit samples.
pub fn decode_wav(bytes: &[u8]) -> EngineResult<(Vec<i16>, AudioFormat)> {
    let mut reader = Cursor::new(bytes);
    let (header, data) = wav::read(&mut reader)
        .map_err(|e| EngineError::InvalidAudio(format!("unreadable WAV payload: {}", e)))?;

    let format = AudioFormat::new(header.sampling_rate, header.channel_count);
    format.validate()?;

    let samples = match data {
        wav::BitDepth::Sixteen(samples) => samples,
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| ((s as i16) - 128) << 8)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples.into_iter().map(|s| (s >> 8) as i16).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => float_to_pcm(&samples),
        wav::BitDepth::Empty => Vec::new(),
    };

    Ok((samples, format))
}

/// Encode interleaved 16-bit samples as a PCM WAV file.
pub fn encode_wav(samples: &[i16], format: AudioFormat) -> EngineResult<Vec<u8>> {
    let header = wav::Header::new(
        wav::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        16,
    );
    let mut out = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out)
        .map_err(|e| EngineError::InvalidAudio(format!("failed to encode WAV: {}", e)))?;
    Ok(out.into_inner())
}
