//! Energy-based noise/voice detection.
//!
//! A chunk is "loud" when the root-mean-square of its samples exceeds a threshold.
//! Samples are little-endian; 8-bit audio is unsigned with a 128 bias as in WAV files.

use byteorder::{ByteOrder, LittleEndian};

/// Width of one PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    U8,
    I16,
    I32,
}

impl SampleWidth {
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::U8 => 1,
            SampleWidth::I16 => 2,
            SampleWidth::I32 => 4,
        }
    }

    pub fn from_bytes(width: usize) -> Option<Self> {
        match width {
            1 => Some(SampleWidth::U8),
            2 => Some(SampleWidth::I16),
            4 => Some(SampleWidth::I32),
            _ => None,
        }
    }
}

/// Root-mean-square of the samples in `pcm`.
///
/// A trailing partial sample is ignored. Empty input yields 0.
pub fn rms(pcm: &[u8], width: SampleWidth) -> f64 {
    let size = width.bytes();
    let count = pcm.len() / size;
    if count == 0 {
        return 0.0;
    }

    let sum_squares: f64 = pcm
        .chunks_exact(size)
        .map(|sample| {
            let value = match width {
                SampleWidth::U8 => sample[0] as f64 - 128.0,
                SampleWidth::I16 => LittleEndian::read_i16(sample) as f64,
                SampleWidth::I32 => LittleEndian::read_i32(sample) as f64,
            };
            value * value
        })
        .sum();

    (sum_squares / count as f64).sqrt()
}

/// True when `pcm` carries energy above `threshold`.
pub fn detect_noise(pcm: &[u8], width: SampleWidth, threshold: f64) -> bool {
    if pcm.is_empty() {
        return false;
    }
    rms(pcm, width) > threshold
}

/// Detector bound to one sample width and threshold.
#[derive(Debug, Clone, Copy)]
pub struct NoiseDetector {
    pub width: SampleWidth,
    pub threshold: f64,
}

impl NoiseDetector {
    pub fn new(width: SampleWidth, threshold: f64) -> Self {
        Self { width, threshold }
    }

    pub fn is_loud(&self, pcm: &[u8]) -> bool {
        detect_noise(pcm, self.width, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_wave(amplitude: i16, samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let s = if (i / 8) % 2 == 0 { amplitude } else { -amplitude };
                s.to_le_bytes()
            })
            .collect()
    }

    #[test]
    fn test_silence_is_never_loud() {
        for len in [0usize, 1, 2, 3, 320, 8192] {
            let zeros = vec![0u8; len];
            assert_eq!(rms(&zeros, SampleWidth::I16), 0.0);
            assert!(!detect_noise(&zeros, SampleWidth::I16, 0.0));
        }
    }

    #[test]
    fn test_full_scale_square_wave_is_loud() {
        let pcm = square_wave(i16::MAX, 1600);
        assert!((rms(&pcm, SampleWidth::I16) - i16::MAX as f64).abs() < 1e-6);
        assert!(detect_noise(&pcm, SampleWidth::I16, 200.0));
    }

    #[test]
    fn test_threshold_is_strict() {
        let pcm = square_wave(400, 64);
        assert!(!detect_noise(&pcm, SampleWidth::I16, 400.0));
        assert!(detect_noise(&pcm, SampleWidth::I16, 399.9));
    }

    #[test]
    fn test_other_widths() {
        // 8-bit silence sits at the 128 midpoint
        assert_eq!(rms(&[128u8; 10], SampleWidth::U8), 0.0);
        assert_eq!(rms(&[228u8, 28u8], SampleWidth::U8), 100.0);

        let wide: Vec<u8> = [1000i32, -1000].iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(rms(&wide, SampleWidth::I32), 1000.0);

        // trailing byte of an incomplete sample is ignored
        let mut odd = square_wave(300, 4);
        odd.push(0x7f);
        assert_eq!(rms(&odd, SampleWidth::I16), 300.0);
    }

    #[test]
    fn test_width_from_bytes() {
        assert_eq!(SampleWidth::from_bytes(2), Some(SampleWidth::I16));
        assert_eq!(SampleWidth::from_bytes(3), None);
    }
}
