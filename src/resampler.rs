//! Sample rate conversion from the capture device's native rate to 16kHz
//!
//! Linear interpolation over sample positions, one frame at a time.

use crate::audio_buffer::AudioSample;
use crate::config::ConfigError;
use tracing::debug;

/// Converts frames between a fixed pair of sample rates
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    native_rate: u32,
    target_rate: u32,
}

impl Resampler {
    /// Create a resampler for the given rate pair
    ///
    /// A zero rate means the device or config is broken; this is reported
    /// as a configuration error rather than corrected.
    pub fn new(native_rate: u32, target_rate: u32) -> Result<Self, ConfigError> {
        if native_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(native_rate));
        }
        if target_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(target_rate));
        }

        debug!("Creating resampler: {} Hz -> {} Hz", native_rate, target_rate);

        Ok(Self {
            native_rate,
            target_rate,
        })
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// True when no conversion is needed
    pub fn is_passthrough(&self) -> bool {
        self.native_rate == self.target_rate
    }

    /// Output length for an input of `input_len` samples:
    /// round(input_len * target / native)
    pub fn output_len(&self, input_len: usize) -> usize {
        let scaled = input_len as u128 * self.target_rate as u128;
        let native = self.native_rate as u128;
        ((scaled * 2 + native) / (native * 2)) as usize
    }

    /// Resample one frame
    pub fn resample(&self, frame: &[AudioSample]) -> Vec<AudioSample> {
        if self.is_passthrough() {
            return frame.to_vec();
        }

        let out_len = self.output_len(frame.len());
        if frame.is_empty() || out_len == 0 {
            return Vec::new();
        }

        let last = frame.len() - 1;
        let step = frame.len() as f64 / out_len as f64;

        (0..out_len)
            .map(|i| {
                let pos = i as f64 * step;
                let idx = (pos.floor() as usize).min(last);
                let next = (idx + 1).min(last);
                let frac = pos - idx as f64;

                let a = frame[idx] as f64;
                let b = frame[next] as f64;
                let value = a + (b - a) * frac;

                value
                    .round()
                    .clamp(i16::MIN as f64, i16::MAX as f64) as AudioSample
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<AudioSample> {
        (0..len).map(|i| ((i * 37) % 2000) as i16 - 1000).collect()
    }

    #[test]
    fn test_identity_when_rates_match() {
        let resampler = Resampler::new(16000, 16000).unwrap();
        assert!(resampler.is_passthrough());

        for len in [0, 1, 2, 7, 480, 512, 1023] {
            let input = ramp(len);
            assert_eq!(resampler.resample(&input), input);
        }
    }

    #[test]
    fn test_length_law() {
        let pairs = [(44100, 16000), (48000, 16000), (8000, 16000), (22050, 16000), (16000, 44100)];

        for (native, target) in pairs {
            let resampler = Resampler::new(native, target).unwrap();
            for len in [1, 3, 441, 1024, 1323, 4800] {
                let expected = (len as f64 * target as f64 / native as f64).round() as i64;
                let actual = resampler.resample(&ramp(len)).len() as i64;
                assert!(
                    (actual - expected).abs() <= 1,
                    "{} -> {} with {} samples: got {}, expected {}",
                    native, target, len, actual, expected
                );
            }
        }
    }

    #[test]
    fn test_downsample_by_integer_factor_picks_samples() {
        let resampler = Resampler::new(48000, 16000).unwrap();
        let input: Vec<i16> = (0..12).map(|i| i * 100).collect();

        let output = resampler.resample(&input);
        assert_eq!(output, vec![0, 300, 600, 900]);
    }

    #[test]
    fn test_upsample_interpolates() {
        let resampler = Resampler::new(8000, 16000).unwrap();
        let output = resampler.resample(&[0, 100, 200]);

        assert_eq!(output.len(), 6);
        assert_eq!(&output[..5], &[0, 50, 100, 150, 200]);
        // Last position clamps to the final input sample
        assert_eq!(output[5], 200);
    }

    #[test]
    fn test_preserves_constant_amplitude() {
        let resampler = Resampler::new(44100, 16000).unwrap();
        let output = resampler.resample(&vec![-1234; 1323]);
        assert!(output.iter().all(|&s| s == -1234));
    }

    #[test]
    fn test_deterministic() {
        let resampler = Resampler::new(44100, 16000).unwrap();
        let input = ramp(1323);
        assert_eq!(resampler.resample(&input), resampler.resample(&input));
    }

    #[test]
    fn test_extremes_do_not_overflow() {
        let resampler = Resampler::new(22050, 16000).unwrap();
        let input: Vec<i16> = (0..100)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN })
            .collect();
        let output = resampler.resample(&input);
        assert_eq!(output.len(), resampler.output_len(100));
    }

    #[test]
    fn test_zero_rate_is_config_error() {
        assert!(matches!(Resampler::new(0, 16000), Err(ConfigError::InvalidSampleRate(0))));
        assert!(Resampler::new(16000, 0).is_err());
    }
}
