//! Energy-based voice activity model
//!
//! Estimates speech probability from RMS energy and zero-crossing rate.
//! This is the built-in `SpeechModel` used when no trained VAD is plugged
//! in; it knows nothing about utterance timing.

use crate::audio_buffer::AudioSample;
use crate::detector::{DetectorError, SpeechModel};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// VAD configuration parameters
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Normalized RMS energy at which speech probability reaches 0.5
    pub energy_threshold: f32,

    /// Below this zero-crossing rate the signal is treated as hum/DC
    pub min_zcr: f32,

    /// Above this zero-crossing rate the signal is treated as hiss
    pub max_zcr: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02, // 2% of full scale
            min_zcr: 0.01,
            max_zcr: 0.5,
        }
    }
}

impl VadConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VadError> {
        if self.energy_threshold <= 0.0 || self.energy_threshold > 1.0 {
            return Err(VadError::InvalidConfig(
                "energy_threshold must be within (0.0, 1.0]".to_string(),
            ));
        }

        if self.min_zcr < 0.0 || self.max_zcr > 1.0 || self.min_zcr >= self.max_zcr {
            return Err(VadError::InvalidConfig(
                "zero-crossing bounds must satisfy 0 <= min_zcr < max_zcr <= 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Energy / zero-crossing speech model
#[derive(Debug, Clone)]
pub struct EnergyVad {
    config: VadConfig,
}

impl EnergyVad {
    /// Create a new VAD with default configuration
    pub fn new() -> Self {
        Self {
            config: VadConfig::default(),
        }
    }

    /// Create a new VAD with custom configuration
    pub fn with_config(config: VadConfig) -> Result<Self, VadError> {
        config.validate()?;
        debug!("Initializing energy VAD with config: {:?}", config);
        Ok(Self { config })
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Speech probability of a block of samples
    pub fn probability(&self, samples: &[AudioSample]) -> f32 {
        let energy = calculate_energy(samples);
        let zcr = calculate_zero_crossing_rate(samples);

        // 0.5 exactly at the threshold, approaching 1.0 as energy grows
        let mut probability = energy / (energy + self.config.energy_threshold);

        if zcr < self.config.min_zcr || zcr > self.config.max_zcr {
            probability *= 0.5;
        }

        trace!("energy={:.4}, zcr={:.4}, p={:.3}", energy, zcr, probability);
        probability
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for EnergyVad {
    fn speech_probability(
        &mut self,
        samples: &[AudioSample],
        _sample_rate: u32,
    ) -> Result<f32, DetectorError> {
        if samples.is_empty() {
            return Err(DetectorError::InvalidInput("empty window".to_string()));
        }
        Ok(self.probability(samples))
    }
}

/// Normalized RMS energy (0.0 - 1.0)
pub fn calculate_energy(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Fraction of adjacent sample pairs that cross zero
pub fn calculate_zero_crossing_rate(samples: &[AudioSample]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0 && pair[1] < 0) || (pair[0] < 0 && pair[1] >= 0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}
