//! Listener configuration
//!
//! All tunables of the capture pipeline: rates, window geometry, wake-word
//! hysteresis, speech/silence timing and queue capacities. Loaded from JSON
//! and/or `LISTENER_*` environment variables and validated before anything
//! touches the audio device.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Sample rate required by both detectors (16kHz)
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Canonical analysis window: 512 samples (32ms at 16kHz)
pub const DEFAULT_WINDOW_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid sample rate: {0} Hz (must be > 0)")]
    InvalidSampleRate(u32),

    #[error("Invalid threshold {name}={value}: must be within (0.0, 1.0]")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("Invalid duration {name}={value}s")]
    InvalidDuration { name: &'static str, value: f32 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },
}

/// Configuration for the listening pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Rate both detectors expect (must be 16kHz for the stock models)
    pub target_sample_rate: u32,

    /// Analysis window length in samples at the target rate
    pub window_size: usize,

    /// Capture frame duration requested from the device
    pub frame_duration_ms: u32,

    /// Windows' worth of undrained samples allowed before the anti-lag purge
    pub max_backlog_windows: usize,

    /// Trigger phrase identifier reported by the wake-word classifier
    pub trigger_phrase: String,

    /// Wake score that starts a recording (score >= threshold)
    pub wake_threshold: f32,

    /// Wake score below which the trigger re-arms
    pub wake_reset_threshold: f32,

    /// Quiet period after a finished recording during which triggers are ignored
    pub wake_cooldown_secs: f32,

    /// Speech probability at or above which a window counts as speech
    pub speech_threshold: f32,

    /// Aggregate speech needed before silence can end the utterance
    pub min_speech_secs: f32,

    /// Continuous silence that ends a confirmed utterance
    pub silence_secs: f32,

    /// Give up on a trigger if speech is not confirmed within this time
    pub command_timeout_secs: f32,

    /// Hard cap on a single recording
    pub max_command_secs: f32,

    /// Consecutive detector failures tolerated before the session is declared dead
    pub max_detector_failures: u32,

    /// Run wake-word scoring on a separate worker
    pub offload_wake_word: bool,

    /// Bounded queue between the main loop and the wake-word worker
    pub wake_queue_capacity: usize,

    /// Unread capture frames kept before the oldest are shed
    pub capture_queue_capacity: usize,

    /// Bounded queue of finalized utterances awaiting the sink
    pub sink_queue_capacity: usize,

    /// Directory for persisted utterances (persistence disabled when unset)
    pub save_dir: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: TARGET_SAMPLE_RATE,
            window_size: DEFAULT_WINDOW_SIZE,
            frame_duration_ms: 30,
            max_backlog_windows: 10,
            trigger_phrase: "hey_mycroft".to_string(),
            wake_threshold: 0.6,
            wake_reset_threshold: 0.2,
            wake_cooldown_secs: 3.0,
            speech_threshold: 0.5,
            min_speech_secs: 0.3,
            silence_secs: 0.8,
            command_timeout_secs: 5.0,
            max_command_secs: 30.0,
            max_detector_failures: 3,
            offload_wake_word: false,
            wake_queue_capacity: 50,
            capture_queue_capacity: 10,
            sink_queue_capacity: 4,
            save_dir: None,
        }
    }
}

impl ListenerConfig {
    /// Load configuration from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&raw)?;
        debug!("Loaded listener config from {}", path.display());
        Ok(config)
    }

    /// Override fields from `LISTENER_*` environment variables
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_var("LISTENER_TRIGGER_PHRASE") {
            self.trigger_phrase = v;
        }
        if let Some(v) = env_parse("LISTENER_WAKE_THRESHOLD")? {
            self.wake_threshold = v;
        }
        if let Some(v) = env_parse("LISTENER_WAKE_RESET_THRESHOLD")? {
            self.wake_reset_threshold = v;
        }
        if let Some(v) = env_parse("LISTENER_WAKE_COOLDOWN_SECS")? {
            self.wake_cooldown_secs = v;
        }
        if let Some(v) = env_parse("LISTENER_SPEECH_THRESHOLD")? {
            self.speech_threshold = v;
        }
        if let Some(v) = env_parse("LISTENER_MIN_SPEECH_SECS")? {
            self.min_speech_secs = v;
        }
        if let Some(v) = env_parse("LISTENER_SILENCE_SECS")? {
            self.silence_secs = v;
        }
        if let Some(v) = env_parse("LISTENER_COMMAND_TIMEOUT_SECS")? {
            self.command_timeout_secs = v;
        }
        if let Some(v) = env_parse("LISTENER_OFFLOAD_WAKE_WORD")? {
            self.offload_wake_word = v;
        }
        if let Some(v) = env_var("LISTENER_SAVE_DIR") {
            self.save_dir = Some(PathBuf::from(v));
        }

        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.target_sample_rate));
        }

        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be greater than 0".to_string()));
        }

        if self.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "frame_duration_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_backlog_windows < 2 {
            return Err(ConfigError::Invalid(
                "max_backlog_windows must be at least 2".to_string(),
            ));
        }

        if self.trigger_phrase.trim().is_empty() {
            return Err(ConfigError::Invalid("trigger_phrase is required".to_string()));
        }

        check_threshold("wake_threshold", self.wake_threshold)?;
        check_threshold("wake_reset_threshold", self.wake_reset_threshold)?;
        check_threshold("speech_threshold", self.speech_threshold)?;

        if self.wake_reset_threshold > self.wake_threshold {
            return Err(ConfigError::Invalid(format!(
                "wake_reset_threshold ({}) must not exceed wake_threshold ({})",
                self.wake_reset_threshold, self.wake_threshold
            )));
        }

        check_positive("min_speech_secs", self.min_speech_secs)?;
        check_positive("silence_secs", self.silence_secs)?;
        check_positive("command_timeout_secs", self.command_timeout_secs)?;

        if !self.wake_cooldown_secs.is_finite() || self.wake_cooldown_secs < 0.0 {
            return Err(ConfigError::InvalidDuration {
                name: "wake_cooldown_secs",
                value: self.wake_cooldown_secs,
            });
        }

        if !self.max_command_secs.is_finite() || self.max_command_secs < self.command_timeout_secs {
            return Err(ConfigError::InvalidDuration {
                name: "max_command_secs",
                value: self.max_command_secs,
            });
        }

        if self.max_detector_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_detector_failures must be greater than 0".to_string(),
            ));
        }

        if self.wake_queue_capacity == 0
            || self.capture_queue_capacity == 0
            || self.sink_queue_capacity == 0
        {
            return Err(ConfigError::Invalid("queue capacities must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Duration of one analysis window at the target rate
    pub fn window_duration(&self) -> Duration {
        let nanos = self.window_size as u64 * 1_000_000_000 / self.target_sample_rate.max(1) as u64;
        Duration::from_nanos(nanos)
    }

    pub fn wake_cooldown(&self) -> Duration {
        Duration::from_secs_f32(self.wake_cooldown_secs)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_secs_f32(self.min_speech_secs)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_secs_f32(self.silence_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.command_timeout_secs)
    }

    pub fn max_command(&self) -> Duration {
        Duration::from_secs_f32(self.max_command_secs)
    }
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    // NaN fails both comparisons
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

fn check_positive(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidDuration { name, value })
    }
}

fn env_var(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env_var(var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
