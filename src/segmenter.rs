//! Utterance segmentation state machine
//!
//! Consumes per-window detector scores and decides when a command starts
//! (trigger phrase with hysteresis and cooldown), when it ends (confirmed
//! speech followed by a continuous silence span) and when to give up
//! (no speech window within the command timeout, or speech never confirmed
//! before the maximum command length).
//!
//! All timing uses the monotonic arrival timestamps carried by the windows,
//! so the machine is deterministic for a given sequence of windows and
//! scores.

use crate::audio_buffer::{AnalysisWindow, AudioSample};
use crate::config::ListenerConfig;
use crate::detector::{DetectorError, DetectorKind, Scorer};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("{kind} detector failed {failures} times in a row: {source}")]
    DetectorFailed {
        kind: DetectorKind,
        failures: u32,
        #[source]
        source: DetectorError,
    },
}

/// Observable phase of a listening session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Not recording; waiting for the wake score to fall below the reset threshold
    Idle,

    /// Not recording; the next wake score at or above threshold starts a recording
    Armed,

    /// Capturing a command
    Recording,

    /// A recording just ended; triggers are suppressed until the cooldown passes
    Cooldown,
}

/// Why a recording was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Confirmed speech followed by enough continuous silence
    Silence,

    /// Recording reached the maximum command length
    MaxLength,
}

/// One finalized command, ready for the sink
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Target-rate samples of every window recorded, in arrival order
    pub samples: Vec<AudioSample>,
    pub sample_rate: u32,
    pub started_at: Instant,
    pub ended_at: Instant,
    pub windows: usize,
    pub speech: Duration,
    pub trigger_score: f32,
    pub end_reason: EndReason,
}

impl Utterance {
    /// Audio duration of the recorded samples
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// What a window did to the session
#[derive(Debug, Clone)]
pub enum Decision {
    Continue,
    Triggered { score: f32 },
    SpeechConfirmed,
    FalseTrigger { waited: Duration },
    Finalized(Utterance),
}

/// Timing and threshold parameters of the state machine
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub window_duration: Duration,
    pub wake_threshold: f32,
    pub wake_reset_threshold: f32,
    pub wake_cooldown: Duration,
    pub speech_threshold: f32,
    pub min_speech: Duration,
    pub silence: Duration,
    pub command_timeout: Duration,
    pub max_command: Duration,
    pub max_detector_failures: u32,
}

impl From<&ListenerConfig> for SegmenterConfig {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            sample_rate: config.target_sample_rate,
            window_duration: config.window_duration(),
            wake_threshold: config.wake_threshold,
            wake_reset_threshold: config.wake_reset_threshold,
            wake_cooldown: config.wake_cooldown(),
            speech_threshold: config.speech_threshold,
            min_speech: config.min_speech(),
            silence: config.silence(),
            command_timeout: config.command_timeout(),
            max_command: config.max_command(),
            max_detector_failures: config.max_detector_failures,
        }
    }
}

/// In-progress recording, owned exclusively by the segmenter
struct Recording {
    started_at: Instant,
    trigger_score: f32,
    samples: Vec<AudioSample>,
    windows: usize,
    speech: Duration,
    confirmed: bool,
    last_speech_at: Option<Instant>,
}

impl Recording {
    fn new(started_at: Instant, trigger_score: f32) -> Self {
        Self {
            started_at,
            trigger_score,
            samples: Vec::new(),
            windows: 0,
            speech: Duration::ZERO,
            confirmed: false,
            last_speech_at: None,
        }
    }

    fn append(&mut self, window: AnalysisWindow) {
        if self.samples.is_empty() {
            self.samples = window.samples;
        } else {
            self.samples.extend_from_slice(&window.samples);
        }
        self.windows += 1;
    }
}

/// Segmentation state machine for one listening session
pub struct Segmenter {
    config: SegmenterConfig,
    armed: bool,
    recording: Option<Recording>,
    last_recording_end: Option<Instant>,
    last_window_at: Option<Instant>,
    consecutive_failures: u32,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        debug!("Initializing segmenter with config: {:?}", config);

        Self {
            config,
            armed: true,
            recording: None,
            last_recording_end: None,
            last_window_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Current phase, relative to the last window observed
    pub fn phase(&self) -> SegmentState {
        if self.recording.is_some() {
            return SegmentState::Recording;
        }

        if let (Some(end), Some(now)) = (self.last_recording_end, self.last_window_at) {
            if now.saturating_duration_since(end) <= self.config.wake_cooldown {
                return SegmentState::Cooldown;
            }
        }

        if self.armed {
            SegmentState::Armed
        } else {
            SegmentState::Idle
        }
    }

    /// Run one window through whichever detector the current phase needs
    pub fn step(
        &mut self,
        window: AnalysisWindow,
        wake: &mut dyn Scorer,
        vad: &mut dyn Scorer,
    ) -> Result<Decision, SegmentError> {
        if self.is_recording() {
            let score = vad.score(&window);
            self.observe_recording(window, score)
        } else {
            let score = wake.score(&window);
            self.observe_wake(score, window.at)
        }
    }

    /// Feed a wake-word score for a window that arrived at `at`
    ///
    /// Scores arriving while a recording is in progress are ignored.
    pub fn observe_wake(
        &mut self,
        score: Result<f32, DetectorError>,
        at: Instant,
    ) -> Result<Decision, SegmentError> {
        self.last_window_at = Some(at);

        if self.recording.is_some() {
            return Ok(Decision::Continue);
        }

        // A failed window is skipped: it neither arms nor triggers
        let Some(score) = self.absorb(DetectorKind::WakeWord, score)? else {
            return Ok(Decision::Continue);
        };

        if score < self.config.wake_reset_threshold && !self.armed {
            debug!(score, "wake-word re-armed");
            self.armed = true;
        }

        if !self.armed || score < self.config.wake_threshold {
            return Ok(Decision::Continue);
        }

        if !self.cooldown_elapsed(at) {
            debug!(score, "wake-word ignored during cooldown");
            return Ok(Decision::Continue);
        }

        info!("Wake-word detected ({:.2}), recording started", score);
        self.armed = false;
        self.recording = Some(Recording::new(at, score));

        Ok(Decision::Triggered { score })
    }

    /// Feed a recorded window together with its speech probability
    pub fn observe_recording(
        &mut self,
        window: AnalysisWindow,
        score: Result<f32, DetectorError>,
    ) -> Result<Decision, SegmentError> {
        let at = window.at;
        self.last_window_at = Some(at);

        if self.recording.is_none() {
            return Ok(Decision::Continue);
        }

        let score = self.absorb(DetectorKind::Vad, score)?.unwrap_or(0.0);

        let config = &self.config;
        let Some(recording) = self.recording.as_mut() else {
            return Ok(Decision::Continue);
        };

        recording.append(window);

        let mut confirmed_now = false;
        if score >= config.speech_threshold {
            recording.speech += config.window_duration;
            recording.last_speech_at = Some(at);

            if !recording.confirmed && recording.speech >= config.min_speech {
                recording.confirmed = true;
                confirmed_now = true;
                debug!(speech_ms = recording.speech.as_millis() as u64, "speech confirmed");
            }
        }

        let elapsed = at.saturating_duration_since(recording.started_at);

        // Fixed order: timeout, then length cap, then silence
        if recording.last_speech_at.is_none() && elapsed >= config.command_timeout {
            info!(
                "No speech within {:.1}s, abandoning recording",
                elapsed.as_secs_f32()
            );
            self.recording = None;
            return Ok(Decision::FalseTrigger { waited: elapsed });
        }

        if elapsed >= config.max_command {
            if recording.confirmed {
                return Ok(Decision::Finalized(self.finalize(at, EndReason::MaxLength)));
            }

            info!(
                "Speech never confirmed within {:.1}s, abandoning recording",
                elapsed.as_secs_f32()
            );
            self.recording = None;
            return Ok(Decision::FalseTrigger { waited: elapsed });
        }

        if recording.confirmed {
            let silent_for = recording
                .last_speech_at
                .map(|last| at.saturating_duration_since(last))
                .unwrap_or(Duration::ZERO);

            if silent_for >= config.silence {
                return Ok(Decision::Finalized(self.finalize(at, EndReason::Silence)));
            }
        }

        if confirmed_now {
            Ok(Decision::SpeechConfirmed)
        } else {
            Ok(Decision::Continue)
        }
    }

    /// Drop any in-progress recording without producing an utterance
    pub fn reset(&mut self) {
        if let Some(recording) = self.recording.take() {
            debug!(windows = recording.windows, "discarding in-progress recording");
        }
        self.consecutive_failures = 0;
    }

    fn finalize(&mut self, at: Instant, end_reason: EndReason) -> Utterance {
        let recording = self
            .recording
            .take()
            .unwrap_or_else(|| Recording::new(at, 0.0));

        self.last_recording_end = Some(at);

        let utterance = Utterance {
            samples: recording.samples,
            sample_rate: self.config.sample_rate,
            started_at: recording.started_at,
            ended_at: at,
            windows: recording.windows,
            speech: recording.speech,
            trigger_score: recording.trigger_score,
            end_reason,
        };

        info!(
            "Utterance finalized: {} windows, {:.2}s ({:?})",
            utterance.windows,
            utterance.duration().as_secs_f32(),
            end_reason
        );

        utterance
    }

    fn cooldown_elapsed(&self, at: Instant) -> bool {
        match self.last_recording_end {
            Some(end) => at.saturating_duration_since(end) > self.config.wake_cooldown,
            None => true,
        }
    }

    /// Track consecutive detector failures; `None` means the window is skipped
    fn absorb(
        &mut self,
        kind: DetectorKind,
        score: Result<f32, DetectorError>,
    ) -> Result<Option<f32>, SegmentError> {
        match score {
            Ok(score) => {
                self.consecutive_failures = 0;
                Ok(Some(score))
            }
            Err(source) => {
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.config.max_detector_failures {
                    error!(
                        "{} detector failed {} consecutive times: {}",
                        kind, self.consecutive_failures, source
                    );
                    return Err(SegmentError::DetectorFailed {
                        kind,
                        failures: self.consecutive_failures,
                        source,
                    });
                }

                warn!(
                    "{} detector error ({} consecutive), skipping window: {}",
                    kind, self.consecutive_failures, source
                );
                Ok(None)
            }
        }
    }
}
