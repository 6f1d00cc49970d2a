//! Command listener library
//!
//! Turns a live microphone stream into isolated spoken commands: resampling
//! to 16kHz, fixed-size analysis windows, trigger-phrase and voice activity
//! scoring, and an utterance segmentation state machine whose finalized
//! utterances are handed to a sink.

pub mod audio_buffer;
pub mod capture;
pub mod config;
pub mod detector;
pub mod listener;
pub mod resampler;
pub mod segmenter;
pub mod sink;
pub mod vad;

// Re-export main types
pub use audio_buffer::{AnalysisWindow, AudioSample, PushReport, WindowBuffer};
pub use capture::{AudioSource, CaptureError, CpalSource, Frame, WavFileSource};
pub use config::{ConfigError, ListenerConfig, DEFAULT_WINDOW_SIZE, TARGET_SAMPLE_RATE};
pub use detector::{
    DetectorError, DetectorKind, Scorer, SpeechModel, VadScorer, WakeWordModel, WakeWordScorer,
};
pub use listener::{Listener, ListenerError, ListenerEvent, RunSummary};
pub use resampler::Resampler;
pub use segmenter::{
    Decision, EndReason, SegmentError, SegmentState, Segmenter, SegmenterConfig, Utterance,
};
pub use sink::{read_wav, write_wav, LogSink, PersistError, SinkError, UtteranceSink, WavFileSink};
pub use vad::{EnergyVad, VadConfig, VadError};
