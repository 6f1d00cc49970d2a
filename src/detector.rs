//! Detector adapters
//!
//! Wraps the two opaque classifiers (trigger-phrase model and voice activity
//! model) behind one `Scorer` contract: a window in, a confidence in [0, 1]
//! out. No arming, cooldown or timing state lives here; that belongs to the
//! segmenter.

use crate::audio_buffer::{AnalysisWindow, AudioSample};
use std::fmt;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Model returned an invalid score: {0}")]
    InvalidScore(f32),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Which detector produced a score or an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    WakeWord,
    Vad,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::WakeWord => write!(f, "wake-word"),
            DetectorKind::Vad => write!(f, "vad"),
        }
    }
}

/// Uniform scoring contract consumed by the segmenter
pub trait Scorer: Send {
    /// Score one analysis window, returning a confidence in [0, 1]
    fn score(&mut self, window: &AnalysisWindow) -> Result<f32, DetectorError>;

    fn kind(&self) -> DetectorKind;
}

/// Opaque trigger-phrase classifier
///
/// Returns a score per label; a single phrase may be reported under
/// several sub-labels (model versions, variants).
#[cfg_attr(test, mockall::automock)]
pub trait WakeWordModel {
    fn predict(
        &mut self,
        samples: &[AudioSample],
        sample_rate: u32,
    ) -> Result<Vec<(String, f32)>, DetectorError>;
}

/// Opaque voice activity classifier
#[cfg_attr(test, mockall::automock)]
pub trait SpeechModel {
    fn speech_probability(
        &mut self,
        samples: &[AudioSample],
        sample_rate: u32,
    ) -> Result<f32, DetectorError>;
}

/// Scores a window for one trigger phrase
pub struct WakeWordScorer<M> {
    model: M,
    phrase: String,
    sample_rate: u32,
}

impl<M: WakeWordModel> WakeWordScorer<M> {
    pub fn new(model: M, phrase: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            model,
            phrase: phrase.into().trim().to_lowercase(),
            sample_rate,
        }
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Whether a classifier label refers to the configured phrase
    ///
    /// `hey_mycroft` matches `hey_mycroft`, `Hey_Mycroft` and
    /// `hey_mycroft_v0.1`, but not `hey_mycroftx`.
    pub fn label_matches(&self, label: &str) -> bool {
        let label = label.trim().to_lowercase();
        match label.strip_prefix(self.phrase.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .chars()
                .next()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(false),
            None => false,
        }
    }
}

impl<M: WakeWordModel + Send> Scorer for WakeWordScorer<M> {
    fn score(&mut self, window: &AnalysisWindow) -> Result<f32, DetectorError> {
        let labels = self.model.predict(&window.samples, self.sample_rate)?;

        let mut best: Option<f32> = None;
        for (_, score) in labels.iter().filter(|(label, _)| self.label_matches(label)) {
            let score = validate_score(*score)?;
            best = Some(best.map_or(score, |b| b.max(score)));
        }

        let score = best.unwrap_or(0.0);
        trace!(seq = window.seq, score, "wake-word score");
        Ok(score)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::WakeWord
    }
}

/// Scores a window for speech presence
pub struct VadScorer<M> {
    model: M,
    sample_rate: u32,
}

impl<M: SpeechModel> VadScorer<M> {
    pub fn new(model: M, sample_rate: u32) -> Self {
        Self { model, sample_rate }
    }
}

impl<M: SpeechModel + Send> Scorer for VadScorer<M> {
    fn score(&mut self, window: &AnalysisWindow) -> Result<f32, DetectorError> {
        let raw = self
            .model
            .speech_probability(&window.samples, self.sample_rate)?;
        let score = validate_score(raw)?;
        trace!(seq = window.seq, score, "speech probability");
        Ok(score)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Vad
    }
}

fn validate_score(score: f32) -> Result<f32, DetectorError> {
    if score.is_nan() {
        return Err(DetectorError::InvalidScore(score));
    }
    Ok(score.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Instant;

    fn window() -> AnalysisWindow {
        AnalysisWindow {
            seq: 0,
            samples: vec![0; 512],
            at: Instant::now(),
        }
    }

    fn labels(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(l, s)| (l.to_string(), *s)).collect()
    }

    #[test]
    fn test_wake_takes_max_of_matching_labels() {
        let mut model = MockWakeWordModel::new();
        model.expect_predict().returning(|_, _| {
            Ok(labels(&[
                ("hey_mycroft", 0.3),
                ("hey_mycroft_v0.1", 0.8),
                ("hey_jarvis", 0.95),
            ]))
        });

        let mut scorer = WakeWordScorer::new(model, "hey_mycroft", 16000);
        assert_relative_eq!(scorer.score(&window()).unwrap(), 0.8);
        assert_eq!(scorer.kind(), DetectorKind::WakeWord);
    }

    #[test]
    fn test_wake_without_matching_label_scores_zero() {
        let mut model = MockWakeWordModel::new();
        model
            .expect_predict()
            .returning(|_, _| Ok(labels(&[("alexa", 0.9)])));

        let mut scorer = WakeWordScorer::new(model, "hey_mycroft", 16000);
        assert_relative_eq!(scorer.score(&window()).unwrap(), 0.0);
    }

    #[test]
    fn test_wake_passes_target_rate_and_samples() {
        let mut model = MockWakeWordModel::new();
        model
            .expect_predict()
            .withf(|samples, rate| samples.len() == 512 && *rate == 16000)
            .times(1)
            .returning(|_, _| Ok(labels(&[("hey_mycroft", 0.5)])));

        let mut scorer = WakeWordScorer::new(model, "hey_mycroft", 16000);
        scorer.score(&window()).unwrap();
    }

    #[test]
    fn test_label_matching_rules() {
        let scorer = WakeWordScorer::new(MockWakeWordModel::new(), " Hey_Mycroft ", 16000);
        assert_eq!(scorer.phrase(), "hey_mycroft");
        assert!(scorer.label_matches("hey_mycroft"));
        assert!(scorer.label_matches("HEY_MYCROFT"));
        assert!(scorer.label_matches("hey_mycroft_v0.1"));
        assert!(scorer.label_matches("hey_mycroft:tiny"));
        assert!(!scorer.label_matches("hey_mycroftx"));
        assert!(!scorer.label_matches("hey"));
    }

    #[test]
    fn test_nan_score_is_an_error() {
        let mut model = MockWakeWordModel::new();
        model
            .expect_predict()
            .returning(|_, _| Ok(labels(&[("hey_mycroft", f32::NAN)])));

        let mut scorer = WakeWordScorer::new(model, "hey_mycroft", 16000);
        assert!(matches!(scorer.score(&window()), Err(DetectorError::InvalidScore(_))));
    }

    #[test]
    fn test_model_error_propagates() {
        let mut model = MockSpeechModel::new();
        model
            .expect_speech_probability()
            .returning(|_, _| Err(DetectorError::Inference("session closed".to_string())));

        let mut scorer = VadScorer::new(model, 16000);
        assert_eq!(
            scorer.score(&window()),
            Err(DetectorError::Inference("session closed".to_string()))
        );
        assert_eq!(scorer.kind(), DetectorKind::Vad);
    }

    #[test]
    fn test_vad_score_is_clamped() {
        let mut model = MockSpeechModel::new();
        let mut outputs = vec![1.7f32, -0.2, 0.42].into_iter();
        model
            .expect_speech_probability()
            .times(3)
            .returning(move |_, _| Ok(outputs.next().unwrap_or(0.0)));

        let mut scorer = VadScorer::new(model, 16000);
        assert_relative_eq!(scorer.score(&window()).unwrap(), 1.0);
        assert_relative_eq!(scorer.score(&window()).unwrap(), 0.0);
        assert_relative_eq!(scorer.score(&window()).unwrap(), 0.42);
    }
}
