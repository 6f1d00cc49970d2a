//! Utterance sinks and WAV persistence
//!
//! A sink receives each finalized utterance by value, at most once per
//! recording and never concurrently. Persisted utterances are mono 16-bit
//! little-endian PCM WAV files at the target rate.

use crate::audio_buffer::AudioSample;
use crate::segmenter::Utterance;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported WAV format: {0}")]
    Format(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to persist utterance: {0}")]
    Persist(#[from] PersistError),

    #[error("Downstream consumer rejected utterance: {0}")]
    Rejected(String),
}

/// Consumer of finalized utterances
#[async_trait]
pub trait UtteranceSink: Send {
    async fn on_utterance(&mut self, utterance: Utterance) -> Result<(), SinkError>;
}

/// Write samples as a mono 16-bit PCM WAV file
pub fn write_wav(path: &Path, samples: &[AudioSample], sample_rate: u32) -> Result<(), PersistError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    debug!("Wrote {} samples to {}", samples.len(), path.display());
    Ok(())
}

/// Read a mono 16-bit PCM WAV file, returning samples and sample rate
pub fn read_wav(path: &Path) -> Result<(Vec<AudioSample>, u32), PersistError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(PersistError::Format(format!(
            "{} channel(s), {} bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    Ok((samples, spec.sample_rate))
}

/// Persists the most recent utterance to `<dir>/utterance_<unix_millis>.wav`
///
/// Writing a new utterance removes the previous file.
pub struct WavFileSink {
    dir: PathBuf,
    last_written: Option<PathBuf>,
}

impl WavFileSink {
    /// Create a sink writing into `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Persisting utterances to {}", dir.display());

        Ok(Self {
            dir,
            last_written: None,
        })
    }

    /// Path of the most recently written utterance
    pub fn last_written(&self) -> Option<&Path> {
        self.last_written.as_deref()
    }

    fn next_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut path = self.dir.join(format!("utterance_{}.wav", millis));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("utterance_{}_{}.wav", millis, suffix));
            suffix += 1;
        }
        path
    }
}

#[async_trait]
impl UtteranceSink for WavFileSink {
    async fn on_utterance(&mut self, utterance: Utterance) -> Result<(), SinkError> {
        let path = self.next_path();
        write_wav(&path, &utterance.samples, utterance.sample_rate)?;

        info!(
            "Utterance saved: {} ({:.2}s)",
            path.display(),
            utterance.duration().as_secs_f32()
        );

        if let Some(previous) = self.last_written.take() {
            if let Err(e) = std::fs::remove_file(&previous) {
                warn!("Failed to remove {}: {}", previous.display(), e);
            }
        }

        self.last_written = Some(path);
        Ok(())
    }
}

/// Logs utterances without keeping them
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl UtteranceSink for LogSink {
    async fn on_utterance(&mut self, utterance: Utterance) -> Result<(), SinkError> {
        info!(
            "Utterance ready: {} samples at {} Hz ({:.2}s, trigger score {:.2})",
            utterance.samples.len(),
            utterance.sample_rate,
            utterance.duration().as_secs_f32(),
            utterance.trigger_score
        );
        Ok(())
    }
}
