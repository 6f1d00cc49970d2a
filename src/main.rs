//! Command listener service binary
//!
//! Listens on the default microphone (or replays `LISTENER_INPUT_WAV`) for
//! the trigger phrase and logs or persists each spoken command.

use anyhow::{Context, Result};
use command_listener::vad::calculate_energy;
use command_listener::{
    AudioSample, AudioSource, CpalSource, DetectorError, EnergyVad, Listener, ListenerConfig,
    ListenerEvent, LogSink, UtteranceSink, VadScorer, WakeWordModel, WakeWordScorer,
    WavFileSource, WavFileSink,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("command_listener=debug".parse()?),
        )
        .init();

    info!("Starting command listener service");

    let config = load_config().context("Failed to load configuration")?;

    let source: Box<dyn AudioSource> = match std::env::var("LISTENER_INPUT_WAV") {
        Ok(path) => Box::new(
            WavFileSource::open(&path, config.frame_duration_ms)
                .with_context(|| format!("Failed to open {}", path))?,
        ),
        Err(_) => Box::new(
            CpalSource::open(config.frame_duration_ms, config.capture_queue_capacity)
                .context("Failed to open microphone")?,
        ),
    };

    let wake = WakeWordScorer::new(
        LoudnessTrigger::new(&config.trigger_phrase),
        config.trigger_phrase.as_str(),
        config.target_sample_rate,
    );
    let vad = VadScorer::new(EnergyVad::new(), config.target_sample_rate);

    let sink: Box<dyn UtteranceSink> = match &config.save_dir {
        Some(dir) => Box::new(WavFileSink::new(dir).context("Failed to prepare save directory")?),
        None => Box::new(LogSink),
    };

    let (event_tx, event_rx) = mpsc::channel(256);
    tokio::spawn(render_events(event_rx));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    info!(
        "Command listener running. Say '{}' followed by a command...",
        config.trigger_phrase
    );

    let summary = Listener::new(config, source, Box::new(wake), Box::new(vad), sink)
        .with_events(event_tx)
        .run(cancel)
        .await
        .context("Listener stopped with an error")?;

    info!(
        "Command listener stopped: {} frames, {} utterances, {} false triggers, {} dropped frames",
        summary.frames, summary.utterances, summary.false_triggers, summary.dropped_frames
    );

    Ok(())
}

/// Load configuration from `LISTENER_CONFIG` (JSON) and `LISTENER_*` overrides
fn load_config() -> Result<ListenerConfig> {
    let config = match std::env::var("LISTENER_CONFIG") {
        Ok(path) => ListenerConfig::from_json_file(&path)?,
        Err(_) => ListenerConfig::default(),
    };

    let config = config.apply_env()?;
    config.validate()?;

    debug!("Using configuration: {:?}", config);
    Ok(config)
}

async fn render_events(mut events: mpsc::Receiver<ListenerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ListenerEvent::Progress { seq, rms, phase } => {
                trace!("[{}] rms={:.4} phase={:?}", seq, rms, phase);
            }
            ListenerEvent::WakeDetected { score } => {
                info!("Trigger phrase detected (score {:.2}), listening for command", score);
            }
            ListenerEvent::SpeechConfirmed => debug!("Speech confirmed"),
            ListenerEvent::FalseTrigger { waited } => {
                info!("No command after {:.1}s, back to idle", waited.as_secs_f32());
            }
            ListenerEvent::UtteranceReady {
                windows,
                duration,
                end_reason,
            } => {
                info!(
                    "Command captured: {:.2}s in {} windows ({:?})",
                    duration.as_secs_f32(),
                    windows,
                    end_reason
                );
            }
            ListenerEvent::DetectorFailure { kind, message } => {
                warn!("{} detector error: {}", kind, message);
            }
            ListenerEvent::BacklogPurged { samples } => {
                debug!("Purged {} samples of backlog", samples);
            }
            ListenerEvent::WakeWindowDropped { seq } => {
                trace!("Wake-word window {} dropped", seq);
            }
            ListenerEvent::SinkFailed { message } => warn!("Sink failed: {}", message),
        }
    }
}

/// Stand-in trigger classifier: reports loud windows under the trigger label
///
/// Used until a trained wake-word model is plugged in through `WakeWordModel`.
struct LoudnessTrigger {
    label: String,
}

impl LoudnessTrigger {
    /// Normalized RMS energy that maps to a score of 1.0
    const FULL_SCALE_ENERGY: f32 = 0.1;

    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

impl WakeWordModel for LoudnessTrigger {
    fn predict(
        &mut self,
        samples: &[AudioSample],
        _sample_rate: u32,
    ) -> Result<Vec<(String, f32)>, DetectorError> {
        let score = (calculate_energy(samples) / Self::FULL_SCALE_ENERGY).min(1.0);
        Ok(vec![(self.label.clone(), score)])
    }
}
