//! Listening loop
//!
//! Owns the capture source, the resampler, the window buffer, both detectors
//! and the segmenter, and drives them one window at a time in arrival order.
//! Finalized utterances are handed to the sink on a separate task so a slow
//! consumer never stalls ingestion.

use crate::audio_buffer::{AnalysisWindow, WindowBuffer};
use crate::capture::{AudioSource, CaptureError, Frame};
use crate::config::{ConfigError, ListenerConfig};
use crate::detector::{DetectorError, DetectorKind, Scorer};
use crate::resampler::Resampler;
use crate::segmenter::{
    Decision, EndReason, SegmentError, SegmentState, Segmenter, SegmenterConfig, Utterance,
};
use crate::sink::UtteranceSink;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("{kind} detector failed {failures} times in a row: {source}")]
    Detector {
        kind: DetectorKind,
        failures: u32,
        #[source]
        source: DetectorError,
    },

    #[error("Wake-word worker stopped unexpectedly")]
    WakeWorkerStopped,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<SegmentError> for ListenerError {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::DetectorFailed {
                kind,
                failures,
                source,
            } => ListenerError::Detector {
                kind,
                failures,
                source,
            },
        }
    }
}

/// Diagnostic events emitted while listening
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// Heartbeat, once per analysis window
    Progress {
        seq: u64,
        rms: f32,
        phase: SegmentState,
    },
    WakeDetected {
        score: f32,
    },
    SpeechConfirmed,
    FalseTrigger {
        waited: Duration,
    },
    UtteranceReady {
        windows: usize,
        duration: Duration,
        end_reason: EndReason,
    },
    /// Transient detector error; the window was skipped
    DetectorFailure {
        kind: DetectorKind,
        message: String,
    },
    BacklogPurged {
        samples: usize,
    },
    WakeWindowDropped {
        seq: u64,
    },
    SinkFailed {
        message: String,
    },
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub windows: u64,
    pub triggers: u64,
    pub utterances: u64,
    pub false_triggers: u64,
    pub purged_samples: u64,
    pub dropped_wake_windows: u64,
    pub dropped_frames: u64,
    pub dropped_utterances: u64,
    pub sink_failures: u64,
}

/// A listening session, ready to run
pub struct Listener {
    config: ListenerConfig,
    source: Box<dyn AudioSource>,
    wake: Box<dyn Scorer>,
    vad: Box<dyn Scorer>,
    sink: Box<dyn UtteranceSink>,
    events: Option<mpsc::Sender<ListenerEvent>>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        source: Box<dyn AudioSource>,
        wake: Box<dyn Scorer>,
        vad: Box<dyn Scorer>,
        sink: Box<dyn UtteranceSink>,
    ) -> Self {
        Self {
            config,
            source,
            wake,
            vad,
            sink,
            events: None,
        }
    }

    /// Publish diagnostic events on `events`; full channels drop events
    pub fn with_events(mut self, events: mpsc::Sender<ListenerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Listen until the source is exhausted, `cancel` fires or a fatal error occurs
    ///
    /// The source is closed exactly once on every exit path. A recording
    /// still in progress when the loop stops is discarded; utterances
    /// already finalized are delivered before this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, ListenerError> {
        let Listener {
            config,
            mut source,
            wake,
            vad,
            sink,
            events,
        } = self;

        let setup = config
            .validate()
            .and_then(|_| Resampler::new(source.sample_rate(), config.target_sample_rate));

        let resampler = match setup {
            Ok(resampler) => resampler,
            Err(e) => {
                error!("Refusing to start: {}", e);
                source.close();
                return Err(e.into());
            }
        };

        info!(
            "Listening: {} Hz -> {} Hz, {}-sample windows, trigger '{}'",
            resampler.native_rate(),
            resampler.target_rate(),
            config.window_size,
            config.trigger_phrase
        );

        let (utterance_tx, utterance_rx) = mpsc::channel(config.sink_queue_capacity);
        let sink_task = tokio::spawn(deliver_utterances(sink, utterance_rx, events.clone()));

        let wake = if config.offload_wake_word {
            debug!(
                "Offloading wake-word scoring (queue capacity {})",
                config.wake_queue_capacity
            );
            WakePath::Offloaded(WakeWorker::spawn(
                wake,
                config.wake_queue_capacity,
                lookbehind_windows(&config),
            ))
        } else {
            WakePath::Inline(wake)
        };

        let mut session = Session {
            buffer: WindowBuffer::new(config.window_size, config.max_backlog_windows),
            segmenter: Segmenter::new(SegmenterConfig::from(&config)),
            resampler,
            wake,
            vad,
            utterances: utterance_tx,
            sink_task,
            events,
            summary: RunSummary::default(),
        };

        let outcome = loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                frame = source.read_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = session.ingest(frame) {
                        break Outcome::Failed(e);
                    }
                }
                Ok(None) => break Outcome::Exhausted,
                Err(e) => {
                    error!("Capture failed: {}", e);
                    break Outcome::Failed(e.into());
                }
            }

            if let Err(e) = session.poll_wake_results() {
                break Outcome::Failed(e);
            }

            tokio::task::yield_now().await;
        };

        session.summary.dropped_frames = source.dropped_frames();
        source.close();

        let result = match outcome {
            Outcome::Exhausted => {
                debug!("Audio source exhausted");
                session.drain_wake_results().await
            }
            Outcome::Cancelled => {
                info!("Listening cancelled");
                Ok(())
            }
            Outcome::Failed(e) => Err(e),
        };

        session.segmenter.reset();
        let summary = session.shutdown().await;

        match result {
            Ok(()) => {
                let summary = summary?;
                info!(
                    "Listener stopped: {} windows, {} triggers, {} utterances",
                    summary.windows, summary.triggers, summary.utterances
                );
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }
}

enum Outcome {
    Exhausted,
    Cancelled,
    Failed(ListenerError),
}

/// Wake-word score for a window scored on the worker
struct WakeResult {
    seq: u64,
    at: Instant,
    score: Result<f32, DetectorError>,
}

enum WakePath {
    Inline(Box<dyn Scorer>),
    Offloaded(WakeWorker),
}

/// Window produced while waiting for a trigger
struct LoggedWindow {
    window: AnalysisWindow,
    /// Accepted by the worker queue
    submitted: bool,
}

/// Wake-word scoring on a blocking worker, fed by a bounded queue
struct WakeWorker {
    windows: mpsc::Sender<AnalysisWindow>,
    results: mpsc::Receiver<WakeResult>,
    /// Windows newer than the last settled result, whether or not the queue took them
    lookbehind: VecDeque<LoggedWindow>,
    lookbehind_limit: usize,
    handle: JoinHandle<()>,
}

impl WakeWorker {
    fn spawn(mut scorer: Box<dyn Scorer>, capacity: usize, lookbehind_limit: usize) -> Self {
        let (windows, mut window_rx) = mpsc::channel::<AnalysisWindow>(capacity);
        let (result_tx, results) = mpsc::channel(capacity);

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(window) = window_rx.blocking_recv() {
                let result = WakeResult {
                    seq: window.seq,
                    at: window.at,
                    score: scorer.score(&window),
                };
                if result_tx.blocking_send(result).is_err() {
                    break;
                }
            }
            trace!("wake-word worker exiting");
        });

        Self {
            windows,
            results,
            lookbehind: VecDeque::new(),
            lookbehind_limit: lookbehind_limit.max(1),
            handle,
        }
    }

    /// Queue a window for scoring and log it; returns false when the queue turned it away
    fn submit(&mut self, window: AnalysisWindow) -> bool {
        let submitted = match self.windows.try_send(window.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        };

        self.lookbehind.push_back(LoggedWindow { window, submitted });
        if self.lookbehind.len() > self.lookbehind_limit {
            let excess = self.lookbehind.len() - self.lookbehind_limit;
            warn!(
                windows = excess,
                "wake-word worker behind, oldest unscored windows forgotten"
            );
            self.lookbehind.drain(..excess);
        }

        submitted
    }

    /// Match a result against the oldest logged window; stale results return false
    fn settle(&mut self, seq: u64) -> bool {
        while self.lookbehind.front().is_some_and(|w| w.window.seq < seq) {
            self.lookbehind.pop_front();
        }

        match self.lookbehind.front() {
            Some(logged) if logged.submitted && logged.window.seq == seq => {
                self.lookbehind.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Results still owed by the worker
    fn awaiting(&self) -> bool {
        self.lookbehind.iter().any(|w| w.submitted)
    }

    /// Take every logged window, oldest first
    fn take_logged(&mut self) -> Vec<AnalysisWindow> {
        self.lookbehind.drain(..).map(|w| w.window).collect()
    }
}

/// Mutable state of one run
struct Session {
    resampler: Resampler,
    buffer: WindowBuffer,
    segmenter: Segmenter,
    wake: WakePath,
    vad: Box<dyn Scorer>,
    utterances: mpsc::Sender<Utterance>,
    sink_task: JoinHandle<u64>,
    events: Option<mpsc::Sender<ListenerEvent>>,
    summary: RunSummary,
}

impl Session {
    fn ingest(&mut self, frame: Frame) -> Result<(), ListenerError> {
        self.summary.frames += 1;

        let at = frame.captured_at();
        let samples = self.resampler.resample(frame.samples());

        let report = self.buffer.push(&samples, at);
        if report.purged > 0 {
            self.summary.purged_samples += report.purged as u64;
            self.emit(ListenerEvent::BacklogPurged {
                samples: report.purged,
            });
        }

        while let Some(window) = self.buffer.drain_window() {
            self.summary.windows += 1;

            let seq = window.seq;
            let rms = window.rms();
            self.process_window(window)?;

            let phase = self.segmenter.phase();
            trace!(seq, rms, ?phase, "window processed");
            self.emit(ListenerEvent::Progress { seq, rms, phase });
        }

        Ok(())
    }

    fn process_window(&mut self, window: AnalysisWindow) -> Result<(), ListenerError> {
        if self.segmenter.is_recording() {
            return self.score_recording(window);
        }

        let (seq, at) = (window.seq, window.at);
        let scored = match &mut self.wake {
            WakePath::Inline(scorer) => Ok(Some(scorer.score(&window))),
            WakePath::Offloaded(worker) => {
                if worker.submit(window) {
                    Ok(None)
                } else {
                    Err(seq)
                }
            }
        };

        match scored {
            Ok(Some(score)) => self.score_wake(score, at),
            Ok(None) => Ok(()),
            Err(seq) => {
                self.summary.dropped_wake_windows += 1;
                debug!(seq, "wake-word queue full, window kept for replay only");
                self.emit(ListenerEvent::WakeWindowDropped { seq });
                Ok(())
            }
        }
    }

    fn score_wake(
        &mut self,
        score: Result<f32, DetectorError>,
        at: Instant,
    ) -> Result<(), ListenerError> {
        if let Err(e) = &score {
            self.emit(ListenerEvent::DetectorFailure {
                kind: DetectorKind::WakeWord,
                message: e.to_string(),
            });
        }

        let decision = self.segmenter.observe_wake(score, at)?;
        self.apply(decision);
        Ok(())
    }

    fn score_recording(&mut self, window: AnalysisWindow) -> Result<(), ListenerError> {
        let score = self.vad.score(&window);
        if let Err(e) = &score {
            self.emit(ListenerEvent::DetectorFailure {
                kind: self.vad.kind(),
                message: e.to_string(),
            });
        }

        let decision = self.segmenter.observe_recording(window, score)?;
        self.apply(decision);
        Ok(())
    }

    /// Feed any wake-word results the worker has finished
    fn poll_wake_results(&mut self) -> Result<(), ListenerError> {
        loop {
            let result = match &mut self.wake {
                WakePath::Offloaded(worker) => match worker.results.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => return Ok(()),
                    Err(TryRecvError::Disconnected) => {
                        error!("Wake-word worker disconnected");
                        return Err(ListenerError::WakeWorkerStopped);
                    }
                },
                WakePath::Inline(_) => return Ok(()),
            };

            self.handle_wake_result(result)?;
        }
    }

    /// Wait for every pending wake-word result
    async fn drain_wake_results(&mut self) -> Result<(), ListenerError> {
        loop {
            let result = match &mut self.wake {
                WakePath::Offloaded(worker) if worker.awaiting() => {
                    match worker.results.recv().await {
                        Some(result) => result,
                        None => return Ok(()),
                    }
                }
                _ => return Ok(()),
            };

            self.handle_wake_result(result)?;
        }
    }

    fn handle_wake_result(&mut self, result: WakeResult) -> Result<(), ListenerError> {
        let WakePath::Offloaded(worker) = &mut self.wake else {
            return Ok(());
        };

        if !worker.settle(result.seq) {
            trace!(seq = result.seq, "stale wake-word result ignored");
            return Ok(());
        }

        self.score_wake(result.score, result.at)?;

        // Windows produced after the trigger belong to the recording
        if self.segmenter.is_recording() {
            let replay = match &mut self.wake {
                WakePath::Offloaded(worker) => worker.take_logged(),
                WakePath::Inline(_) => Vec::new(),
            };

            if !replay.is_empty() {
                debug!(windows = replay.len(), "replaying windows produced after trigger");
            }
            for window in replay {
                self.process_window(window)?;
            }
        }

        Ok(())
    }

    fn apply(&mut self, decision: Decision) {
        match decision {
            Decision::Continue => {}
            Decision::Triggered { score } => {
                self.summary.triggers += 1;
                self.emit(ListenerEvent::WakeDetected { score });
            }
            Decision::SpeechConfirmed => {
                self.emit(ListenerEvent::SpeechConfirmed);
            }
            Decision::FalseTrigger { waited } => {
                self.summary.false_triggers += 1;
                self.emit(ListenerEvent::FalseTrigger { waited });
            }
            Decision::Finalized(utterance) => self.dispatch(utterance),
        }
    }

    fn dispatch(&mut self, utterance: Utterance) {
        self.summary.utterances += 1;
        self.emit(ListenerEvent::UtteranceReady {
            windows: utterance.windows,
            duration: utterance.duration(),
            end_reason: utterance.end_reason,
        });

        let message = match self.utterances.try_send(utterance) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => "sink queue full, utterance dropped",
            Err(TrySendError::Closed(_)) => "sink task stopped, utterance dropped",
        };

        warn!("{}", message);
        self.summary.dropped_utterances += 1;
        self.emit(ListenerEvent::SinkFailed {
            message: message.to_string(),
        });
    }

    fn emit(&self, event: ListenerEvent) {
        emit(&self.events, event);
    }

    async fn shutdown(self) -> Result<RunSummary, ListenerError> {
        let Session {
            wake,
            utterances,
            sink_task,
            mut summary,
            ..
        } = self;

        if let WakePath::Offloaded(worker) = wake {
            let WakeWorker {
                windows,
                results,
                handle,
                ..
            } = worker;
            drop(windows);
            drop(results);
            handle.await?;
        }

        drop(utterances);
        summary.sink_failures = sink_task.await?;

        Ok(summary)
    }
}

fn emit(events: &Option<mpsc::Sender<ListenerEvent>>, event: ListenerEvent) {
    if let Some(tx) = events {
        if tx.try_send(event).is_err() {
            trace!("event channel full or closed, event dropped");
        }
    }
}

/// Windows kept for replay while offloaded wake-word scoring catches up
fn lookbehind_windows(config: &ListenerConfig) -> usize {
    let window = config.window_duration().as_secs_f64();
    let span = (config.max_command().as_secs_f64() / window).ceil() as usize;
    span + 2 * config.wake_queue_capacity + 1
}

/// Hand utterances to the sink one at a time; returns the number of failures
async fn deliver_utterances(
    mut sink: Box<dyn UtteranceSink>,
    mut utterances: mpsc::Receiver<Utterance>,
    events: Option<mpsc::Sender<ListenerEvent>>,
) -> u64 {
    let mut failures = 0;

    while let Some(utterance) = utterances.recv().await {
        if let Err(e) = sink.on_utterance(utterance).await {
            failures += 1;
            error!("Utterance sink failed: {}", e);
            emit(
                &events,
                ListenerEvent::SinkFailed {
                    message: e.to_string(),
                },
            );
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Frames of constant samples with synthetic timestamps
    struct ConstSource {
        rate: u32,
        frames: VecDeque<Vec<i16>>,
        base: Instant,
        index: u32,
        closed: Arc<AtomicBool>,
    }

    impl ConstSource {
        fn new(rate: u32, frames: Vec<Vec<i16>>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            let source = Self {
                rate,
                frames: frames.into(),
                base: Instant::now(),
                index: 0,
                closed: closed.clone(),
            };
            (source, closed)
        }
    }

    #[async_trait]
    impl AudioSource for ConstSource {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let Some(samples) = self.frames.pop_front() else {
                return Ok(None);
            };
            let at = self.base + Duration::from_millis(32 * self.index as u64);
            self.index += 1;
            Ok(Some(Frame::new(samples, at)))
        }

        fn close(&mut self) {
            assert!(!self.closed.swap(true, Ordering::SeqCst), "closed twice");
        }
    }

    /// Scores every window with its first sample / 1000
    struct SampleScorer(DetectorKind);

    impl Scorer for SampleScorer {
        fn score(&mut self, window: &AnalysisWindow) -> Result<f32, DetectorError> {
            Ok(window.samples[0] as f32 / 1000.0)
        }

        fn kind(&self) -> DetectorKind {
            self.0
        }
    }

    #[derive(Clone, Default)]
    struct FailingSink {
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl UtteranceSink for FailingSink {
        async fn on_utterance(&mut self, _utterance: Utterance) -> Result<(), SinkError> {
            *self.calls.lock().unwrap() += 1;
            Err(SinkError::Rejected("downstream offline".to_string()))
        }
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            min_speech_secs: 0.05,
            silence_secs: 0.09,
            command_timeout_secs: 0.5,
            ..Default::default()
        }
    }

    fn window_of(value: i16) -> Vec<i16> {
        vec![value; 512]
    }

    #[tokio::test]
    async fn test_invalid_config_closes_source() {
        let (source, closed) = ConstSource::new(16000, vec![]);
        let config = ListenerConfig {
            wake_threshold: 0.0,
            ..Default::default()
        };

        let listener = Listener::new(
            config,
            Box::new(source),
            Box::new(SampleScorer(DetectorKind::WakeWord)),
            Box::new(SampleScorer(DetectorKind::Vad)),
            Box::new(FailingSink::default()),
        );

        let result = listener.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ListenerError::Config(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_native_rate_is_config_error() {
        let (source, closed) = ConstSource::new(0, vec![]);

        let listener = Listener::new(
            ListenerConfig::default(),
            Box::new(source),
            Box::new(SampleScorer(DetectorKind::WakeWord)),
            Box::new(SampleScorer(DetectorKind::Vad)),
            Box::new(FailingSink::default()),
        );

        let result = listener.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ListenerError::Config(ConfigError::InvalidSampleRate(0)))
        ));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_fatal() {
        // arm, trigger, two speech windows, three silent windows
        let frames = [0, 900, 900, 900, 0, 0, 0]
            .into_iter()
            .map(window_of)
            .collect();
        let (source, closed) = ConstSource::new(16000, frames);
        let sink = FailingSink::default();
        let calls = sink.calls.clone();
        let (tx, mut rx) = mpsc::channel(64);

        let listener = Listener::new(
            config(),
            Box::new(source),
            Box::new(SampleScorer(DetectorKind::WakeWord)),
            Box::new(SampleScorer(DetectorKind::Vad)),
            Box::new(sink),
        )
        .with_events(tx);

        let summary = listener.run(CancellationToken::new()).await.unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(summary.windows, 7);
        assert_eq!(summary.triggers, 1);
        assert_eq!(summary.utterances, 1);
        assert_eq!(summary.sink_failures, 1);
        assert_eq!(*calls.lock().unwrap(), 1);

        let mut saw_failure = false;
        let mut progress = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ListenerEvent::SinkFailed { .. } => saw_failure = true,
                ListenerEvent::Progress { .. } => progress += 1,
                _ => {}
            }
        }
        assert!(saw_failure);
        assert_eq!(progress, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (source, closed) = ConstSource::new(16000, vec![window_of(0); 4]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let listener = Listener::new(
            config(),
            Box::new(source),
            Box::new(SampleScorer(DetectorKind::WakeWord)),
            Box::new(SampleScorer(DetectorKind::Vad)),
            Box::new(FailingSink::default()),
        );

        let summary = listener.run(cancel).await.unwrap();
        assert_eq!(summary.frames, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    fn window(seq: u64) -> AnalysisWindow {
        AnalysisWindow {
            seq,
            samples: vec![0; 4],
            at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_settle_skips_dropped_and_stale_results() {
        let mut worker =
            WakeWorker::spawn(Box::new(SampleScorer(DetectorKind::WakeWord)), 4, 16);
        for (seq, submitted) in [(3, true), (4, false), (5, true)] {
            worker.lookbehind.push_back(LoggedWindow {
                window: window(seq),
                submitted,
            });
        }

        // Result for an older, already replayed window
        assert!(!worker.settle(1));
        assert!(worker.settle(3));
        // 4 was turned away by the queue, so no result can match it
        assert!(!worker.settle(4));
        assert_eq!(worker.lookbehind.len(), 2);
        assert!(worker.awaiting());
        assert!(worker.settle(5));
        assert!(worker.lookbehind.is_empty());
        assert!(!worker.awaiting());
    }

    #[tokio::test]
    async fn test_turned_away_windows_are_kept_for_replay() {
        let mut worker =
            WakeWorker::spawn(Box::new(SampleScorer(DetectorKind::WakeWord)), 4, 16);
        worker.lookbehind.push_back(LoggedWindow {
            window: window(1),
            submitted: true,
        });
        worker.lookbehind.push_back(LoggedWindow {
            window: window(2),
            submitted: false,
        });
        worker.lookbehind.push_back(LoggedWindow {
            window: window(3),
            submitted: true,
        });

        assert!(worker.settle(1));
        let replay: Vec<u64> = worker.take_logged().iter().map(|w| w.seq).collect();
        assert_eq!(replay, vec![2, 3]);
        assert!(!worker.awaiting());
    }

    #[tokio::test]
    async fn test_lookbehind_forgets_oldest_windows() {
        let mut worker =
            WakeWorker::spawn(Box::new(SampleScorer(DetectorKind::WakeWord)), 1, 3);
        for seq in 0..5 {
            worker.submit(window(seq));
        }

        let kept: Vec<u64> = worker.lookbehind.iter().map(|w| w.window.seq).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn test_lookbehind_covers_longest_command() {
        let config = ListenerConfig {
            max_command_secs: 3.0,
            wake_queue_capacity: 5,
            ..Default::default()
        };
        // 94 windows of 32ms plus both worker queues and the window in flight
        assert_eq!(lookbehind_windows(&config), 105);
    }
}
