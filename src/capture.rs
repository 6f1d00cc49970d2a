//! Audio capture sources
//!
//! The listener pulls fixed-duration frames from an `AudioSource`. The
//! microphone source runs the cpal stream on its own thread (cpal streams are
//! not `Send`) and hands frames over a bounded channel; the device callback
//! never blocks. When the reader falls behind, the oldest queued frames are
//! shed so the newest audio is always the next to be read.

use crate::audio_buffer::AudioSample;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input device available")]
    NoDevice,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open WAV input: {0}")]
    Wav(#[from] hound::Error),

    #[error("Capture thread failed: {0}")]
    Thread(String),
}

/// Immutable block of samples captured at the device's native rate
#[derive(Debug, Clone)]
pub struct Frame {
    samples: Vec<AudioSample>,
    captured_at: Instant,
}

impl Frame {
    pub fn new(samples: Vec<AudioSample>, captured_at: Instant) -> Self {
        Self {
            samples,
            captured_at,
        }
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<AudioSample> {
        self.samples
    }
}

/// Producer of mono frames at a fixed native rate
#[async_trait]
pub trait AudioSource: Send {
    /// Native sample rate, fixed for the lifetime of the source
    fn sample_rate(&self) -> u32;

    /// Wait for the next frame; `Ok(None)` means a finite source is exhausted
    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Frames lost because the consumer fell behind
    fn dropped_frames(&self) -> u64 {
        0
    }

    /// Release the underlying device; idempotent
    fn close(&mut self);
}

/// Frame length in samples for `frame_duration_ms` at `sample_rate`
pub fn frame_len(sample_rate: u32, frame_duration_ms: u32) -> usize {
    ((sample_rate as u64 * frame_duration_ms as u64) / 1000).max(1) as usize
}

/// Create a frame hand-off whose reader lags at most `max_lag` frames
fn frame_queue(max_lag: usize) -> (FrameSender, FrameReceiver) {
    let max_lag = max_lag.max(1);
    let (tx, rx) = mpsc::channel(max_lag * 2);
    let queued = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicU64::new(0));

    let sender = FrameSender {
        tx,
        queued: Arc::clone(&queued),
        dropped: Arc::clone(&dropped),
    };
    let receiver = FrameReceiver {
        rx,
        queued,
        dropped,
        max_lag,
    };
    (sender, receiver)
}

/// Writer half, used from the device callback; never blocks
struct FrameSender {
    tx: mpsc::Sender<Frame>,
    queued: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    fn push(&self, frame: Frame) {
        // Counted before sending so the reader never sees more frames than counted
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.try_send(frame).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Reader half; sheds the oldest frames once more than `max_lag` are queued
struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
    queued: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    max_lag: usize,
}

impl FrameReceiver {
    async fn recv(&mut self) -> Option<Frame> {
        let mut frame = self.rx.recv().await?;
        self.queued.fetch_sub(1, Ordering::AcqRel);

        let mut shed = 0;
        while self.queued.load(Ordering::Acquire) > self.max_lag {
            match self.rx.try_recv() {
                Ok(newer) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    frame = newer;
                    shed += 1;
                }
                Err(_) => break,
            }
        }

        if shed > 0 {
            self.dropped.fetch_add(shed, Ordering::Relaxed);
            warn!("Capture reader lagging, dropped {} oldest frames", shed);
        }

        Some(frame)
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Microphone capture through cpal's default input device
pub struct CpalSource {
    sample_rate: u32,
    frames: FrameReceiver,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSource {
    /// Open the default input device and start streaming frames of
    /// `frame_duration_ms`, keeping at most `queue_capacity` unread frames
    pub fn open(frame_duration_ms: u32, queue_capacity: usize) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = frame_queue(queue_capacity);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u32, CaptureError>>(1);

        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_failed = Arc::clone(&failed);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match start_stream(frame_duration_ms, frame_tx, Arc::clone(&thread_failed)) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while !thread_stop.load(Ordering::Acquire) && !thread_failed.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(10));
                }

                // Dropping the stream releases the device and closes the frame channel
                drop(stream);
                debug!("Capture thread exiting");
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Thread("capture thread exited during startup".to_string()));
            }
        };

        info!("Audio capture started at {} Hz", sample_rate);

        Ok(Self {
            sample_rate,
            frames: frame_rx,
            stop,
            failed,
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.frames.recv().await {
            Some(frame) => Ok(Some(frame)),
            None if self.failed.load(Ordering::Acquire) => Err(CaptureError::DeviceUnavailable(
                "input stream reported an error".to_string(),
            )),
            None => Err(CaptureError::DeviceUnavailable("capture stream closed".to_string())),
        }
    }

    fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.frames.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("Audio capture stopped");
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build and start the input stream; runs on the capture thread
fn start_stream(
    frame_duration_ms: u32,
    frames: FrameSender,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let sample_format = supported.sample_format();

    // Prefer a mono config at the default rate; otherwise downmix
    let config = device
        .supported_input_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == 1
                    && c.sample_format() == sample_format
                    && c.min_sample_rate() <= supported.sample_rate()
                    && c.max_sample_rate() >= supported.sample_rate()
            })
        })
        .map(|c| c.with_sample_rate(supported.sample_rate()).config())
        .unwrap_or_else(|| supported.config());

    let channels = config.channels as usize;
    let frame_len = frame_len(sample_rate, frame_duration_ms);

    debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        frame_len,
        format = ?sample_format,
        "audio capture initialized"
    );

    let ctx = StreamContext {
        frames,
        failed,
        channels,
        frame_len,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, ctx),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, ctx),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, ctx),
        other => Err(CaptureError::UnsupportedFormat(format!("{:?}", other))),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, sample_rate))
}

struct StreamContext {
    frames: FrameSender,
    failed: Arc<AtomicBool>,
    channels: usize,
    frame_len: usize,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ctx: StreamContext,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let StreamContext {
        frames,
        failed,
        channels,
        frame_len,
    } = ctx;

    let mut pending: Vec<AudioSample> = Vec::with_capacity(frame_len);
    let error_flag = Arc::clone(&failed);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(channels.max(1)) {
                    pending.push(downmix(chunk));

                    if pending.len() == frame_len {
                        let samples = std::mem::replace(&mut pending, Vec::with_capacity(frame_len));
                        frames.push(Frame::new(samples, Instant::now()));
                    }
                }
            },
            move |err| {
                error!("Audio capture error: {}", err);
                error_flag.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))
}

/// Average one interleaved sample group down to mono
fn downmix<T>(chunk: &[T]) -> AudioSample
where
    T: Sample,
    i16: FromSample<T>,
{
    if chunk.len() == 1 {
        return chunk[0].to_sample::<i16>();
    }

    let sum: i32 = chunk.iter().map(|&s| s.to_sample::<i16>() as i32).sum();
    (sum / chunk.len() as i32) as AudioSample
}

/// Replays a 16-bit WAV file as if it were a live device
///
/// Frame timestamps advance by the frame duration from the moment the file
/// is opened, so timing decisions match real-time capture without sleeping.
pub struct WavFileSource {
    samples: std::vec::IntoIter<AudioSample>,
    sample_rate: u32,
    frame_len: usize,
    started_at: Instant,
    emitted: u64,
    closed: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>, frame_duration_ms: u32) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} bit {:?} (16 bit PCM required)",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        let channels = spec.channels.max(1) as usize;
        let interleaved = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        let mono: Vec<AudioSample> = interleaved.chunks(channels).map(downmix).collect();

        if spec.channels > 1 {
            warn!("{} has {} channels, downmixing to mono", path.display(), spec.channels);
        }

        let frame_len = frame_len(spec.sample_rate, frame_duration_ms);

        info!(
            "Replaying {} ({} samples at {} Hz)",
            path.display(),
            mono.len(),
            spec.sample_rate
        );

        Ok(Self {
            samples: mono.into_iter(),
            sample_rate: spec.sample_rate,
            frame_len,
            started_at: Instant::now(),
            emitted: 0,
            closed: false,
        })
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.closed {
            return Ok(None);
        }

        let samples: Vec<AudioSample> = self.samples.by_ref().take(self.frame_len).collect();
        if samples.is_empty() {
            return Ok(None);
        }

        let offset = Duration::from_nanos(self.emitted * 1_000_000_000 / self.sample_rate.max(1) as u64);
        self.emitted += samples.len() as u64;

        Ok(Some(Frame::new(samples, self.started_at + offset)))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
