//! Windowing buffer between the resampler and the detectors
//!
//! Resampled samples are queued in a ring buffer and handed out as fixed-size
//! analysis windows. The queue is bounded: when the consumer falls behind by
//! more than `max_backlog_windows` windows, the backlog is purged down to the
//! most recent window so the pipeline never drifts away from real time.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use std::time::Instant;
use tracing::{trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Fixed-size block of target-rate samples handed to the detectors
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    /// Position of this window in the stream (0-based, counts purged gaps as one stream)
    pub seq: u64,

    /// Exactly `window_size` samples
    pub samples: Vec<AudioSample>,

    /// Arrival time of the frame that completed this window
    pub at: Instant,
}

impl AnalysisWindow {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// RMS energy in raw sample units (0 - 32768)
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// RMS of 16-bit samples, in sample units
pub fn rms(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Outcome of a single push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Samples now queued from this push
    pub accepted: usize,

    /// Samples discarded by the anti-lag purge
    pub purged: usize,
}

/// Bounded queue of samples drained in fixed-size windows
///
/// Single writer, single reader: the buffer is owned by the listener loop
/// and never shared.
pub struct WindowBuffer {
    ring: HeapRb<AudioSample>,
    window_size: usize,
    max_backlog: usize,
    next_seq: u64,
    last_push_at: Option<Instant>,
    total_purged: u64,
}

impl WindowBuffer {
    /// Create a buffer emitting `window_size` windows and holding at most
    /// `max_backlog_windows` windows of undrained samples
    pub fn new(window_size: usize, max_backlog_windows: usize) -> Self {
        let window_size = window_size.max(1);
        let max_backlog = window_size * max_backlog_windows.max(1);

        trace!(
            "Creating window buffer: window={} samples, backlog limit={} samples",
            window_size,
            max_backlog
        );

        Self {
            ring: HeapRb::new(max_backlog),
            window_size,
            max_backlog,
            next_seq: 0,
            last_push_at: None,
            total_purged: 0,
        }
    }

    /// Append resampled samples that arrived at `at`
    pub fn push(&mut self, samples: &[AudioSample], at: Instant) -> PushReport {
        self.last_push_at = Some(at);

        if samples.is_empty() {
            return PushReport::default();
        }

        let queued = self.ring.occupied_len();

        if queued + samples.len() <= self.max_backlog {
            let accepted = self.ring.push_slice(samples);
            return PushReport { accepted, purged: 0 };
        }

        // Anti-lag purge: keep only the most recent window of queued ++ incoming
        let purged = if samples.len() >= self.window_size {
            self.ring.skip(queued);
            let tail = &samples[samples.len() - self.window_size..];
            self.ring.push_slice(tail);
            queued + samples.len() - self.window_size
        } else {
            let keep_queued = self.window_size - samples.len();
            let dropped = self.ring.skip(queued - keep_queued);
            self.ring.push_slice(samples);
            dropped
        };

        self.total_purged += purged as u64;
        warn!(
            "Window buffer backlog exceeded {} samples, purged {} oldest samples",
            self.max_backlog, purged
        );

        PushReport {
            accepted: samples.len().min(self.window_size),
            purged,
        }
    }

    /// Take exactly one window if enough samples are queued
    pub fn drain_window(&mut self) -> Option<AnalysisWindow> {
        if self.ring.occupied_len() < self.window_size {
            return None;
        }

        let mut samples = vec![0; self.window_size];
        let read = self.ring.pop_slice(&mut samples);
        debug_assert_eq!(read, self.window_size);

        let seq = self.next_seq;
        self.next_seq += 1;

        Some(AnalysisWindow {
            seq,
            samples,
            at: self.last_push_at.unwrap_or_else(Instant::now),
        })
    }

    /// Samples currently queued
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backlog limit in samples
    pub fn capacity(&self) -> usize {
        self.max_backlog
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Total samples discarded by purges since creation
    pub fn total_purged(&self) -> u64 {
        self.total_purged
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        let occupied = self.ring.occupied_len();
        self.ring.skip(occupied);
    }
}
