//! # Playback Scheduler
//!
//! Turns discrete response clips into a continuous, real-time outbound stream.
//! The transport pulls one frame per call to [`PlaybackScheduler::next_frame`];
//! every call yields exactly one fixed-size frame, taken from the current clip or
//! synthesized as silence, and returns no earlier than the frame's due time.
//!
//! ## Pacing:
//! The due time of a frame is always computed from the cumulative sample count
//! (`start_time + timestamp / sample_rate`), never by adding per-frame deltas, so
//! a late caller catches up instead of drifting.
//!
//! ## Rust Concepts:
//! - **std Mutex for queue state**: held only for the bookkeeping, never across `.await`
//! - **watch channel**: a close flag that wakes any pending frame wait
//! - **tokio::time::sleep_until**: absolute deadlines, controllable in tests

use crate::audio::convert::{self, bytes_to_samples, decode_wav, samples_to_bytes, AudioFormat};
use crate::error::EngineResult;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// A complete reply clip waiting to be played.
#[derive(Debug, Clone)]
pub struct ResponseClip {
    samples: Vec<i16>,
    format: AudioFormat,
}

impl ResponseClip {
    /// Decode a WAV payload, keeping its own rate and channel count.
    pub fn from_wav(bytes: &[u8]) -> EngineResult<Self> {
        let (samples, format) = decode_wav(bytes)?;
        Ok(Self { samples, format })
    }

    /// Wrap raw 16-bit little-endian PCM.
    pub fn from_pcm(pcm: &[u8], format: AudioFormat) -> EngineResult<Self> {
        format.validate()?;
        Ok(Self {
            samples: bytes_to_samples(pcm)?,
            format,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn duration(&self) -> Duration {
        let frames = (self.samples.len() / self.format.channels.max(1) as usize) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / self.format.sample_rate.max(1) as u64)
    }
}

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Interleaved 16-bit little-endian PCM
    pub data: Vec<u8>,
    /// Presentation timestamp in samples per channel
    pub pts: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub silent: bool,
}

struct ClipCursor {
    samples: Vec<i16>,
    position: usize,
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<Vec<i16>>,
    current: Option<ClipCursor>,
    timestamp: u64,
}

impl SchedulerState {
    /// Interleaved samples for the next frame, or None for silence.
    fn take_frame(&mut self, len: usize) -> Option<Vec<i16>> {
        if self.current.is_none() {
            let samples = self.pending.pop_front()?;
            self.current = Some(ClipCursor { samples, position: 0 });
        }

        let cursor = self.current.as_mut()?;
        if cursor.position >= cursor.samples.len() {
            self.current = None;
            return None;
        }

        let end = (cursor.position + len).min(cursor.samples.len());
        let mut frame = cursor.samples[cursor.position..end].to_vec();
        frame.resize(len, 0);
        cursor.position = end;
        Some(frame)
    }
}

/// Paced frame source for one session's outbound audio.
pub struct PlaybackScheduler {
    format: AudioFormat,
    frame_samples: usize,
    state: Mutex<SchedulerState>,
    start_time: Instant,
    closed_tx: watch::Sender<bool>,
}

impl PlaybackScheduler {
    /// ## Parameters:
    /// - **format**: outbound rate and channel layout; clips are converted to it
    /// - **frame_duration_ms**: playing time of each frame
    pub fn new(format: AudioFormat, frame_duration_ms: u32) -> Self {
        let frame_samples = (format.sample_rate as u64 * frame_duration_ms as u64 / 1000).max(1) as usize;
        let (closed_tx, _) = watch::channel(false);
        Self {
            format,
            frame_samples,
            state: Mutex::new(SchedulerState::default()),
            start_time: Instant::now(),
            closed_tx,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Samples per channel in every frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Append a clip to the pending queue.
    ///
    /// ## Returns:
    /// - **false**: the scheduler is closed and the clip was dropped
    pub fn enqueue(&self, clip: ResponseClip) -> bool {
        if self.is_closed() {
            return false;
        }
        let samples = if clip.format == self.format {
            clip.samples
        } else {
            convert::convert(&clip.samples, clip.format, self.format)
        };
        self.lock().pending.push_back(samples);
        true
    }

    /// Produce the next frame once it is due.
    ///
    /// ## Returns:
    /// - **Some(frame)**: a clip frame or a silence frame
    /// - **None**: the scheduler was closed, before or during the wait
    pub async fn next_frame(&self) -> Option<AudioFrame> {
        if self.is_closed() {
            return None;
        }

        let frame_len = self.frame_samples * self.format.channels as usize;
        let (samples, pts) = {
            let mut state = self.lock();
            let samples = state.take_frame(frame_len);
            let pts = state.timestamp;
            state.timestamp += self.frame_samples as u64;
            (samples, pts)
        };

        let due = self.start_time + offset_of(pts, self.format.sample_rate);

        tokio::select! {
            biased;
            _ = wait_closed(self.closed_tx.subscribe()) => return None,
            _ = sleep_until(due) => {}
        }

        let silent = samples.is_none();
        let samples = samples.unwrap_or_else(|| vec![0; frame_len]);
        Some(AudioFrame {
            data: samples_to_bytes(&samples),
            pts,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            silent,
        })
    }

    /// Samples per channel handed out so far.
    pub fn timestamp(&self) -> u64 {
        self.lock().timestamp
    }

    /// Number of clips waiting behind the current one.
    pub fn pending_clips(&self) -> usize {
        self.lock().pending.len()
    }

    /// Stop producing frames and drop queued clips. Idempotent.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
        let mut state = self.lock();
        state.pending.clear();
        state.current = None;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Playing time of `pts` samples per channel. Whole seconds are split off first so
/// the nanosecond product cannot overflow.
fn offset_of(pts: u64, sample_rate: u32) -> Duration {
    let rate = sample_rate as u64;
    Duration::from_secs(pts / rate) + Duration::from_nanos((pts % rate) * 1_000_000_000 / rate)
}

async fn wait_closed(mut closed_rx: watch::Receiver<bool>) {
    loop {
        let closed = *closed_rx.borrow_and_update();
        if closed {
            return;
        }
        if closed_rx.changed().await.is_err() {
            return;
        }
    }
}
