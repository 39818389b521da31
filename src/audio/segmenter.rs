//! # Utterance Segmenter
//!
//! Decides when a stretch of incoming audio is a complete utterance worth
//! transcribing. The segmenter is driven one fixed-size chunk at a time by the
//! session's worker thread.
//!
//! ## State Machine:
//! - **Idle**: nothing buffered
//! - **Accumulating**: loud audio and/or confirmed voice are buffered
//! - **Flushing**: the confirmed voice is with the transcriber
//!
//! ## Per-tick rules, in order:
//! 1. A loud chunk re-arms the recording countdown and stamps `last_loud_at`
//! 2. While the countdown runs, chunks go into the loud buffer
//! 3. The environment is quiet once nothing loud was heard for `silence_flush`
//! 4. A full (`record_timeout`) or quiet-terminated loud buffer is enhanced and
//!    re-checked; survivors become confirmed voice
//! 5. The user has stopped speaking when it is quiet, or voice has been absent for
//!    longer than both timeouts
//! 6. Pending voice is flushed when the user stopped or it exceeds `max_recording`
//!
//! ## Time:
//! All timing goes through the [`Clock`] trait so tests can drive the state
//! machine with a manual clock instead of sleeping.

use crate::audio::detector::{NoiseDetector, SampleWidth};
use crate::audio::enhance::Enhancer;
use crate::config::{AudioSettings, SegmenterSettings};
use crate::error::EngineResult;
use crate::transcription::TranscriptionDispatcher;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Segmenter tuning, in engine units.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub energy_threshold: f64,
    pub record_timeout: Duration,
    pub silence_flush: Duration,
    pub max_recording: Duration,
}

impl SegmenterConfig {
    pub fn from_settings(audio: &AudioSettings, segmenter: &SegmenterSettings) -> Self {
        Self {
            sample_rate: audio.analysis_sample_rate,
            energy_threshold: segmenter.energy_threshold,
            record_timeout: segmenter.record_timeout(),
            silence_flush: segmenter.silence_flush(),
            max_recording: segmenter.max_recording(),
        }
    }

    /// Playing time of `bytes` of 16-bit mono audio.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let samples = (bytes / 2) as u64;
        Duration::from_nanos(samples * 1_000_000_000 / self.sample_rate as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmenterState {
    Idle,
    Accumulating,
    Flushing,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Accumulating,
    Flushed {
        text: String,
        voice_duration: Duration,
        transcription_time: Duration,
    },
}

pub struct UtteranceSegmenter {
    config: SegmenterConfig,
    detector: NoiseDetector,
    enhancer: Arc<dyn Enhancer>,
    dispatcher: TranscriptionDispatcher,
    clock: Arc<dyn Clock>,

    state: SegmenterState,
    /// Minimum recording remaining after the last loud chunk
    countdown: Duration,
    loud_audio: Vec<u8>,
    voice_audio: Vec<u8>,
    last_loud_at: Option<Instant>,
    last_voice_at: Option<Instant>,
    needs_transcription: bool,
}

impl UtteranceSegmenter {
    pub fn new(
        config: SegmenterConfig,
        enhancer: Arc<dyn Enhancer>,
        dispatcher: TranscriptionDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let detector = NoiseDetector::new(SampleWidth::I16, config.energy_threshold);
        Self {
            config,
            detector,
            enhancer,
            dispatcher,
            clock,
            state: SegmenterState::Idle,
            countdown: Duration::ZERO,
            loud_audio: Vec::new(),
            voice_audio: Vec::new(),
            last_loud_at: None,
            last_voice_at: None,
            needs_transcription: false,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Duration of confirmed voice waiting for transcription.
    pub fn pending_voice(&self) -> Duration {
        self.config.duration_of(self.voice_audio.len())
    }

    /// Process one chunk read from the frame queue.
    ///
    /// ## Returns:
    /// - **Ok(Flushed)**: an utterance was transcribed and handed to the flush handler
    /// - **Err**: enhancement or transcription failed; the utterance in progress was
    ///   dropped and the segmenter is back to Idle
    pub fn tick(&mut self, chunk: &[u8]) -> EngineResult<TickOutcome> {
        let now = self.clock.now();
        let chunk_duration = self.config.duration_of(chunk.len());

        if self.detector.is_loud(chunk) {
            self.countdown = self.config.record_timeout;
            self.last_loud_at = Some(now);
        }

        if !self.countdown.is_zero() {
            self.loud_audio.extend_from_slice(chunk);
            self.countdown = self.countdown.saturating_sub(chunk_duration);
            self.state = SegmenterState::Accumulating;
        }

        let quiet = match self.last_loud_at {
            Some(at) => now.saturating_duration_since(at) > self.config.silence_flush,
            None => true,
        };

        let loud_buffered = self.config.duration_of(self.loud_audio.len());
        if loud_buffered >= self.config.record_timeout || (!self.loud_audio.is_empty() && quiet) {
            let drained = std::mem::take(&mut self.loud_audio);
            let enhanced = match self.enhancer.enhance(&drained) {
                Ok(enhanced) => enhanced,
                Err(err) => {
                    self.abort();
                    return Err(err);
                }
            };

            // The re-check is over the whole drained buffer, including the silent
            // tail buffered while the countdown ran out. A short burst of speech
            // followed by a long tail can average out below the threshold.
            if self.detector.is_loud(&enhanced) {
                self.voice_audio.extend_from_slice(&enhanced);
                self.last_voice_at = Some(now);
                self.needs_transcription = true;
            } else {
                debug!(
                    session_id = %self.dispatcher.session_id(),
                    seconds = loud_buffered.as_secs_f64(),
                    "loud audio rejected after enhancement"
                );
            }
        }

        let voice_gap = self.config.record_timeout.max(self.config.silence_flush);
        let user_stopped_speaking = quiet
            || self
                .last_voice_at
                .map_or(false, |at| now.saturating_duration_since(at) > voice_gap);
        let too_long = self.pending_voice() > self.config.max_recording;

        if self.needs_transcription && (user_stopped_speaking || too_long) {
            return self.flush();
        }

        self.settle();
        Ok(match self.state {
            SegmenterState::Idle => TickOutcome::Idle,
            _ => TickOutcome::Accumulating,
        })
    }

    fn flush(&mut self) -> EngineResult<TickOutcome> {
        self.state = SegmenterState::Flushing;
        self.needs_transcription = false;

        let utterance = std::mem::take(&mut self.voice_audio);
        let voice_duration = self.config.duration_of(utterance.len());
        let started = self.clock.now();

        let result = self.dispatcher.dispatch(&utterance);

        // Time spent transcribing must not count as silence on the next tick
        let finished = self.clock.now();
        self.last_loud_at = Some(finished);
        self.last_voice_at = None;

        match result {
            Ok(text) => {
                self.settle();
                Ok(TickOutcome::Flushed {
                    text,
                    voice_duration,
                    transcription_time: finished.saturating_duration_since(started),
                })
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    /// Drop the utterance in progress.
    fn abort(&mut self) {
        self.loud_audio.clear();
        self.voice_audio.clear();
        self.countdown = Duration::ZERO;
        self.needs_transcription = false;
        self.state = SegmenterState::Idle;
    }

    fn settle(&mut self) {
        self.state = if self.loud_audio.is_empty() && self.voice_audio.is_empty() && self.countdown.is_zero() {
            SegmenterState::Idle
        } else {
            SegmenterState::Accumulating
        };
    }
}

/// Manually advanced clock for driving the segmenter in tests.
#[cfg(test)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn set(&self, offset: Duration) {
        *self.offset.lock().unwrap() = offset;
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::samples_to_bytes;
    use crate::audio::enhance::tests::{noise, square};
    use crate::audio::enhance::{DspEnhancer, Passthrough, SerializedEnhancer};
    use crate::config::AppConfig;
    use crate::error::EngineError;
    use crate::transcription::{FlushHandler, Transcriber};
    use std::sync::Mutex;

    const RATE: u32 = 16000;
    const TICK_MS: u64 = 100;
    const TICK_SAMPLES: usize = 1600;

    /// Returns "<n> samples" so tests can see how much audio was flushed.
    struct CountingTranscriber {
        clock: Option<Arc<ManualClock>>,
        delay: Duration,
    }

    impl Transcriber for CountingTranscriber {
        fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> EngineResult<String> {
            if let Some(clock) = &self.clock {
                clock.advance(self.delay);
            }
            Ok(format!("{} samples", samples.len()))
        }
    }

    struct BrokenTranscriber;

    impl Transcriber for BrokenTranscriber {
        fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> EngineResult<String> {
            Err(EngineError::Model("decoder crashed".to_string()))
        }
    }

    struct BrokenEnhancer;

    impl Enhancer for BrokenEnhancer {
        fn enhance(&self, _pcm: &[u8]) -> EngineResult<Vec<u8>> {
            Err(EngineError::Model("enhancer crashed".to_string()))
        }
    }

    #[derive(Default)]
    struct Flushes(Mutex<Vec<String>>);

    impl FlushHandler for Flushes {
        fn on_flush(&self, _session_id: &str, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    fn config(record: f64, silence: f64, max: f64) -> SegmenterConfig {
        SegmenterConfig {
            sample_rate: RATE,
            energy_threshold: 200.0,
            record_timeout: Duration::from_secs_f64(record),
            silence_flush: Duration::from_secs_f64(silence),
            max_recording: Duration::from_secs_f64(max),
        }
    }

    fn segmenter(
        config: SegmenterConfig,
        clock: Arc<ManualClock>,
        enhancer: Arc<dyn Enhancer>,
        transcriber: Arc<dyn Transcriber>,
        flushes: Arc<Flushes>,
    ) -> UtteranceSegmenter {
        let dispatcher = TranscriptionDispatcher::new("test", RATE, transcriber, flushes);
        UtteranceSegmenter::new(config, enhancer, dispatcher, clock)
    }

    fn loud_chunk() -> Vec<u8> {
        (0..TICK_SAMPLES)
            .flat_map(|i| if i % 2 == 0 { 8000i16 } else { -8000 }.to_le_bytes())
            .collect()
    }

    /// 70ms of voice then 30ms of background noise.
    fn speech_chunk(seed: u64) -> Vec<u8> {
        let mut samples = square(1120, 6000);
        samples.extend(noise(480, seed));
        samples_to_bytes(&samples)
    }

    fn noise_chunk(seed: u64) -> Vec<u8> {
        samples_to_bytes(&noise(TICK_SAMPLES, seed))
    }

    fn dsp_enhancer() -> Arc<dyn Enhancer> {
        Arc::new(SerializedEnhancer::new(DspEnhancer::from_settings(&AppConfig::default().enhancement)))
    }

    fn silent_chunk() -> Vec<u8> {
        vec![0u8; TICK_SAMPLES * 2]
    }

    /// Feed `chunks` at one tick per 100ms starting from `start_tick`.
    fn drive(
        seg: &mut UtteranceSegmenter,
        clock: &ManualClock,
        start_tick: u64,
        chunks: &[Vec<u8>],
    ) -> Vec<(u64, TickOutcome)> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let tick = start_tick + i as u64;
                clock.set(Duration::from_millis(tick * TICK_MS));
                (tick, seg.tick(chunk).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_three_seconds_of_speech_flush_once() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), Arc::new(Passthrough), transcriber, flushes.clone());

        let mut stream = vec![loud_chunk(); 30];
        stream.extend(vec![silent_chunk(); 30]);
        let outcomes = drive(&mut seg, &clock, 0, &stream);

        let flushed: Vec<_> = outcomes
            .iter()
            .filter_map(|(tick, outcome)| match outcome {
                TickOutcome::Flushed { voice_duration, .. } => Some((*tick, *voice_duration)),
                _ => None,
            })
            .collect();

        assert_eq!(flushed.len(), 1);
        let (tick, voice) = flushed[0];
        // Quiet starts strictly after 2s of silence following the last loud tick (2.9s)
        assert_eq!(tick, 50);
        let diff = voice.as_secs_f64() - 3.0;
        assert!(diff.abs() <= TICK_MS as f64 / 1000.0, "flushed {:?}", voice);
        assert_eq!(*flushes.0.lock().unwrap(), vec![format!("{} samples", 30 * TICK_SAMPLES)]);
    }

    #[test]
    fn test_continuous_silence_never_flushes() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), Arc::new(Passthrough), transcriber, flushes.clone());

        let outcomes = drive(&mut seg, &clock, 0, &vec![silent_chunk(); 600]);

        assert!(outcomes.iter().all(|(_, o)| *o == TickOutcome::Idle));
        assert!(flushes.0.lock().unwrap().is_empty());
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_noise_rejected_by_enhancer_is_not_transcribed() {
        /// Suppresses everything, like a denoiser fed pure background noise.
        struct Mute;
        impl Enhancer for Mute {
            fn enhance(&self, pcm: &[u8]) -> EngineResult<Vec<u8>> {
                Ok(vec![0u8; pcm.len()])
            }
        }

        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), Arc::new(Mute), transcriber, flushes.clone());

        let mut stream = vec![loud_chunk(); 30];
        stream.extend(vec![silent_chunk(); 60]);
        drive(&mut seg, &clock, 0, &stream);

        assert!(flushes.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_background_noise_is_rejected_by_dsp_enhancer() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), dsp_enhancer(), transcriber, flushes.clone());

        // Every noise chunk is loud on its own
        let mut stream: Vec<Vec<u8>> = (0..30).map(noise_chunk).collect();
        assert!(stream.iter().all(|chunk| seg.detector.is_loud(chunk)));
        stream.extend(vec![silent_chunk(); 60]);
        drive(&mut seg, &clock, 0, &stream);

        assert!(flushes.0.lock().unwrap().is_empty());
        assert_eq!(seg.pending_voice(), Duration::ZERO);
    }

    #[test]
    fn test_speech_over_noise_survives_dsp_enhancer() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), dsp_enhancer(), transcriber, flushes.clone());

        let mut stream: Vec<Vec<u8>> = (0..30).map(speech_chunk).collect();
        stream.extend(vec![silent_chunk(); 30]);
        let outcomes = drive(&mut seg, &clock, 0, &stream);

        let flushed: Vec<u64> = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TickOutcome::Flushed { .. }))
            .map(|(tick, _)| *tick)
            .collect();
        assert_eq!(flushed, vec![50]);
        assert_eq!(*flushes.0.lock().unwrap(), vec![format!("{} samples", 30 * TICK_SAMPLES)]);
    }

    #[test]
    fn test_short_burst_is_judged_together_with_its_silent_tail() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(3.0, 0.5, 30.0), clock.clone(), Arc::new(Passthrough), transcriber, flushes.clone());

        // RMS 400 on its own, about 151 once averaged over the 600ms buffered with it
        let burst = samples_to_bytes(&square(TICK_SAMPLES, 400));
        let mut stream = vec![burst];
        stream.extend(vec![silent_chunk(); 20]);
        drive(&mut seg, &clock, 0, &stream);

        assert!(flushes.0.lock().unwrap().is_empty());
        assert_eq!(seg.pending_voice(), Duration::ZERO);
    }

    #[test]
    fn test_long_speech_flushes_on_max_recording() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(1.0, 2.0, 2.5), clock.clone(), Arc::new(Passthrough), transcriber, flushes.clone());

        // Never quiet: confirmed voice grows 1s at a time until it exceeds 2.5s
        let outcomes = drive(&mut seg, &clock, 0, &vec![loud_chunk(); 40]);

        let flushed: Vec<_> = outcomes
            .iter()
            .filter_map(|(tick, outcome)| match outcome {
                TickOutcome::Flushed { voice_duration, .. } => Some((*tick, *voice_duration)),
                _ => None,
            })
            .collect();

        assert_eq!(flushed.first(), Some(&(29, Duration::from_secs(3))));
    }

    #[test]
    fn test_slow_transcription_does_not_trigger_immediate_reflush() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber {
            clock: Some(clock.clone()),
            delay: Duration::from_secs(10),
        });
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), Arc::new(Passthrough), transcriber, flushes.clone());

        for i in 0..30u64 {
            clock.set(Duration::from_millis(i * TICK_MS));
            seg.tick(&loud_chunk()).unwrap();
        }
        for _ in 0..21 {
            clock.advance(Duration::from_millis(TICK_MS));
            seg.tick(&silent_chunk()).unwrap();
        }
        assert_eq!(flushes.0.lock().unwrap().len(), 1);

        // One loud chunk right after the slow flush is buffered, not flushed on its own
        clock.advance(Duration::from_millis(TICK_MS));
        let outcome = seg.tick(&loud_chunk()).unwrap();
        assert_eq!(outcome, TickOutcome::Accumulating);
        assert_eq!(flushes.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_transcription_failure_aborts_utterance() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let mut seg = segmenter(config(3.0, 2.0, 30.0), clock.clone(), Arc::new(Passthrough), Arc::new(BrokenTranscriber), flushes.clone());

        let mut errors = 0;
        let mut stream = vec![loud_chunk(); 30];
        stream.extend(vec![silent_chunk(); 30]);
        for (i, chunk) in stream.iter().enumerate() {
            clock.set(Duration::from_millis(i as u64 * TICK_MS));
            if seg.tick(chunk).is_err() {
                errors += 1;
                assert_eq!(seg.state(), SegmenterState::Idle);
                assert_eq!(seg.pending_voice(), Duration::ZERO);
            }
        }

        assert_eq!(errors, 1);
        assert!(flushes.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_enhancer_failure_is_reported_and_recoverable() {
        let clock = Arc::new(ManualClock::new());
        let flushes = Arc::new(Flushes::default());
        let transcriber = Arc::new(CountingTranscriber { clock: None, delay: Duration::ZERO });
        let mut seg = segmenter(config(0.5, 2.0, 30.0), clock.clone(), Arc::new(BrokenEnhancer), transcriber, flushes);

        let mut saw_error = false;
        for i in 0..10u64 {
            clock.set(Duration::from_millis(i * TICK_MS));
            match seg.tick(&loud_chunk()) {
                Err(EngineError::Model(_)) => saw_error = true,
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => {}
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_duration_of() {
        let cfg = config(3.0, 2.0, 30.0);
        assert_eq!(cfg.duration_of(TICK_SAMPLES * 2), Duration::from_millis(100));
        assert_eq!(cfg.duration_of(0), Duration::ZERO);
    }
}
