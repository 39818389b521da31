//! # Voice Session
//!
//! One live caller: an inbound frame queue feeding a segmenter worker thread, and
//! a playback scheduler feeding the transport's outbound pump.
//!
//! ## Lifecycle:
//! 1. **Negotiating**: created by an offer, transport not yet connected
//! 2. **Active**: transport connected; frames are buffered until metadata arrives,
//!    then the segmenter worker runs
//! 3. **Closing**: teardown in progress
//! 4. **Closed**: worker stopped, queues released, transport closed
//!
//! ## Threading:
//! The session is shared between the transport's event loop (inbound frames,
//! control messages), the segmenter worker and the reaper. Event-loop paths only
//! ever push to the queue or touch metadata; the worker is the only blocking reader.

use crate::audio::convert::{bytes_to_samples, samples_to_bytes, AudioFormat, StreamResampler};
use crate::audio::enhance::Enhancer;
use crate::audio::frame_queue::FrameQueue;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::segmenter::{Clock, SegmenterConfig, TickOutcome, UtteranceSegmenter};
use crate::config::{AppConfig, FanoutPolicy};
use crate::error::{EngineError, EngineResult};
use crate::session::control::{MetadataBuilder, SessionMetadata};
use crate::session::peer::{ConnectionState, PeerConnection};
use crate::transcription::{FlushHandler, Transcriber, TranscriptionDispatcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Negotiating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Settings captured when the session is created. Runtime config updates do
/// not reach sessions that already exist.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub segmenter: SegmenterConfig,
    pub analysis_format: AudioFormat,
    pub output_format: AudioFormat,
    pub frame_duration_ms: u32,
    pub chunk_samples: usize,
    pub poll_interval: Duration,
    pub fanout: FanoutPolicy,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            segmenter: SegmenterConfig::from_settings(&config.audio, &config.segmenter),
            analysis_format: AudioFormat::mono(config.audio.analysis_sample_rate),
            output_format: AudioFormat::new(config.playback.sample_rate, config.playback.channels),
            frame_duration_ms: config.playback.frame_duration_ms,
            chunk_samples: config.audio.chunk_samples,
            poll_interval: Duration::from_millis(config.audio.poll_interval_ms),
            fanout: config.sessions.fanout,
        }
    }
}

#[derive(Debug, Default)]
struct SessionPerformance {
    inbound_bytes: u64,
    utterances: u32,
    aborted_utterances: u32,
    voice_ms: u64,
    total_transcription_ms: u64,
    replies: u32,
    error_count: u32,
}

/// Per-session counters exposed through the sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPerformanceSummary {
    pub inbound_bytes: u64,
    pub utterances: u32,
    pub aborted_utterances: u32,
    pub voice_seconds: f64,
    pub average_transcription_time_ms: u64,
    pub replies: u32,
    pub error_count: u32,
    pub session_duration_seconds: f64,
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub connection_state: ConnectionState,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub segmenter_running: bool,
    pub inbound_format: AudioFormat,
    pub buffered_bytes: usize,
    pub pending_clips: usize,
    pub playback_timestamp: u64,
    pub performance: SessionPerformanceSummary,
}

pub struct VoiceSession {
    id: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    inbound_format: AudioFormat,
    resampler: Mutex<Option<StreamResampler>>,
    peer: Arc<dyn PeerConnection>,
    inbound: Arc<FrameQueue>,
    playback: Arc<PlaybackScheduler>,
    lifecycle: RwLock<SessionState>,
    metadata: Mutex<MetadataBuilder>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    performance: Arc<RwLock<SessionPerformance>>,
}

impl VoiceSession {
    /// Create a session in `Negotiating`.
    ///
    /// ## Parameters:
    /// - **inbound_format**: format the transport delivers frames in unless a
    ///   frame says otherwise
    pub fn new(
        id: String,
        peer: Arc<dyn PeerConnection>,
        config: SessionConfig,
        inbound_format: AudioFormat,
    ) -> Self {
        let inbound = Arc::new(FrameQueue::new(config.poll_interval));
        let playback = Arc::new(PlaybackScheduler::new(config.output_format, config.frame_duration_ms));
        Self {
            id,
            created_at: Utc::now(),
            config,
            inbound_format,
            resampler: Mutex::new(None),
            peer,
            inbound,
            playback,
            lifecycle: RwLock::new(SessionState::Negotiating),
            metadata: Mutex::new(MetadataBuilder::default()),
            worker: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            performance: Arc::new(RwLock::new(SessionPerformance::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn playback(&self) -> &Arc<PlaybackScheduler> {
        &self.playback
    }

    pub fn state(&self) -> SessionState {
        *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Negotiating or Active.
    pub fn is_live(&self) -> bool {
        matches!(self.state(), SessionState::Negotiating | SessionState::Active)
    }

    /// Negotiating → Active. Any other state is left alone.
    pub fn mark_active(&self) -> bool {
        let mut state = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Negotiating {
            *state = SessionState::Active;
            return true;
        }
        false
    }

    /// Convert a transport frame to the analysis format and queue it.
    ///
    /// ## Returns:
    /// - **Ok(bytes)**: bytes queued after conversion
    /// - **Err(InvalidAudio)**: odd byte count or a zero rate/channel count
    /// - **Err(Transport)**: the session is closing
    pub fn accept_inbound(&self, pcm: &[u8], format: Option<AudioFormat>) -> EngineResult<usize> {
        if !self.is_live() {
            return Err(EngineError::Transport(format!("session {} is closing", self.id)));
        }

        let format = format.unwrap_or(self.inbound_format);
        format.validate()?;

        let analysis = self.config.analysis_format;
        let converted = if format == analysis {
            if pcm.len() % 2 != 0 {
                return Err(EngineError::InvalidAudio(format!("odd frame length {}", pcm.len())));
            }
            pcm.to_vec()
        } else {
            let samples = bytes_to_samples(pcm)?;
            let mut resampler = self.resampler.lock().unwrap_or_else(PoisonError::into_inner);
            // A different inbound format starts a new stream
            if resampler.as_ref().map_or(false, |r| r.source() != format) {
                *resampler = None;
            }
            let converted = resampler
                .get_or_insert_with(|| StreamResampler::new(format, analysis))
                .process(&samples);
            samples_to_bytes(&converted)
        };

        let queued = converted.len();
        if !self.inbound.push(converted) {
            return Err(EngineError::Transport(format!("session {} is closing", self.id)));
        }

        self.perf_mut().inbound_bytes += pcm.len() as u64;
        Ok(queued)
    }

    /// Merge control-channel fields into the session metadata.
    ///
    /// ## Returns:
    /// Complete metadata once every required key has been seen
    pub fn apply_metadata(&self, pairs: &[(String, String)]) -> Option<SessionMetadata> {
        let mut builder = self.metadata.lock().unwrap_or_else(PoisonError::into_inner);
        builder.apply(pairs);
        builder.build()
    }

    pub fn metadata(&self) -> Option<SessionMetadata> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .build()
    }

    pub fn missing_metadata(&self) -> Vec<&'static str> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .missing()
    }

    pub fn segmenter_running(&self) -> bool {
        self.worker_slot().is_some()
    }

    /// Start the segmenter worker thread.
    ///
    /// ## Returns:
    /// - **Ok(false)**: the worker was already running
    pub fn start_segmenter(
        &self,
        enhancer: Arc<dyn Enhancer>,
        transcriber: Arc<dyn Transcriber>,
        flush: Arc<dyn FlushHandler>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<bool> {
        if !self.is_live() {
            return Err(EngineError::Transport(format!("session {} is closing", self.id)));
        }

        let mut slot = self.worker_slot();
        if slot.is_some() {
            return Ok(false);
        }

        let dispatcher = TranscriptionDispatcher::new(
            self.id.clone(),
            self.config.analysis_format.sample_rate,
            transcriber,
            flush,
        );
        let segmenter = UtteranceSegmenter::new(self.config.segmenter.clone(), enhancer, dispatcher, clock);

        let worker = SegmenterWorker {
            session_id: self.id.clone(),
            inbound: self.inbound.clone(),
            stop: self.stop.clone(),
            performance: self.performance.clone(),
            chunk_bytes: self.config.chunk_samples * 2,
        };

        let short_id: String = self.id.chars().take(8).collect();
        let handle = std::thread::Builder::new()
            .name(format!("segmenter-{}", short_id))
            .spawn(move || worker.run(segmenter))
            .map_err(|e| EngineError::Transport(format!("failed to start segmenter: {}", e)))?;

        *slot = Some(handle);
        Ok(true)
    }

    pub fn record_reply(&self) {
        self.perf_mut().replies += 1;
    }

    pub fn record_error(&self) {
        self.perf_mut().error_count += 1;
    }

    /// Tear the session down. Idempotent; safe from any thread.
    ///
    /// ## Returns:
    /// - **true**: this call performed the teardown
    pub fn shutdown(&self) -> bool {
        {
            let mut state = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }

        self.stop.store(true, Ordering::Release);
        self.inbound.close();
        self.playback.close();
        self.peer.close();

        // Not joined: the worker may be inside a transcription or backend call.
        // It sees the closed queue on its next read and exits.
        drop(self.worker_slot().take());

        *self.lifecycle.write().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        info!(session_id = %self.id, "session closed");
        true
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            state: self.state(),
            connection_state: self.peer.connection_state(),
            name: self
                .metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .name()
                .map(str::to_string),
            created_at: self.created_at,
            segmenter_running: self.segmenter_running(),
            inbound_format: self.inbound_format,
            buffered_bytes: self.inbound.len(),
            pending_clips: self.playback.pending_clips(),
            playback_timestamp: self.playback.timestamp(),
            performance: self.performance_summary(),
        }
    }

    pub fn performance_summary(&self) -> SessionPerformanceSummary {
        let perf = self.performance.read().unwrap_or_else(PoisonError::into_inner);
        let duration = Utc::now().signed_duration_since(self.created_at);
        SessionPerformanceSummary {
            inbound_bytes: perf.inbound_bytes,
            utterances: perf.utterances,
            aborted_utterances: perf.aborted_utterances,
            voice_seconds: perf.voice_ms as f64 / 1000.0,
            average_transcription_time_ms: if perf.utterances > 0 {
                perf.total_transcription_ms / perf.utterances as u64
            } else {
                0
            },
            replies: perf.replies,
            error_count: perf.error_count,
            session_duration_seconds: duration.num_milliseconds() as f64 / 1000.0,
        }
    }

    fn perf_mut(&self) -> std::sync::RwLockWriteGuard<'_, SessionPerformance> {
        self.performance.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State moved onto the segmenter thread.
struct SegmenterWorker {
    session_id: String,
    inbound: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    performance: Arc<RwLock<SessionPerformance>>,
    chunk_bytes: usize,
}

impl SegmenterWorker {
    fn run(self, mut segmenter: UtteranceSegmenter) {
        info!(session_id = %self.session_id, chunk_bytes = self.chunk_bytes, "segmenter started");

        while !self.stop.load(Ordering::Acquire) {
            let Some(chunk) = self.inbound.read(self.chunk_bytes) else {
                break;
            };

            match segmenter.tick(&chunk) {
                Ok(TickOutcome::Flushed {
                    text,
                    voice_duration,
                    transcription_time,
                }) => {
                    let mut perf = self.performance.write().unwrap_or_else(PoisonError::into_inner);
                    perf.utterances += 1;
                    perf.voice_ms += voice_duration.as_millis() as u64;
                    perf.total_transcription_ms += transcription_time.as_millis() as u64;
                    drop(perf);

                    info!(
                        session_id = %self.session_id,
                        voice_seconds = voice_duration.as_secs_f64(),
                        chars = text.len(),
                        "utterance flushed"
                    );
                }
                Ok(outcome) => {
                    debug!(session_id = %self.session_id, ?outcome, "tick");
                }
                Err(err) => {
                    let mut perf = self.performance.write().unwrap_or_else(PoisonError::into_inner);
                    perf.aborted_utterances += 1;
                    perf.error_count += 1;
                    drop(perf);

                    warn!(session_id = %self.session_id, error = %err, "utterance aborted");
                }
            }
        }

        info!(session_id = %self.session_id, "segmenter stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::enhance::Passthrough;
    use crate::audio::segmenter::SystemClock;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Records what the session sends over the control channel.
    pub(crate) struct FakePeer {
        pub(crate) state: Mutex<ConnectionState>,
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) closes: AtomicUsize,
    }

    impl FakePeer {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(ConnectionState::New),
                sent: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn set_state(&self, state: ConnectionState) {
            *self.state.lock().unwrap() = state;
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl PeerConnection for FakePeer {
        fn connection_state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn send_control(&self, message: &str) -> EngineResult<()> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Closed);
        }
    }

    struct Silent;

    impl Transcriber for Silent {
        fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> EngineResult<String> {
            Ok(String::new())
        }
    }

    struct Ignore;

    impl FlushHandler for Ignore {
        fn on_flush(&self, _session_id: &str, _text: &str) {}
    }

    fn session(peer: Arc<FakePeer>) -> VoiceSession {
        let config = SessionConfig::from_app_config(&AppConfig::default());
        VoiceSession::new("session-under-test".to_string(), peer, config, AudioFormat::mono(48000))
    }

    #[test]
    fn test_inbound_frames_are_downsampled() {
        let session = session(FakePeer::new());
        let frame = samples_to_bytes(&vec![500i16; 960]);

        let queued = session.accept_inbound(&frame, None).unwrap();
        assert_eq!(queued, 320 * 2);

        // Frame declares its own format
        let stereo_16k = samples_to_bytes(&vec![500i16; 640]);
        assert_eq!(
            session.accept_inbound(&stereo_16k, Some(AudioFormat::new(16000, 2))).unwrap(),
            320 * 2
        );
        assert_eq!(session.info().buffered_bytes, 1280);
        assert_eq!(session.performance_summary().inbound_bytes, (1920 + 1280) as u64);
    }

    #[test]
    fn test_odd_rate_frames_do_not_drift() {
        let session = session(FakePeer::new());
        let format = AudioFormat::mono(22050);
        let frame = samples_to_bytes(&vec![500i16; 512]);

        let queued: usize = (0..100)
            .map(|_| session.accept_inbound(&frame, Some(format)).unwrap())
            .sum();

        // 51200 samples at 22.05kHz are 37151.5 at 16kHz
        let samples = queued / 2;
        assert!((37151..=37152).contains(&samples), "{}", samples);
        assert_eq!(session.info().buffered_bytes, queued);
    }

    #[test]
    fn test_invalid_frames_are_rejected() {
        let session = session(FakePeer::new());
        assert!(matches!(
            session.accept_inbound(&[1, 2, 3], None),
            Err(EngineError::InvalidAudio(_))
        ));
        assert!(matches!(
            session.accept_inbound(&[0, 0], Some(AudioFormat::new(0, 1))),
            Err(EngineError::InvalidAudio(_))
        ));
    }

    #[test]
    fn test_lifecycle_and_idempotent_shutdown() {
        let peer = FakePeer::new();
        let session = session(peer.clone());
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(session.mark_active());
        assert!(!session.mark_active());
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.shutdown());
        assert!(!session.shutdown());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
        assert!(session.playback().is_closed());
        assert!(matches!(
            session.accept_inbound(&[0, 0], None),
            Err(EngineError::Transport(_))
        ));
    }

    #[test]
    fn test_segmenter_starts_once_and_stops_on_shutdown() {
        let session = session(FakePeer::new());
        let start = || {
            session.start_segmenter(Arc::new(Passthrough), Arc::new(Silent), Arc::new(Ignore), Arc::new(SystemClock))
        };
        assert!(start().unwrap());
        assert!(!start().unwrap());
        assert!(session.segmenter_running());

        let worker = session.worker_slot().take().unwrap();

        let begun = Instant::now();
        session.shutdown();
        worker.join().unwrap();
        // Worker notices the closed queue within one poll interval
        assert!(begun.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_metadata_gates_readiness() {
        let session = session(FakePeer::new());
        let pairs = |s: &str| crate::session::control::parse_control_message(s).unwrap();

        assert!(session.apply_metadata(&pairs("NAME>alice")).is_none());
        assert_eq!(session.missing_metadata().len(), 3);
        let metadata = session
            .apply_metadata(&pairs("PERSONALITY>warm GENDER>f SOURCEMATERIAL>faq"))
            .unwrap();
        assert_eq!(metadata.name, "alice");
        assert_eq!(session.info().name.as_deref(), Some("alice"));
    }
}
