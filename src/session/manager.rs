//! # Session Manager
//!
//! Owns every live voice session and is the only way the transport adapter
//! talks to the engine. Each transport callback maps to one method here:
//!
//! - **on_offer**: a new caller; creates the session and returns the answer
//! - **on_connection_state_change**: activates or tears down the session
//! - **on_inbound_frame**: queues caller audio, never blocks
//! - **on_control_message**: collects metadata and starts the segmenter
//! - **on_flush**: backend round trip for a finished utterance (segmenter thread)
//! - **reap** / **on_close**: teardown
//!
//! ## Locking:
//! The session map sits behind a `RwLock`. Every method clones the `Arc`s it
//! needs and releases the lock before doing real work, so a slow backend call
//! never holds the map and teardown never waits on a flush.

use crate::audio::convert::AudioFormat;
use crate::audio::enhance::Enhancer;
use crate::audio::playback::{PlaybackScheduler, ResponseClip};
use crate::audio::segmenter::{Clock, SystemClock};
use crate::config::{AppConfig, FanoutPolicy};
use crate::error::{EngineError, EngineResult};
use crate::session::backend::ResponseBackend;
use crate::session::control::{parse_control_message, TRANSCRIBER_WARMED_UP};
use crate::session::peer::{ConnectionState, PeerConnection};
use crate::session::voice::{SessionConfig, SessionInfo, VoiceSession};
use crate::transcription::{FlushHandler, Transcriber};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External services shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub enhancer: Arc<dyn Enhancer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub backend: Arc<dyn ResponseBackend>,
}

/// What the transport knows about the caller's audio when it connects.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SessionOffer {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Negotiated session parameters returned to the transport.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAnswer {
    pub session_id: String,
    pub inbound_format: AudioFormat,
    pub analysis_format: AudioFormat,
    pub output_format: AudioFormat,
    pub frame_duration_ms: u32,
}

/// Result of a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Fields recorded, some required keys still missing
    AwaitingMetadata { missing: Vec<&'static str> },
    /// Metadata complete, segmenter started
    Started,
    /// Metadata updated on a session whose segmenter already runs
    Updated,
}

#[derive(Debug, Default)]
struct EngineCounters {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_rejected: AtomicU64,
    flushes: AtomicU64,
    empty_flushes: AtomicU64,
    replies_delivered: AtomicU64,
    backend_failures: AtomicU64,
    protocol_errors: AtomicU64,
    /// Aborted utterances of sessions that no longer exist
    retired_model_failures: AtomicU64,
}

/// Engine-wide counters plus the current session census.
#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerSummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
    pub total_inbound_bytes: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_rejected: u64,
    pub flushes: u64,
    pub empty_flushes: u64,
    pub replies_delivered: u64,
    pub backend_failures: u64,
    pub model_failures: u64,
    pub protocol_errors: u64,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<VoiceSession>>>,
    settings: RwLock<AppConfig>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    counters: EngineCounters,
}

/// Cheap-to-clone handle to the session set.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.active_count())
            .finish()
    }
}

impl SessionManager {
    pub fn new(settings: AppConfig, collaborators: Collaborators) -> Self {
        Self::with_clock(settings, collaborators, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: AppConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                settings: RwLock::new(settings),
                collaborators,
                clock,
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Register a new caller.
    ///
    /// ## Returns:
    /// - **Err(SessionLimit)**: `max_concurrent_sessions` are already live
    /// - **Err(InvalidAudio)**: the offer declared a zero rate or channel count
    pub fn on_offer(&self, offer: SessionOffer, peer: Arc<dyn PeerConnection>) -> EngineResult<SessionAnswer> {
        let settings = self.settings();
        let inbound_format = AudioFormat::new(
            offer.sample_rate.unwrap_or(settings.audio.inbound_sample_rate),
            offer.channels.unwrap_or(settings.audio.inbound_channels),
        );
        inbound_format.validate()?;

        let config = SessionConfig::from_app_config(&settings);
        let session_id = Uuid::new_v4().to_string();

        let answer = SessionAnswer {
            session_id: session_id.clone(),
            inbound_format,
            analysis_format: config.analysis_format,
            output_format: config.output_format,
            frame_duration_ms: config.frame_duration_ms,
        };

        {
            let mut sessions = self.sessions_mut();
            let max = settings.sessions.max_concurrent_sessions;
            if sessions.len() >= max {
                self.inner.counters.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::SessionLimit(max));
            }
            let session = VoiceSession::new(session_id.clone(), peer, config, inbound_format);
            sessions.insert(session_id.clone(), Arc::new(session));
        }

        self.inner.counters.sessions_created.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %session_id,
            inbound_rate = inbound_format.sample_rate,
            inbound_channels = inbound_format.channels,
            "session negotiated"
        );
        Ok(answer)
    }

    /// React to a transport state change.
    pub fn on_connection_state_change(&self, session_id: &str, state: ConnectionState) -> EngineResult<()> {
        let session = self.require(session_id)?;

        if state == ConnectionState::Connected {
            if session.mark_active() {
                info!(session_id = %session_id, "session active");
            }
        } else if state.is_terminal() {
            info!(session_id = %session_id, ?state, "transport ended");
            self.on_close(session_id);
        } else {
            debug!(session_id = %session_id, ?state, "transport state changed");
        }
        Ok(())
    }

    /// Queue one inbound frame. `format` overrides the format from the offer.
    pub fn on_inbound_frame(&self, session_id: &str, pcm: &[u8], format: Option<AudioFormat>) -> EngineResult<usize> {
        self.require(session_id)?.accept_inbound(pcm, format)
    }

    /// Apply a control-channel message.
    ///
    /// ## Returns:
    /// - **Err(Protocol)**: no `KEY>` marker; the session keeps waiting for metadata
    pub fn on_control_message(&self, session_id: &str, message: &str) -> EngineResult<ControlOutcome> {
        let session = self.require(session_id)?;

        let pairs = match parse_control_message(message) {
            Ok(pairs) => pairs,
            Err(err) => {
                self.inner.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %session_id, error = %err, "ignoring control message");
                return Err(err);
            }
        };

        let Some(metadata) = session.apply_metadata(&pairs) else {
            let missing = session.missing_metadata();
            debug!(session_id = %session_id, ?missing, "awaiting metadata");
            return Ok(ControlOutcome::AwaitingMetadata { missing });
        };

        let collaborators = &self.inner.collaborators;
        let route = Arc::new(FlushRoute {
            manager: Arc::downgrade(&self.inner),
        });
        let started = session.start_segmenter(
            collaborators.enhancer.clone(),
            collaborators.transcriber.clone(),
            route,
            self.inner.clock.clone(),
        )?;

        if !started {
            return Ok(ControlOutcome::Updated);
        }

        info!(session_id = %session_id, user = %metadata.name, "metadata complete, segmenter running");
        if let Err(err) = session.peer().send_control(TRANSCRIBER_WARMED_UP) {
            warn!(session_id = %session_id, error = %err, "failed to send warm-up notice");
        }
        Ok(ControlOutcome::Started)
    }

    /// Backend round trip for one transcribed utterance.
    ///
    /// Runs on the originating session's segmenter thread. No manager lock is
    /// held while the backend is called, and delivery re-checks that each target
    /// is still live, so a session closed mid-flight receives nothing.
    ///
    /// ## Returns:
    /// The number of sessions the reply was delivered to
    pub fn on_flush(&self, session_id: &str, text: &str) -> EngineResult<usize> {
        let counters = &self.inner.counters;
        if text.is_empty() {
            counters.empty_flushes.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %session_id, "empty transcription suppressed");
            return Ok(0);
        }

        let session = self.require(session_id)?;
        if !session.is_live() {
            return Ok(0);
        }
        let metadata = session
            .metadata()
            .ok_or_else(|| EngineError::Protocol(format!("session {} has no metadata", session_id)))?;

        counters.flushes.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %session_id, prompt = %text, "forwarding utterance to backend");

        let reply = match self.inner.collaborators.backend.respond(text, &metadata) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(0),
            Err(err) => return Err(self.backend_failure(&session, err)),
        };

        let clip = match reply
            .decode_audio()
            .and_then(|wav| ResponseClip::from_wav(&wav).map_err(|e| EngineError::Backend(e.to_string())))
        {
            Ok(clip) => clip,
            Err(err) => return Err(self.backend_failure(&session, err)),
        };

        let fanout = session.config().fanout;
        let targets = match fanout {
            FanoutPolicy::Originator => vec![session],
            FanoutPolicy::Broadcast => self.sessions().values().cloned().collect(),
        };

        let from_user = format!("FROMUSER>{}", reply.responding_to);
        let from_bot = format!("FROMBOT>{}AUDIO>{}", reply.response, reply.audio);

        let mut delivered = 0;
        for target in targets {
            if !target.is_live() || !target.playback().enqueue(clip.clone()) {
                continue;
            }
            for message in [&from_user, &from_bot] {
                if let Err(err) = target.peer().send_control(message) {
                    warn!(session_id = %target.id(), error = %err, "failed to echo reply");
                }
            }
            target.record_reply();
            delivered += 1;
        }

        counters.replies_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        info!(
            session_id = %session_id,
            delivered,
            clip_seconds = clip.duration().as_secs_f64(),
            "reply queued for playback"
        );
        Ok(delivered)
    }

    fn backend_failure(&self, session: &VoiceSession, err: EngineError) -> EngineError {
        self.inner.counters.backend_failures.fetch_add(1, Ordering::Relaxed);
        session.record_error();
        warn!(session_id = %session.id(), error = %err, "backend round trip failed, utterance dropped");
        err
    }

    /// Remove sessions whose transport reached a terminal state.
    ///
    /// ## Returns:
    /// Number of sessions torn down
    pub fn reap(&self) -> usize {
        let dead: Vec<String> = self
            .sessions()
            .values()
            .filter(|session| session.peer().connection_state().is_terminal() || !session.is_live())
            .map(|session| session.id().to_string())
            .collect();

        let reaped = dead.iter().filter(|id| self.on_close(id)).count();
        if reaped > 0 {
            info!(reaped, remaining = self.active_count(), "reaped dead sessions");
        }
        reaped
    }

    /// Stop and forget a session. Idempotent.
    ///
    /// ## Returns:
    /// - **true**: the session was live in the set and has been removed
    pub fn on_close(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions_mut().remove(session_id) else {
            return false;
        };
        self.retire(&session);
        true
    }

    /// Close every session. Used on server shutdown.
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<Arc<VoiceSession>> = self.sessions_mut().drain().map(|(_, s)| s).collect();
        for session in &drained {
            self.retire(session);
        }
        drained.len()
    }

    fn retire(&self, session: &VoiceSession) {
        session.shutdown();
        let counters = &self.inner.counters;
        counters.sessions_closed.fetch_add(1, Ordering::Relaxed);
        counters
            .retired_model_failures
            .fetch_add(session.performance_summary().aborted_utterances as u64, Ordering::Relaxed);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions().get(session_id).cloned()
    }

    pub fn playback(&self, session_id: &str) -> Option<Arc<PlaybackScheduler>> {
        self.get(session_id).map(|s| s.playback().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<VoiceSession>> = self.sessions().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn summary(&self) -> SessionManagerSummary {
        let infos = self.list_sessions();
        let counters = &self.inner.counters;

        let mut state_counts = HashMap::new();
        let mut total_inbound_bytes = 0;
        let mut live_model_failures = 0u64;
        for info in &infos {
            *state_counts.entry(info.state.as_str().to_string()).or_insert(0) += 1;
            total_inbound_bytes += info.performance.inbound_bytes;
            live_model_failures += info.performance.aborted_utterances as u64;
        }

        SessionManagerSummary {
            active_sessions: infos.len(),
            max_sessions: self.settings().sessions.max_concurrent_sessions,
            state_counts,
            total_inbound_bytes,
            sessions_created: counters.sessions_created.load(Ordering::Relaxed),
            sessions_closed: counters.sessions_closed.load(Ordering::Relaxed),
            sessions_rejected: counters.sessions_rejected.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            empty_flushes: counters.empty_flushes.load(Ordering::Relaxed),
            replies_delivered: counters.replies_delivered.load(Ordering::Relaxed),
            backend_failures: counters.backend_failures.load(Ordering::Relaxed),
            model_failures: counters.retired_model_failures.load(Ordering::Relaxed) + live_model_failures,
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Settings used for sessions created from now on.
    pub fn settings(&self) -> AppConfig {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_settings(&self, settings: AppConfig) {
        *self.inner.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn require(&self, session_id: &str) -> EngineResult<Arc<VoiceSession>> {
        self.get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn sessions(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<VoiceSession>>> {
        self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<VoiceSession>>> {
        self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes a session's flushes back into the manager.
///
/// Holds a weak reference so a running segmenter thread does not keep the
/// manager alive after shutdown.
struct FlushRoute {
    manager: Weak<ManagerInner>,
}

impl FlushHandler for FlushRoute {
    fn on_flush(&self, session_id: &str, text: &str) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        // Failures are already logged and counted inside on_flush
        let _ = SessionManager { inner }.on_flush(session_id, text);
    }
}
