//! # Configuration Management
//!
//! This module loads the application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_SEGMENTER__RECORD_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **audio**: analysis format and inbound defaults
//! - **segmenter**: utterance detection thresholds and timings
//! - **playback**: outbound frame format
//! - **sessions**: capacity, reaper cadence, fan-out policy
//! - **enhancement / transcription / backend**: collaborator settings

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each collaborator and engine stage owns one section, so a section can be
/// handed to the component that uses it without dragging the rest along.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub segmenter: SegmenterSettings,
    pub playback: PlaybackSettings,
    pub sessions: SessionSettings,
    pub enhancement: EnhancementSettings,
    pub transcription: TranscriptionSettings,
    pub backend: BackendSettings,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Inbound and analysis audio format.
///
/// Inbound frames are converted to `analysis_sample_rate` mono before they reach
/// the segmenter. `inbound_sample_rate` / `inbound_channels` are the defaults used
/// when a transport does not declare its own format in the offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub analysis_sample_rate: u32,
    /// Samples per segmenter tick (4096 at 16 kHz is 256 ms).
    pub chunk_samples: usize,
    pub inbound_sample_rate: u32,
    pub inbound_channels: u16,
    /// How often a blocked bridge read re-checks for shutdown.
    pub poll_interval_ms: u64,
}

/// Utterance segmentation thresholds.
///
/// ## Fields:
/// - `energy_threshold`: RMS above which a chunk counts as loud
/// - `record_timeout_secs`: audio kept after the last loud chunk, and the size at which
///   the loud buffer is drained for a voice check
/// - `silence_flush_secs`: quiet time after which the environment counts as silent
/// - `max_recording_secs`: confirmed voice length that forces a flush
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterSettings {
    pub energy_threshold: f64,
    pub record_timeout_secs: f64,
    pub silence_flush_secs: f64,
    pub max_recording_secs: f64,
}

/// Outbound audio format produced by the playback scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

/// Where backend replies are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutPolicy {
    /// Only the session whose utterance produced the reply.
    Originator,
    /// Every live session.
    Broadcast,
}

/// Session capacity and housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub max_concurrent_sessions: usize,
    pub reaper_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub fanout: FanoutPolicy,
}

/// Settings for the built-in DSP enhancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementSettings {
    pub enabled: bool,
    /// Blocks quieter than this multiple of the estimated noise floor are muted.
    pub noise_gate_ratio: f64,
    /// Output peaks above this are scaled down; quieter audio is never boosted.
    pub peak_ceiling: i16,
    /// Apply the 3-point smoothing filter.
    pub smoothing: bool,
}

/// OpenAI-compatible speech-to-text service.
///
/// Empty `api_key` or `language` means "not sent".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub endpoint: String,
    pub model: String,
    pub language: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

/// HTTP backend that turns transcribed text into a spoken reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioSettings {
                analysis_sample_rate: 16000,
                chunk_samples: 4096,
                inbound_sample_rate: 48000,
                inbound_channels: 1,
                poll_interval_ms: 100,
            },
            segmenter: SegmenterSettings {
                energy_threshold: 200.0,
                record_timeout_secs: 3.0,
                silence_flush_secs: 4.0,
                max_recording_secs: 30.0,
            },
            playback: PlaybackSettings {
                sample_rate: 48000,
                channels: 1,
                frame_duration_ms: 20,
            },
            sessions: SessionSettings {
                max_concurrent_sessions: 10,
                reaper_interval_secs: 10,
                heartbeat_timeout_secs: 60,
                fanout: FanoutPolicy::Originator,
            },
            enhancement: EnhancementSettings {
                enabled: true,
                noise_gate_ratio: 2.0,
                peak_ceiling: 28000,
                smoothing: true,
            },
            transcription: TranscriptionSettings {
                endpoint: "http://127.0.0.1:9000/v1".to_string(),
                model: "whisper-1".to_string(),
                language: "en".to_string(),
                api_key: String::new(),
                timeout_secs: 60,
            },
            backend: BackendSettings {
                endpoint: "http://127.0.0.1:5000/voice".to_string(),
                timeout_secs: 360,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_SEGMENTER__SILENCE_FLUSH_SECS=2.5`
    /// - `APP_SESSIONS__FANOUT=broadcast`
    /// - `HOST=0.0.0.0` / `PORT=3000`: deployment platform overrides
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Nested keys contain underscores themselves, so sections are split on `__`
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rates, chunk size and session limit are non-zero
    /// - Timing thresholds are positive
    /// - The playback frame duration yields a whole number of samples
    /// - The noise gate ratio is at least 1 and the peak ceiling positive
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.analysis_sample_rate == 0 || self.audio.inbound_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.inbound_channels == 0 || self.playback.channels == 0 {
            return Err(anyhow::anyhow!("Channel counts must be greater than 0"));
        }

        if self.audio.chunk_samples == 0 {
            return Err(anyhow::anyhow!("Segmenter chunk size must be greater than 0"));
        }

        if self.audio.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Bridge poll interval must be greater than 0"));
        }

        let seg = &self.segmenter;
        if seg.record_timeout_secs <= 0.0
            || seg.silence_flush_secs <= 0.0
            || seg.max_recording_secs <= 0.0
        {
            return Err(anyhow::anyhow!("Segmenter timings must be positive"));
        }

        if seg.energy_threshold < 0.0 {
            return Err(anyhow::anyhow!("Energy threshold cannot be negative"));
        }

        if self.playback.sample_rate == 0 || self.playback.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Playback sample rate and frame duration must be greater than 0"));
        }

        if (self.playback.sample_rate as u64 * self.playback.frame_duration_ms as u64) % 1000 != 0 {
            return Err(anyhow::anyhow!(
                "Playback frame of {}ms at {}Hz is not a whole number of samples",
                self.playback.frame_duration_ms,
                self.playback.sample_rate
            ));
        }

        if self.enhancement.noise_gate_ratio < 1.0 || self.enhancement.peak_ceiling <= 0 {
            return Err(anyhow::anyhow!(
                "Enhancement noise gate ratio must be at least 1 and the peak ceiling positive"
            ));
        }

        if self.sessions.reaper_interval_secs == 0 {
            return Err(anyhow::anyhow!("Reaper interval must be greater than 0"));
        }

        if self.backend.timeout_secs == 0 || self.transcription.timeout_secs == 0 {
            return Err(anyhow::anyhow!("HTTP timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial runtime update from JSON.
    ///
    /// Only the segmenter thresholds and the fan-out policy can change at runtime;
    /// they take effect for sessions created after the update. Anything else in the
    /// document is ignored.
    ///
    /// ## Example:
    /// `{"segmenter": {"silence_flush_secs": 2.0}, "sessions": {"fanout": "broadcast"}}`
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(segmenter) = partial_config.get("segmenter") {
            if let Some(v) = segmenter.get("energy_threshold").and_then(|v| v.as_f64()) {
                self.segmenter.energy_threshold = v;
            }
            if let Some(v) = segmenter.get("record_timeout_secs").and_then(|v| v.as_f64()) {
                self.segmenter.record_timeout_secs = v;
            }
            if let Some(v) = segmenter.get("silence_flush_secs").and_then(|v| v.as_f64()) {
                self.segmenter.silence_flush_secs = v;
            }
            if let Some(v) = segmenter.get("max_recording_secs").and_then(|v| v.as_f64()) {
                self.segmenter.max_recording_secs = v;
            }
        }

        if let Some(fanout) = partial_config
            .get("sessions")
            .and_then(|s| s.get("fanout"))
        {
            self.sessions.fanout = serde_json::from_value(fanout.clone())?;
        }

        self.validate()?;
        Ok(())
    }
}

impl SegmenterSettings {
    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.record_timeout_secs)
    }

    pub fn silence_flush(&self) -> Duration {
        Duration::from_secs_f64(self.silence_flush_secs)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs_f64(self.max_recording_secs)
    }
}

impl PlaybackSettings {
    /// Samples per channel in one outbound frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }
}
