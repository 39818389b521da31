//! # Response Backend
//!
//! Turns a transcribed utterance plus session metadata into a reply: response
//! text, the user text it answers, and the reply audio.
//!
//! ## HTTP Contract:
//! - **Request**: `POST {endpoint}` with JSON `{prompt, userId, personality, gender, sourceMaterial}`
//! - **204**: the bot chose not to respond
//! - **2xx**: JSON `{response, respondingTo, audio}`, `audio` being base64 WAV
//! - **anything else**: a backend error; the core does not retry

use crate::config::BackendSettings;
use crate::error::{EngineError, EngineResult};
use crate::session::control::SessionMetadata;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Reply produced for one utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReply {
    pub response: String,
    #[serde(rename = "respondingTo")]
    pub responding_to: String,
    /// Base64 encoded WAV
    pub audio: String,
}

impl BackendReply {
    pub fn decode_audio(&self) -> EngineResult<Vec<u8>> {
        STANDARD
            .decode(self.audio.trim())
            .map_err(|e| EngineError::Backend(format!("reply audio is not valid base64: {}", e)))
    }
}

/// Response-generation collaborator.
pub trait ResponseBackend: Send + Sync {
    /// ## Returns:
    /// - **Ok(None)**: the backend deliberately produced no reply
    fn respond(&self, prompt: &str, metadata: &SessionMetadata) -> EngineResult<Option<BackendReply>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendRequest<'a> {
    prompt: &'a str,
    user_id: &'a str,
    personality: &'a str,
    gender: &'a str,
    source_material: &'a str,
}

impl<'a> BackendRequest<'a> {
    fn new(prompt: &'a str, metadata: &'a SessionMetadata) -> Self {
        Self {
            prompt,
            user_id: &metadata.name,
            personality: &metadata.personality,
            gender: &metadata.gender,
            source_material: &metadata.source_material,
        }
    }
}

/// Blocking JSON client for the response backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    /// Build the client. Must be called outside of an async runtime.
    pub fn new(settings: &BackendSettings) -> EngineResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("backend client: {}", e)))?;

        Ok(Self {
            endpoint: settings.endpoint.clone(),
            client,
        })
    }
}

impl ResponseBackend for HttpBackend {
    fn respond(&self, prompt: &str, metadata: &SessionMetadata) -> EngineResult<Option<BackendReply>> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "*/*")
            .json(&BackendRequest::new(prompt, metadata))
            .send()
            .map_err(|e| EngineError::Backend(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            debug!(user = %metadata.name, "backend chose not to respond");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Backend(format!("backend returned {}: {}", status, body)));
        }

        let reply: BackendReply = response
            .json()
            .map_err(|e| EngineError::Backend(format!("invalid backend response: {}", e)))?;

        debug!(
            user = %metadata.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backend replied"
        );
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            name: "alice".to_string(),
            personality: "cheerful".to_string(),
            gender: "female".to_string(),
            source_material: "notes".to_string(),
        }
    }

    #[test]
    fn test_request_body_uses_backend_field_names() {
        let metadata = metadata();
        let body = serde_json::to_value(BackendRequest::new("hi there", &metadata)).unwrap();
        assert_eq!(body["prompt"], "hi there");
        assert_eq!(body["userId"], "alice");
        assert_eq!(body["sourceMaterial"], "notes");
        assert_eq!(body["personality"], "cheerful");
    }

    #[test]
    fn test_reply_parsing_and_audio_decoding() {
        let reply: BackendReply = serde_json::from_str(
            r#"{"response":"hello","respondingTo":"hi","audio":"UklGRg=="}"#,
        )
        .unwrap();
        assert_eq!(reply.responding_to, "hi");
        assert_eq!(reply.decode_audio().unwrap(), b"RIFF".to_vec());
    }

    #[test]
    fn test_bad_audio_is_backend_error() {
        let reply = BackendReply {
            response: "x".to_string(),
            responding_to: "y".to_string(),
            audio: "not base64!".to_string(),
        };
        assert!(matches!(reply.decode_audio(), Err(EngineError::Backend(_))));
    }
}
