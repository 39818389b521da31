//! # Transcription Engine
//!
//! The speech-to-text collaborator behind the dispatcher. The engine sees only
//! normalized float audio and returns raw text; trimming and routing belong to
//! the dispatcher.
//!
//! ## Key Components:
//! - **Transcriber trait**: synchronous `float pcm -> text`, shared by all sessions
//! - **HttpTranscriber**: OpenAI-compatible `/audio/transcriptions` client that uploads
//!   the utterance as a 16-bit WAV in a multipart form
//!
//! ## Why blocking HTTP:
//! Transcription runs on the session's segmenter thread, which is allowed to block
//! for as long as the model takes. Using the blocking client there keeps the
//! actix event loop free of long requests.

use crate::audio::convert::{encode_wav, float_to_pcm, AudioFormat};
use crate::config::TranscriptionSettings;
use crate::error::{EngineError, EngineResult};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Speech-to-text collaborator.
pub trait Transcriber: Send + Sync {
    /// Transcribe mono audio normalized to `[-1.0, 1.0]`.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> EngineResult<String>;
}

/// Response body of an OpenAI-compatible transcription endpoint.
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Remote transcription over HTTP.
///
/// ## Request:
/// `POST {endpoint}/audio/transcriptions` with multipart fields `file` (WAV),
/// `model`, and optionally `language`. A bearer token is sent when `api_key` is set.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    url: String,
    model: String,
    language: Option<String>,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpTranscriber {
    /// Build the client. Must be called outside of an async runtime.
    pub fn new(settings: &TranscriptionSettings) -> EngineResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("transcription client: {}", e)))?;

        Ok(Self {
            url: format!("{}/audio/transcriptions", settings.endpoint.trim_end_matches('/')),
            model: settings.model.clone(),
            language: non_empty(&settings.language),
            api_key: non_empty(&settings.api_key),
            client,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Transcriber for HttpTranscriber {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> EngineResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        let started = Instant::now();
        let wav = encode_wav(&float_to_pcm(samples), AudioFormat::mono(sample_rate))
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::Model(e.to_string()))?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| EngineError::Model(format!("transcription request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Model(format!(
                "transcription service returned {}: {}",
                status, body
            )));
        }

        let body: TranscriptionResponse = response
            .json()
            .map_err(|e| EngineError::Model(format!("invalid transcription response: {}", e)))?;

        debug!(
            samples = samples.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transcription completed"
        );
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_body_parsing() {
        let body: TranscriptionResponse = serde_json::from_str(r#"{"text": " hello "}"#).unwrap();
        assert_eq!(body.text, " hello ");

        let empty: TranscriptionResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.text.is_empty());
    }

    #[test]
    fn test_optional_fields() {
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty(" en "), Some("en".to_string()));
    }
}
