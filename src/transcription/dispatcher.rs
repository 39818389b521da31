//! Hands a finished utterance to the transcriber and routes the text onward.

use crate::audio::convert::{bytes_to_samples, pcm_to_float};
use crate::error::EngineResult;
use crate::transcription::engine::Transcriber;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Receives the text of every flushed utterance.
///
/// Called on the session's segmenter thread, so an implementation may block
/// (the backend round trip happens here). Empty text is delivered too.
pub trait FlushHandler: Send + Sync {
    fn on_flush(&self, session_id: &str, text: &str);
}

/// Per-session bridge between the segmenter and the transcription service.
pub struct TranscriptionDispatcher {
    session_id: String,
    sample_rate: u32,
    transcriber: Arc<dyn Transcriber>,
    handler: Arc<dyn FlushHandler>,
}

impl TranscriptionDispatcher {
    pub fn new(
        session_id: impl Into<String>,
        sample_rate: u32,
        transcriber: Arc<dyn Transcriber>,
        handler: Arc<dyn FlushHandler>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sample_rate,
            transcriber,
            handler,
        }
    }

    /// Transcribe 16-bit PCM and pass the trimmed text to the flush handler.
    ///
    /// ## Returns:
    /// - **Ok(text)**: trimmed transcription, possibly empty
    /// - **Err**: the transcriber failed; the handler is not called
    pub fn dispatch(&self, pcm: &[u8]) -> EngineResult<String> {
        let samples = pcm_to_float(&bytes_to_samples(pcm)?);
        let started = Instant::now();

        let text = self
            .transcriber
            .transcribe(&samples, self.sample_rate)?
            .trim()
            .to_string();

        debug!(
            session_id = %self.session_id,
            audio_seconds = samples.len() as f64 / self.sample_rate as f64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "utterance transcribed"
        );

        self.handler.on_flush(&self.session_id, &text);
        Ok(text)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::Mutex;

    struct Canned(&'static str);

    impl Transcriber for Canned {
        fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> EngineResult<String> {
            assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    impl Transcriber for Failing {
        fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> EngineResult<String> {
            Err(EngineError::Model("model offline".to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    impl FlushHandler for Recorder {
        fn on_flush(&self, session_id: &str, text: &str) {
            self.0.lock().unwrap().push((session_id.to_string(), text.to_string()));
        }
    }

    fn loud_pcm() -> Vec<u8> {
        [i16::MIN, i16::MAX, 0, 1000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_dispatch_trims_and_notifies() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = TranscriptionDispatcher::new(
            "s1",
            16000,
            Arc::new(Canned("  hello there \n")),
            recorder.clone(),
        );

        assert_eq!(dispatcher.dispatch(&loud_pcm()).unwrap(), "hello there");
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![("s1".to_string(), "hello there".to_string())]
        );
    }

    #[test]
    fn test_empty_text_still_reaches_handler() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher =
            TranscriptionDispatcher::new("s2", 16000, Arc::new(Canned("   ")), recorder.clone());

        assert_eq!(dispatcher.dispatch(&loud_pcm()).unwrap(), "");
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_model_failure_skips_handler() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = TranscriptionDispatcher::new("s3", 16000, Arc::new(Failing), recorder.clone());

        assert!(matches!(dispatcher.dispatch(&loud_pcm()), Err(EngineError::Model(_))));
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
