//! # Transcription Module
//!
//! Speech-to-text for finished utterances.
//!
//! ## Key Components:
//! - **Engine**: the `Transcriber` collaborator and its HTTP implementation
//! - **Dispatcher**: per-session glue that normalizes audio, calls the engine,
//!   trims the result and hands it to a `FlushHandler`

pub mod dispatcher;
pub mod engine;

pub use dispatcher::{FlushHandler, TranscriptionDispatcher};
pub use engine::{HttpTranscriber, Transcriber};
