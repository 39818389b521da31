//! # Audio Module
//!
//! The real-time audio path of a voice session, leaves first.
//!
//! ## Key Components:
//! - **Frame Queue**: push-style frame arrival to pull-style fixed-size reads
//! - **Detector**: RMS energy gate
//! - **Convert**: PCM/float/WAV conversions, channel mixing and resampling
//! - **Enhance**: the noise-suppression collaborator and its DSP implementation
//! - **Segmenter**: decides when buffered speech is a complete utterance
//! - **Playback**: paces reply clips back out as fixed-size frames
//!
//! ## Audio Formats:
//! - **Analysis**: 16kHz mono 16-bit little-endian PCM
//! - **Inbound**: whatever the transport declares, converted to the analysis format
//! - **Outbound**: configurable rate and channel count, 16-bit PCM

pub mod convert;
pub mod detector;
pub mod enhance;
pub mod frame_queue;
pub mod playback;
pub mod segmenter;
