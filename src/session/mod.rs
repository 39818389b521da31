//! # Session Module
//!
//! Per-caller session state and the manager that owns it.
//!
//! ## Key Components:
//! - **Peer**: the transport handle each session holds
//! - **Control**: `KEY>value` control-channel parsing and session metadata
//! - **Backend**: the collaborator that answers transcribed utterances
//! - **Voice**: one session's queue, segmenter worker and playback scheduler
//! - **Manager**: the active-session set and every transport entry point

pub mod backend;
pub mod control;
pub mod manager;
pub mod peer;
pub mod voice;

pub use backend::{HttpBackend, ResponseBackend};
pub use manager::{Collaborators, SessionManager, SessionOffer};
pub use peer::{ConnectionState, PeerConnection};
