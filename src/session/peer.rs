//! Transport-side view of a session's connection.

use crate::error::EngineResult;
use serde::Serialize;

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States the reaper tears sessions down for.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// The transport handle a session holds.
///
/// Implementations must be cheap and non-blocking: every method may be called
/// from the segmenter thread, the reaper task and the transport's event loop.
pub trait PeerConnection: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// Send a text message on the control channel.
    fn send_control(&self, message: &str) -> EngineResult<()>;

    /// Ask the transport to close the connection. Idempotent.
    fn close(&self);
}
