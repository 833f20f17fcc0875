//! Session state machine

use serde::{Deserialize, Serialize};

/// Lifecycle of a tunnel session
///
/// ```text
/// Connecting -> Connected -> Forwarding
///      \             \           \
///       +-------------+-----------+--> Terminated
/// ```
///
/// `Terminated` is final: a session is never revived, its identifier is
/// simply free for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport handshake in progress
    Connecting,
    /// Transport up, no forwarding rule yet
    Connected,
    /// Forwarding socket accepting connections
    Forwarding,
    /// Torn down
    Terminated,
}

impl SessionState {
    /// Check if a transition to `next` is allowed
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Forwarding)
                | (Connecting, Terminated)
                | (Connected, Terminated)
                | (Forwarding, Terminated)
        )
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}
