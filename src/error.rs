//! Tunnel Error types
//!
//! Errors returned by the session registry and the forwarding layer.
//! Transport failures are wrapped unchanged.

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} already has an active forwarding rule")]
    ForwardingActive(String),

    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Accept failed: {0}")]
    Accept(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
