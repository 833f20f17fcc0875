//! Session types

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::events::{EventSink, SessionEvents};
use super::state::SessionState;
use crate::error::TunnelError;
use crate::forwarding::{ForwardRule, ForwardStats, ForwardingSocket};
use crate::ssh::{SshError, SshTarget, Transport};

/// One SSH login plus at most one forwarding rule
///
/// The transport and forwarding socket are installed once and taken out
/// once, under the session's own lock, which is never held across an await.
pub struct Session {
    id: String,
    host: String,
    port: u16,
    username: String,
    created_at: DateTime<Utc>,
    events: SessionEvents,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    transport: Option<Arc<dyn Transport>>,
    forward: Option<ForwardingSocket>,
}

/// Session snapshot for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub forward: Option<ForwardRule>,
    /// Actual listening address when forwarding
    pub local_addr: Option<String>,
    /// Connection and byte counters when forwarding
    pub stats: Option<ForwardStats>,
    pub created_at: String,
}

impl Session {
    /// New session in `Connecting` state
    pub fn new(id: impl Into<String>, target: &SshTarget, sink: Arc<dyn EventSink>) -> Self {
        let id = id.into();
        Self {
            events: SessionEvents::new(id.clone(), sink),
            id,
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                transport: None,
                forward: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The connected transport, if any
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.lock().transport.clone()
    }

    /// Install the freshly connected transport
    ///
    /// Hands the transport back if the session was stopped while connecting;
    /// the caller owns closing it.
    pub fn attach_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), Arc<dyn Transport>> {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(SessionState::Connected) {
            return Err(transport);
        }
        inner.state = SessionState::Connected;
        inner.transport = Some(transport);
        Ok(())
    }

    /// Transport to forward through, checking the session can take a rule
    pub fn forwarding_transport(&self) -> Result<Arc<dyn Transport>, TunnelError> {
        let inner = self.inner.lock();
        match inner.state {
            SessionState::Terminated => Err(TunnelError::SessionNotFound(self.id.clone())),
            SessionState::Forwarding => Err(TunnelError::ForwardingActive(self.id.clone())),
            SessionState::Connecting => Err(SshError::Disconnected.into()),
            SessionState::Connected => inner
                .transport
                .clone()
                .ok_or_else(|| SshError::Disconnected.into()),
        }
    }

    /// Install the forwarding socket
    ///
    /// On failure the socket is handed back together with the reason; the
    /// caller owns closing it.
    pub fn attach_forward(
        &self,
        socket: ForwardingSocket,
    ) -> Result<(), (ForwardingSocket, TunnelError)> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Connected if inner.forward.is_none() => {
                inner.state = SessionState::Forwarding;
                inner.forward = Some(socket);
                Ok(())
            }
            SessionState::Terminated => {
                Err((socket, TunnelError::SessionNotFound(self.id.clone())))
            }
            SessionState::Connecting => Err((socket, SshError::Disconnected.into())),
            _ => Err((socket, TunnelError::ForwardingActive(self.id.clone()))),
        }
    }

    /// Tear down forwarding socket and transport
    ///
    /// Only the first call does anything; it returns `true`.
    pub async fn terminate(&self) -> bool {
        let (forward, transport) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminated() {
                return false;
            }
            inner.state = SessionState::Terminated;
            (inner.forward.take(), inner.transport.take())
        };

        debug!("Terminating session {}", self.id);

        // Listener first, so no new connection races the transport shutdown
        if let Some(forward) = forward {
            forward.close().await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        true
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            state: inner.state,
            forward: inner.forward.as_ref().map(|f| f.rule().clone()),
            local_addr: inner.forward.as_ref().map(|f| f.bound_addr().to_string()),
            stats: inner.forward.as_ref().map(|f| f.stats()),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}
