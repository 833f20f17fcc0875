//! Session Registry
//!
//! Maps session identifiers to live sessions. One mutex guards the map and
//! is held only for insert/lookup/remove, never across network I/O.
//!
//! Teardown always goes through "remove from map, then terminate", so
//! whichever caller removes an entry (explicit stop, liveness poll, a dead
//! accept loop, or the watcher) is the one that closes its resources.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::events::EventSink;
use super::state::SessionState;
use super::types::{Session, SessionInfo};
use crate::config::EngineConfig;
use crate::error::TunnelError;
use crate::forwarding::{ForwardRule, ForwardingSocket};
use crate::ssh::{CloseReason, Connector, SshConnector, SshTarget};

/// Registry of tunnel sessions
///
/// Cheap to clone; clones share the same map. Independent registries do
/// not share anything.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    connector: Arc<dyn Connector>,
}

impl SessionRegistry {
    /// Registry dialing real SSH servers
    pub fn new(config: EngineConfig) -> Self {
        Self::with_connector(Arc::new(SshConnector::new(config)))
    }

    /// Registry over any transport implementation
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    /// Create a session and connect its transport
    ///
    /// Fails with `SessionExists` if the identifier is taken. On connect
    /// failure the session is removed again and the transport error is
    /// returned. On success a watcher task reconciles remote disconnects.
    pub async fn create(
        &self,
        session_id: &str,
        target: &SshTarget,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), TunnelError> {
        let session = {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(session_id) {
                return Err(TunnelError::SessionExists(session_id.to_string()));
            }
            let session = Arc::new(Session::new(session_id, target, sink));
            sessions.insert(session_id.to_string(), session.clone());
            session
        };

        info!(
            "Creating session {}: {}@{}:{}",
            session_id, target.username, target.host, target.port
        );

        let transport = match self.inner.connector.connect(session_id, target).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Session {} failed to connect: {}", session_id, e);
                if self.remove_if_same(session_id, &session) {
                    session.terminate().await;
                }
                return Err(e.into());
            }
        };

        if let Err(transport) = session.attach_transport(transport.clone()) {
            // Stopped while the handshake was in flight
            info!("Session {} was stopped while connecting", session_id);
            transport.close().await;
            return Err(TunnelError::SessionNotFound(session_id.to_string()));
        }

        session
            .events()
            .info(&format!("ssh connected to {}", target.addr()));

        self.spawn_watcher(session);
        Ok(())
    }

    /// Install the session's forwarding rule and start accepting
    ///
    /// Does not stop the session on failure; that is left to the caller.
    pub async fn install_forwarding(
        &self,
        session_id: &str,
        rule: ForwardRule,
    ) -> Result<(), TunnelError> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))?;

        let transport = session.forwarding_transport()?;
        let socket = ForwardingSocket::open(rule, transport, session.events().clone()).await?;

        self.attach_socket(&session, socket).await
    }

    /// Hand a running socket to its session and stop the session if the
    /// socket's accept loop later dies
    async fn attach_socket(
        &self,
        session: &Arc<Session>,
        socket: ForwardingSocket,
    ) -> Result<(), TunnelError> {
        let local_addr = socket.bound_addr();
        let remote_addr = socket.rule().remote_addr();
        let failed = socket.failed();

        if let Err((socket, e)) = session.attach_forward(socket) {
            // Lost a race with stop or a concurrent install
            socket.close().await;
            return Err(e);
        }

        session
            .events()
            .info(&format!("tunnel started {} -> {}", local_addr, remote_addr));

        self.spawn_forward_watcher(session.clone(), failed);
        Ok(())
    }

    /// Stop a session and release its resources
    ///
    /// Idempotent; unknown identifiers are a no-op.
    pub async fn stop(&self, session_id: &str) {
        let session = self.inner.sessions.lock().remove(session_id);
        match session {
            Some(session) => {
                info!("Stopping session {}", session_id);
                session.terminate().await;
            }
            None => debug!("Stop for unknown session {}", session_id),
        }
    }

    /// Probe a session's transport
    ///
    /// A failed probe stops the session. Sessions still connecting report
    /// `false` and are left alone.
    pub async fn is_alive(&self, session_id: &str) -> bool {
        let Some(session) = self.lookup(session_id) else {
            return false;
        };

        let Some(transport) = session.transport() else {
            return false;
        };

        match transport.send_keepalive().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session {} failed liveness check: {}", session_id, e);
                if self.remove_if_same(session_id, &session) {
                    session.terminate().await;
                }
                false
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.lookup(session_id).map(|s| s.info())
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.lookup(session_id).map(|s| s.state())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.inner.sessions.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        if !sessions.is_empty() {
            info!("Stopping {} sessions", sessions.len());
        }
        for session in sessions {
            session.terminate().await;
        }
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(session_id).cloned()
    }

    /// Remove the entry only if it is still this exact session, so a stale
    /// task never tears down a newer session that reused the identifier
    fn remove_if_same(&self, session_id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Wait for the transport to close, then reconcile the registry
    fn spawn_watcher(&self, session: Arc<Session>) {
        let Some(transport) = session.transport() else {
            return;
        };
        let registry = self.clone();

        tokio::spawn(async move {
            let reason = transport.closed().await;
            drop(transport);

            let session_id = session.id().to_string();
            debug!("Watcher for session {} saw {:?}", session_id, reason);

            match reason {
                CloseReason::Error(e) => session.events().error(&e),
                CloseReason::Local | CloseReason::Remote => {
                    session.events().info("ssh disconnected")
                }
            }

            // No-op when an explicit stop got there first
            if registry.remove_if_same(&session_id, &session) {
                session.terminate().await;
            }
        });
    }

    /// Stop the session once its accept loop dies on an error
    fn spawn_forward_watcher(
        &self,
        session: Arc<Session>,
        failed: impl Future<Output = Option<TunnelError>> + Send + 'static,
    ) {
        let registry = self.clone();

        tokio::spawn(async move {
            let Some(e) = failed.await else {
                return;
            };

            warn!("Session {} lost its forwarding socket: {}", session.id(), e);
            if registry.remove_if_same(session.id(), &session) {
                session.terminate().await;
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
