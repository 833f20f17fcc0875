//! Tunnel Commands
//!
//! Start, stop and status operations as the control API performs them:
//! registry calls plus the session/event/history facts the persistence
//! layer records. The registry itself holds no durable state.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TunnelError;
use crate::forwarding::ForwardRule;
use crate::session::{EventLevel, EventSink, SessionRegistry};
use crate::ssh::{Credential, SshTarget};

/// Saved host, as resolved by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl HostRecord {
    pub fn target(&self) -> SshTarget {
        SshTarget::new(
            self.host.clone(),
            self.port,
            self.username.clone(),
            self.credential.clone(),
        )
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopStatus {
    Closed,
    Error,
}

/// Durable record of sessions, events and command history
///
/// Calls are synchronous and made from whichever task produced the fact,
/// event recording included (it backs the session's event sink).
pub trait SessionLedger: Send + Sync {
    fn session_started(&self, session_id: &str, host_id: i64);
    fn session_stopped(&self, session_id: &str, status: StopStatus, error: Option<&str>);
    fn event(&self, session_id: &str, level: EventLevel, message: &str);
    fn command(&self, session_id: &str, host_id: i64, raw: &str);
}

/// Event sink writing into a ledger
struct LedgerSink {
    ledger: Arc<dyn SessionLedger>,
    session_id: String,
}

impl EventSink for LedgerSink {
    fn notify(&self, level: EventLevel, message: &str) {
        self.ledger.event(&self.session_id, level, message);
    }
}

/// Connect to `host` and forward `rule` through it
///
/// Returns the new session identifier. Any failure stops the session and
/// records it as ended with an error.
pub async fn start_tunnel(
    registry: &SessionRegistry,
    ledger: Arc<dyn SessionLedger>,
    host: &HostRecord,
    rule: ForwardRule,
) -> Result<String, TunnelError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    ledger.session_started(&session_id, host.id);

    let sink = Arc::new(LedgerSink {
        ledger: ledger.clone(),
        session_id: session_id.clone(),
    });

    if let Err(e) = registry.create(&session_id, &host.target(), sink).await {
        warn!("Tunnel {} failed to connect: {}", session_id, e);
        ledger.session_stopped(&session_id, StopStatus::Error, Some(&e.to_string()));
        return Err(e);
    }

    let raw = rule.command_line(&host.username, &host.host);

    if let Err(e) = registry.install_forwarding(&session_id, rule).await {
        warn!("Tunnel {} failed to start forwarding: {}", session_id, e);
        registry.stop(&session_id).await;
        ledger.session_stopped(&session_id, StopStatus::Error, Some(&e.to_string()));
        return Err(e);
    }

    ledger.command(&session_id, host.id, &raw);
    info!("Tunnel {} started: {}", session_id, raw);
    Ok(session_id)
}

/// Stop a tunnel and record it as closed
pub async fn stop_tunnel(registry: &SessionRegistry, ledger: &dyn SessionLedger, session_id: &str) {
    registry.stop(session_id).await;
    ledger.session_stopped(session_id, StopStatus::Closed, None);
}

/// Report whether a tunnel is alive, recording it as closed when it is not
pub async fn tunnel_status(
    registry: &SessionRegistry,
    ledger: &dyn SessionLedger,
    session_id: &str,
) -> bool {
    let alive = registry.is_alive(session_id).await;
    if !alive {
        ledger.session_stopped(session_id, StopStatus::Closed, None);
    }
    alive
}

/// Entry in a [`MemoryLedger`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Started {
        session_id: String,
        host_id: i64,
        at: String,
    },
    Stopped {
        session_id: String,
        status: StopStatus,
        error: Option<String>,
        at: String,
    },
    Event {
        session_id: String,
        level: EventLevel,
        message: String,
    },
    Command {
        session_id: String,
        host_id: i64,
        raw: String,
    },
}

/// Ledger kept in memory, lost on restart
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }

    /// Entries for one session, in order
    pub fn for_session(&self, session_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.session_id() == session_id)
            .cloned()
            .collect()
    }
}

impl LedgerEntry {
    pub fn session_id(&self) -> &str {
        match self {
            LedgerEntry::Started { session_id, .. }
            | LedgerEntry::Stopped { session_id, .. }
            | LedgerEntry::Event { session_id, .. }
            | LedgerEntry::Command { session_id, .. } => session_id,
        }
    }
}

impl SessionLedger for MemoryLedger {
    fn session_started(&self, session_id: &str, host_id: i64) {
        self.entries.lock().push(LedgerEntry::Started {
            session_id: session_id.to_string(),
            host_id,
            at: Utc::now().to_rfc3339(),
        });
    }

    fn session_stopped(&self, session_id: &str, status: StopStatus, error: Option<&str>) {
        self.entries.lock().push(LedgerEntry::Stopped {
            session_id: session_id.to_string(),
            status,
            error: error.map(str::to_string),
            at: Utc::now().to_rfc3339(),
        });
    }

    fn event(&self, session_id: &str, level: EventLevel, message: &str) {
        self.entries.lock().push(LedgerEntry::Event {
            session_id: session_id.to_string(),
            level,
            message: message.to_string(),
        });
    }

    fn command(&self, session_id: &str, host_id: i64, raw: &str) {
        self.entries.lock().push(LedgerEntry::Command {
            session_id: session_id.to_string(),
            host_id,
            raw: raw.to_string(),
        });
    }
}
