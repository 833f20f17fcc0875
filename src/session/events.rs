//! Session Event System
//!
//! Sessions report lifecycle facts (connected, tunnel started, forward
//! failures, disconnects) to an injected [`EventSink`].
//!
//! # Contract
//!
//! `notify` is called synchronously on whichever task produced the event:
//! the caller of `create`, an accept loop, a forwarding task or a watcher.
//! Nothing is buffered or dropped, so a slow sink slows that task down and
//! a sink must never block indefinitely.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Severity of a session event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of session events
pub trait EventSink: Send + Sync {
    fn notify(&self, level: EventLevel, message: &str);
}

impl<F> EventSink for F
where
    F: Fn(EventLevel, &str) + Send + Sync,
{
    fn notify(&self, level: EventLevel, message: &str) {
        self(level, message)
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn notify(&self, _level: EventLevel, _message: &str) {}
}

/// Per-session emitter: logs every event and hands it to the sink
#[derive(Clone)]
pub struct SessionEvents {
    session_id: String,
    sink: Arc<dyn EventSink>,
}

impl SessionEvents {
    pub fn new(session_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
        }
    }

    pub fn info(&self, message: &str) {
        info!("[session {}] {}", self.session_id, message);
        self.sink.notify(EventLevel::Info, message);
    }

    pub fn error(&self, message: &str) {
        error!("[session {}] {}", self.session_id, message);
        self.sink.notify(EventLevel::Error, message);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEvents")
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_sink_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: Arc<dyn EventSink> = Arc::new(move |level: EventLevel, msg: &str| {
            seen_clone.lock().push((level, msg.to_string()));
        });

        let events = SessionEvents::new("s1", sink);
        events.info("ssh connected to example.com:22");
        events.error("boom");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (EventLevel::Info, "ssh connected to example.com:22".to_string()));
        assert_eq!(seen[1].0, EventLevel::Error);
    }

    #[test]
    fn test_noop_sink() {
        let events = SessionEvents::new("s1", Arc::new(NoopSink));
        // Should not panic
        events.info("hello");
        events.error("world");
        assert_eq!(events.session_id(), "s1");
    }

    #[test]
    fn test_level_serialization() {
        assert_eq!(serde_json::to_string(&EventLevel::Info).unwrap(), "\"info\"");
        assert_eq!(EventLevel::Error.to_string(), "error");
    }
}
