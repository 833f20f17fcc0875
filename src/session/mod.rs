//! Session Management Module
//!
//! Tunnel sessions and the registry that owns them.
//!
//! # Components
//!
//! - `registry`: `SessionRegistry`, the identifier -> session map
//! - `types`: `Session` (transport + forwarding socket) and `SessionInfo`
//! - `state`: the `SessionState` machine
//! - `events`: the `EventSink` capability sessions report through

mod events;
mod registry;
mod state;
mod types;

pub use events::{EventLevel, EventSink, NoopSink, SessionEvents};
pub use registry::SessionRegistry;
pub use state::SessionState;
pub use types::{Session, SessionInfo};
