//! Port Forwarding Module
//!
//! Local port forwarding for tunnel sessions: one loopback listener per
//! session, one task per accepted connection.

mod local;

pub(crate) use local::Acceptor;
pub use local::{pipe, ForwardRule, ForwardStats, ForwardingSocket};
