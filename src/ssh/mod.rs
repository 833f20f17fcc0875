//! SSH module - authenticated transport connections
//!
//! This module provides the transport side of a tunnel session using the
//! russh library.
//!
//! # Features
//! - Password and private-key authentication
//! - Single-owner task for the russh handle (see `handle_owner`)
//! - Remote disconnect detection without polling from callers
//! - `Transport` / `Connector` traits so the session layer is testable
//!   without an SSH server

mod client;
mod config;
mod error;
mod handle_owner;
mod transport;

pub use client::{ClientHandler, SshClient};
pub use config::{join_host_port, Credential, SshTarget};
pub use error::SshError;
pub use handle_owner::{
    spawn_handle_owner_task, CloseReason, HandleCommand, HandleController, OwnerTiming, PingResult,
};
pub use transport::{BoxedStream, Connector, LogicalStream, SshConnector, SshTransport, Transport};
