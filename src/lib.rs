//! Tunnelkeeper - SSH local port forward tunnels
//!
//! Start, monitor and stop SSH local-port-forward tunnels. Each session is
//! one SSH login with at most one loopback forwarding rule; a
//! [`SessionRegistry`] owns any number of independent sessions and tears
//! each one down exactly once, whether it is stopped explicitly, fails a
//! liveness probe, or is dropped by the remote side.
//!
//! ```ignore
//! let registry = SessionRegistry::new(EngineConfig::default());
//! let target = SshTarget::new("bastion", 22, "alice", Credential::password("..."));
//!
//! registry.create("s1", &target, Arc::new(NoopSink)).await?;
//! registry.install_forwarding("s1", ForwardRule::new(9000, "10.0.0.5", 80)).await?;
//! // 127.0.0.1:9000 now reaches 10.0.0.5:80 through bastion
//! registry.stop("s1").await;
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use error::TunnelError;
pub use forwarding::{ForwardRule, ForwardingSocket};
pub use session::{EventLevel, EventSink, NoopSink, SessionInfo, SessionRegistry, SessionState};
pub use ssh::{Credential, SshError, SshTarget};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Filter comes from `RUST_LOG`, defaulting to `info`. Safe to call more
/// than once; only the first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
