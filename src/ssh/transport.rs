//! Transport seam
//!
//! A session only needs four things from its authenticated connection: open a
//! logical stream, probe liveness, close, and wait for closure. [`Transport`]
//! captures that contract and [`Connector`] the dial that produces one.
//! [`SshConnector`] is the russh implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::client::SshClient;
use super::config::SshTarget;
use super::error::SshError;
use super::handle_owner::{
    spawn_handle_owner_task, CloseReason, HandleController, OwnerTiming, PingResult,
};
use crate::config::EngineConfig;

/// Byte stream carried over a transport
pub trait LogicalStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> LogicalStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn LogicalStream>;

/// An authenticated connection to a remote host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a logical stream to `host:port` as seen from the remote side.
    /// May be called concurrently.
    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream, SshError>;

    /// Zero-payload liveness probe. Failure means the transport is dead.
    async fn send_keepalive(&self) -> Result<(), SshError>;

    /// Terminate the transport and every stream derived from it. Idempotent.
    async fn close(&self);

    /// Resolve once the transport is closed, for whatever reason
    async fn closed(&self) -> CloseReason;
}

/// Establishes transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        target: &SshTarget,
    ) -> Result<Arc<dyn Transport>, SshError>;
}

/// russh-backed connector
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: EngineConfig,
}

impl SshConnector {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        session_id: &str,
        target: &SshTarget,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let handle = SshClient::new(target.clone(), self.config.clone())
            .connect()
            .await?;

        let controller = spawn_handle_owner_task(
            handle,
            session_id.to_string(),
            OwnerTiming {
                keepalive_timeout: self.config.keepalive_timeout(),
                close_poll_interval: self.config.close_poll_interval(),
                channel_buffer: self.config.channel_buffer,
            },
        );

        Ok(Arc::new(SshTransport::new(controller)))
    }
}

/// Transport over a running handle owner task
#[derive(Clone)]
pub struct SshTransport {
    controller: HandleController,
}

impl SshTransport {
    pub fn new(controller: HandleController) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}:{}", host, port);
        Ok(Box::new(channel.into_stream()))
    }

    async fn send_keepalive(&self) -> Result<(), SshError> {
        match self.controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::Unreachable("keepalive timed out".to_string())),
            PingResult::IoError => Err(SshError::Unreachable("connection lost".to_string())),
        }
    }

    async fn close(&self) {
        if self.controller.is_connected() {
            info!("Closing SSH transport");
        }
        self.controller.disconnect().await;
        self.controller.closed().await;
    }

    async fn closed(&self) -> CloseReason {
        self.controller.closed().await
    }
}
