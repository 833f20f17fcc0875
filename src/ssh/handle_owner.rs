//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Forwarding tasks, liveness
//! probes and the session watcher talk to it through a cloneable
//! `HandleController`, which sends commands over an mpsc channel.
//!
//! Channel opens and keepalive probes run concurrently inside the owner task,
//! so a stalled open never holds up a keepalive or a disconnect.
//!
//! The owner task also watches the handle itself: when the remote side drops
//! the connection the task exits on its own and publishes a [`CloseReason`]
//! on a watch channel. Late subscribers still observe it, since a watch
//! channel keeps its last value.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Why a transport stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this process (stop, or every controller dropped)
    Local,
    /// The server or the network dropped the connection
    Remote,
    /// The connection failed with an error
    Error(String),
}

/// Ping result, distinguishing failure causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply within the keepalive timeout
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (one forwarded connection)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Send a keepalive@openssh.com global request and wait for the reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (an mpsc sender and a watch receiver). Any holder has
/// full control over the connection, so it must not leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

impl HandleController {
    /// Wrap raw channels (for tests; production code uses `spawn_handle_owner_task`)
    pub fn new(
        cmd_tx: mpsc::Sender<HandleCommand>,
        closed_rx: watch::Receiver<Option<CloseReason>>,
    ) -> Self {
        Self { cmd_tx, closed_rx }
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::DialFailed(format!("{}:{}: {}", host, port, e)))
    }

    /// Probe the connection
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Ask the owner task to disconnect. No-op once it has exited.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Wait until the owner task has exited
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        let result = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Error("handle owner task ended unexpectedly".to_string()),
        };
        result
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Timing knobs for the owner task
#[derive(Debug, Clone, Copy)]
pub struct OwnerTiming {
    pub keepalive_timeout: Duration,
    pub close_poll_interval: Duration,
    pub channel_buffer: usize,
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    timing: OwnerTiming,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(timing.channel_buffer.max(1));
    let (closed_tx, closed_rx) = watch::channel::<Option<CloseReason>>(None);

    tokio::spawn(async move {
        let handle = handle;

        info!("Handle owner task started for session {}", session_id);

        let mut close_check = tokio::time::interval(timing.close_poll_interval);
        close_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Opens and keepalives in flight, each resolving to a fatal error if any
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Option<String>>> =
            FuturesUnordered::new();

        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let handle = &handle;
                        in_flight.push(
                            async move {
                                let result = handle
                                    .channel_open_direct_tcpip(
                                        host,
                                        port,
                                        originator_host,
                                        originator_port,
                                    )
                                    .await;
                                if reply_tx.send(result).is_err() {
                                    // Channel is dropped here, the server closes it
                                    warn!("Caller dropped before receiving direct_tcpip result");
                                }
                                None
                            }
                            .boxed(),
                        );
                    }

                    Some(HandleCommand::Ping { reply_tx }) => {
                        debug!("Keepalive probe for session {}", session_id);
                        let handle = &handle;
                        let session_id = session_id.as_str();
                        in_flight.push(
                            async move {
                                let (result, fatal) = match tokio::time::timeout(
                                    timing.keepalive_timeout,
                                    handle.send_keepalive(true),
                                )
                                .await
                                {
                                    Ok(Ok(())) => (PingResult::Ok, None),
                                    Ok(Err(e)) => {
                                        warn!("Keepalive failed for session {}: {}", session_id, e);
                                        (PingResult::IoError, Some(e.to_string()))
                                    }
                                    Err(_) => {
                                        warn!(
                                            "Keepalive timeout for session {} ({:?})",
                                            session_id, timing.keepalive_timeout
                                        );
                                        (PingResult::Timeout, None)
                                    }
                                };
                                let _ = reply_tx.send(result);
                                fatal
                            }
                            .boxed(),
                        );
                    }

                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_id);
                        break CloseReason::Local;
                    }

                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break CloseReason::Local;
                    }
                },

                Some(fatal) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(e) = fatal {
                        break CloseReason::Error(e);
                    }
                }

                _ = close_check.tick() => {
                    if handle.is_closed() {
                        info!("SSH connection closed by remote for session {}", session_id);
                        break CloseReason::Remote;
                    }
                }
            }
        };

        // Callers of abandoned opens and keepalives see their reply sender dropped
        drop(in_flight);
        drain_pending_commands(&mut cmd_rx);

        if reason == CloseReason::Local {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await;
        }

        // Publish last, so `closed()` returning means the handle is released
        drop(handle);
        let _ = closed_tx.send(Some(reason));
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, closed_rx }
}

/// Drain all pending commands, answering each with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
