//! Local Port Forwarding
//!
//! Forwards connections from a loopback port to a remote host:port through
//! the session's transport.
//! Example: Forward 127.0.0.1:9000 -> 10.0.0.5:80

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::session::SessionEvents;
use crate::ssh::{join_host_port, Transport};

/// Listen backlog for forwarding sockets
const LISTEN_BACKLOG: u32 = 1024;

/// Local port forwarding rule
///
/// Rules always bind on the loopback interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Local port to listen on (0 picks a free port)
    pub local_port: u16,
    /// Remote host to connect to through SSH
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
}

impl ForwardRule {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Loopback address this rule listens on
    pub fn local_addr(&self) -> String {
        join_host_port("127.0.0.1", self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// Equivalent OpenSSH invocation, for command history
    pub fn command_line(&self, username: &str, host: &str) -> String {
        format!(
            "ssh -L {}:{}:{} {}@{}",
            self.local_port, self.remote_host, self.remote_port, username, host
        )
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Connections currently being forwarded
    pub active_connections: u64,
    /// Bytes sent (local -> remote) by finished connections
    pub bytes_sent: u64,
    /// Bytes received (remote -> local) by finished connections
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct ForwardCounters {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ForwardCounters {
    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Source of accepted local connections
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// A listening forwarding socket and its accept loop
///
/// Closing consumes the socket, so a given listener is closed at most once.
/// Dropping it without `close` also stops the accept loop.
pub struct ForwardingSocket {
    rule: ForwardRule,
    bound_addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    counters: Arc<ForwardCounters>,
    failed_rx: watch::Receiver<Option<String>>,
}

impl ForwardingSocket {
    /// Bind the rule's loopback port and start accepting
    ///
    /// Every accepted connection is forwarded on its own task through
    /// `transport`; there is no cap on concurrent connections.
    pub async fn open(
        rule: ForwardRule,
        transport: Arc<dyn Transport>,
        events: SessionEvents,
    ) -> Result<Self, TunnelError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, rule.local_port));
        let listener = bind_loopback(addr).map_err(|e| bind_error(&rule.local_addr(), e))?;

        let bound_addr = listener
            .local_addr()
            .map_err(|e| bind_error(&rule.local_addr(), e))?;

        info!(
            "Started local port forward: {} -> {}",
            bound_addr,
            rule.remote_addr()
        );

        Ok(Self::start(rule, listener, bound_addr, transport, events))
    }

    /// Run the accept loop over an already listening `acceptor`
    pub(crate) fn start<A: Acceptor>(
        rule: ForwardRule,
        acceptor: A,
        bound_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        events: SessionEvents,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (failed_tx, failed_rx) = watch::channel(None);
        let counters = Arc::new(ForwardCounters::default());

        let task = tokio::spawn(accept_loop(
            acceptor,
            stop_rx,
            failed_tx,
            transport,
            rule.clone(),
            events,
            counters.clone(),
        ));

        Self {
            rule,
            bound_addr,
            stop_tx,
            task,
            counters,
            failed_rx,
        }
    }

    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    /// Actual bound address (differs from the rule when the rule asked for port 0)
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Resolves with the error that killed the accept loop
    ///
    /// Resolves to `None` instead when the loop ends through `close` or a drop.
    pub fn failed(&self) -> impl Future<Output = Option<TunnelError>> + Send + 'static {
        let mut failed_rx = self.failed_rx.clone();
        async move {
            let failure = match failed_rx.wait_for(|f| f.is_some()).await {
                Ok(failure) => failure.clone(),
                Err(_) => None,
            };
            failure.map(TunnelError::Accept)
        }
    }

    /// Stop accepting and release the port
    ///
    /// Returns once the listener is dropped. Connections already accepted
    /// keep running until one of their ends closes.
    pub async fn close(self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Accept loop for {} ended abnormally: {}", self.bound_addr, e);
        }
    }
}

impl std::fmt::Debug for ForwardingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingSocket")
            .field("rule", &self.rule)
            .field("bound_addr", &self.bound_addr)
            .finish()
    }
}

fn bind_loopback(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    // Lets a stopped tunnel's port be reused right away
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

fn bind_error(addr: &str, e: io::Error) -> TunnelError {
    let reason = match e.kind() {
        io::ErrorKind::AddrInUse => {
            "Port already in use. Another application may be using this port.".to_string()
        }
        io::ErrorKind::PermissionDenied => {
            "Permission denied. Ports below 1024 require elevated privileges.".to_string()
        }
        io::ErrorKind::AddrNotAvailable => {
            "Address not available on this system.".to_string()
        }
        _ => e.to_string(),
    };
    TunnelError::BindFailed {
        addr: addr.to_string(),
        reason,
    }
}

async fn accept_loop<A: Acceptor>(
    acceptor: A,
    mut stop_rx: oneshot::Receiver<()>,
    failed_tx: watch::Sender<Option<String>>,
    transport: Arc<dyn Transport>,
    rule: ForwardRule,
    events: SessionEvents,
    counters: Arc<ForwardCounters>,
) {
    let remote_host = Arc::<str>::from(rule.remote_host.as_str());
    let remote_port = rule.remote_port;

    loop {
        tokio::select! {
            biased;

            // Stop requested, or the socket handle was dropped
            _ = &mut stop_rx => {
                debug!("Accept loop on {} stopped", rule.local_addr());
                break;
            }

            accepted = acceptor.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} on {}", peer_addr, rule.local_addr());

                        counters.connection_count.fetch_add(1, Ordering::Relaxed);
                        counters.active_connections.fetch_add(1, Ordering::Relaxed);

                        tokio::spawn(forward_connection(
                            transport.clone(),
                            stream,
                            remote_host.clone(),
                            remote_port,
                            events.clone(),
                            counters.clone(),
                        ));
                    }
                    Err(e) => {
                        let message = format!("accept on {} failed: {}", rule.local_addr(), e);
                        events.error(&message);
                        failed_tx.send_replace(Some(message));
                        break;
                    }
                }
            }
        }
    }

    info!("Local port forward on {} exited", rule.local_addr());
}

/// Forward one accepted connection
async fn forward_connection(
    transport: Arc<dyn Transport>,
    local: TcpStream,
    remote_host: Arc<str>,
    remote_port: u16,
    events: SessionEvents,
    counters: Arc<ForwardCounters>,
) {
    match transport.open_stream(&remote_host, remote_port).await {
        Ok(remote) => {
            let (sent, received) = pipe(local, remote).await;
            let sent = log_direction("local -> remote", sent);
            let received = log_direction("remote -> local", received);
            counters.bytes_sent.fetch_add(sent, Ordering::Relaxed);
            counters.bytes_received.fetch_add(received, Ordering::Relaxed);
            debug!(
                "Forward connection to {}:{} closed ({} bytes sent, {} received)",
                remote_host, remote_port, sent, received
            );
        }
        Err(e) => {
            // `local` is dropped here, closing the client connection
            events.error(&format!(
                "forward to {} failed: {}",
                join_host_port(&remote_host, remote_port),
                e
            ));
        }
    }

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
}

fn log_direction(direction: &str, result: io::Result<u64>) -> u64 {
    match result {
        Ok(n) => n,
        Err(e) => {
            debug!("Forward {} ended with error: {}", direction, e);
            0
        }
    }
}

/// Copy bytes both ways between `local` and `remote`
///
/// Each direction copies until its source reaches end-of-stream or fails,
/// then shuts down its destination's write side. Returns only when both
/// directions are done, so a half-closed connection keeps draining the other
/// way. Both streams are dropped on return.
///
/// Results are `(local -> remote, remote -> local)` byte counts.
pub async fn pipe<L, R>(local: L, remote: R) -> (io::Result<u64>, io::Result<u64>)
where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let outbound = async {
        let result = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        result
    };

    let inbound = async {
        let result = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        result
    };

    tokio::join!(outbound, inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EventLevel, NoopSink};
    use crate::ssh::SshError;
    use crate::test_support::{
        wait_until, FailingAcceptor, MockTransport, RecordingSink, TcpEchoServer,
    };
    use tokio::io::AsyncReadExt;

    fn events() -> SessionEvents {
        SessionEvents::new("test-session", Arc::new(NoopSink))
    }

    #[test]
    fn test_rule_addresses() {
        let rule = ForwardRule::new(9000, "10.0.0.5", 80);
        assert_eq!(rule.local_addr(), "127.0.0.1:9000");
        assert_eq!(rule.remote_addr(), "10.0.0.5:80");
        assert_eq!(
            rule.command_line("alice", "bastion.example.com"),
            "ssh -L 9000:10.0.0.5:80 alice@bastion.example.com"
        );
    }

    #[tokio::test]
    async fn test_pipe_waits_for_both_directions() {
        let (client, local) = tokio::io::duplex(64);
        let (remote, server) = tokio::io::duplex(64);

        let pump = tokio::spawn(pipe(local, remote));

        // Server answers only after the client half-closes
        let server_task = tokio::spawn(async move {
            let mut server = server;
            let mut request = Vec::new();
            server.read_to_end(&mut request).await.unwrap();
            server.write_all(b"reply:").await.unwrap();
            server.write_all(&request).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"reply:ping");

        server_task.await.unwrap();
        let (sent, received) = pump.await.unwrap();
        assert_eq!(sent.unwrap(), 4);
        assert_eq!(received.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_forwards_end_to_end() {
        let echo = TcpEchoServer::start().await;
        let transport = MockTransport::new();

        let socket = ForwardingSocket::open(
            ForwardRule::new(0, "127.0.0.1", echo.port()),
            transport.clone(),
            events(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(socket.bound_addr()).await.unwrap();
        client.write_all(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");
        drop(client);

        assert_eq!(transport.opened_streams(), 1);
        wait_until(|| socket.stats().active_connections == 0).await;
        let stats = socket.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.bytes_sent, 12);

        socket.close().await;
    }

    #[tokio::test]
    async fn test_slow_connection_does_not_block_accept() {
        let echo = TcpEchoServer::start().await;
        let transport = MockTransport::new();
        let socket = ForwardingSocket::open(
            ForwardRule::new(0, "127.0.0.1", echo.port()),
            transport.clone(),
            events(),
        )
        .await
        .unwrap();

        // First connection sits idle and never sends anything
        let _idle = TcpStream::connect(socket.bound_addr()).await.unwrap();

        let mut active = TcpStream::connect(socket.bound_addr()).await.unwrap();
        active.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        active.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        socket.close().await;
    }

    #[tokio::test]
    async fn test_close_frees_port() {
        let transport = MockTransport::new();
        let socket =
            ForwardingSocket::open(ForwardRule::new(0, "127.0.0.1", 1), transport, events())
                .await
                .unwrap();
        let addr = socket.bound_addr();

        socket.close().await;

        // The same port can be bound again immediately
        let rebound = bind_loopback(addr).unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = ForwardingSocket::open(
            ForwardRule::new(port, "127.0.0.1", 80),
            MockTransport::new(),
            events(),
        )
        .await;

        match result {
            Err(TunnelError::BindFailed { addr, .. }) => {
                assert_eq!(addr, format!("127.0.0.1:{}", port));
            }
            other => panic!("expected BindFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_stream_failure_closes_local_connection() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let events = SessionEvents::new(
            "test-session",
            Arc::new(move |level: EventLevel, msg: &str| {
                seen_clone.lock().push((level, msg.to_string()));
            }),
        );

        let transport = MockTransport::new();
        transport.fail_streams(SshError::DialFailed("connection refused".into()));

        let socket = ForwardingSocket::open(ForwardRule::new(0, "10.0.0.5", 80), transport, events)
            .await
            .unwrap();

        let mut client = TcpStream::connect(socket.bound_addr()).await.unwrap();
        let mut buf = Vec::new();
        // Server side drops the connection without sending anything
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        wait_until(|| !seen.lock().is_empty()).await;
        let seen = seen.lock();
        assert_eq!(seen[0].0, EventLevel::Error);
        assert!(seen[0].1.contains("10.0.0.5:80"));
        drop(seen);

        socket.close().await;
    }

    #[tokio::test]
    async fn test_accept_failure_reported() {
        let sink = RecordingSink::new();
        let socket = ForwardingSocket::start(
            ForwardRule::new(9000, "10.0.0.5", 80),
            FailingAcceptor::new("too many open files"),
            "127.0.0.1:9000".parse().unwrap(),
            MockTransport::new(),
            SessionEvents::new("test-session", sink.clone()),
        );

        let failure = socket.failed().await;
        assert!(matches!(
            failure,
            Some(TunnelError::Accept(msg)) if msg.contains("too many open files")
        ));
        assert_eq!(
            sink.events(),
            vec![(
                EventLevel::Error,
                "accept on 127.0.0.1:9000 failed: too many open files".to_string()
            )]
        );

        socket.close().await;
    }

    #[tokio::test]
    async fn test_close_is_not_a_failure() {
        let socket = ForwardingSocket::open(
            ForwardRule::new(0, "127.0.0.1", 1),
            MockTransport::new(),
            events(),
        )
        .await
        .unwrap();
        let failed = socket.failed();

        socket.close().await;
        assert!(failed.await.is_none());
    }
}
