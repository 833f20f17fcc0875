//! In-process transport doubles for tests
//!
//! `MockTransport` opens its "logical streams" as in-memory pipes relayed to
//! plain loopback TCP connections, so forwarding can be exercised end to end
//! without an SSH server. Closing the transport kills every relay, the way
//! an SSH disconnect kills its channels.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::forwarding::{pipe, Acceptor};
use crate::session::{EventLevel, EventSink};
use crate::ssh::{BoxedStream, CloseReason, Connector, SshError, SshTarget, Transport};

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct MockTransport {
    closed_tx: watch::Sender<Option<CloseReason>>,
    keepalive_ok: AtomicBool,
    stream_error: Mutex<Option<String>>,
    opened: AtomicUsize,
    keepalives: AtomicUsize,
    closes: AtomicUsize,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (closed_tx, _) = watch::channel(None);
        Arc::new(Self {
            closed_tx,
            keepalive_ok: AtomicBool::new(true),
            stream_error: Mutex::new(None),
            opened: AtomicUsize::new(0),
            keepalives: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            relays: Mutex::new(Vec::new()),
        })
    }

    /// Make every later `open_stream` fail with a dial error
    pub fn fail_streams(&self, err: SshError) {
        *self.stream_error.lock() = Some(err.to_string());
    }

    pub fn fail_keepalive(&self) {
        self.keepalive_ok.store(false, Ordering::SeqCst);
    }

    /// Simulate the transport dropping on its own
    pub fn hang_up(&self, reason: CloseReason) {
        self.mark_closed(reason);
    }

    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn keepalive_count(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    fn mark_closed(&self, reason: CloseReason) {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        // After marking closed, so `open_stream` cannot slip a relay in
        for relay in self.relays.lock().drain(..) {
            relay.abort();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        let stream_error = self.stream_error.lock().clone();
        if let Some(msg) = stream_error {
            return Err(SshError::DialFailed(msg));
        }
        let target = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::DialFailed(e.to_string()))?;
        let (stream, far_end) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move {
            let _ = pipe(far_end, target).await;
        });

        let mut relays = self.relays.lock();
        if self.is_closed() {
            relay.abort();
            return Err(SshError::Disconnected);
        }
        relays.retain(|r| !r.is_finished());
        relays.push(relay);
        drop(relays);

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    async fn send_keepalive(&self) -> Result<(), SshError> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() || !self.keepalive_ok.load(Ordering::SeqCst) {
            return Err(SshError::Unreachable("no reply".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.mark_closed(CloseReason::Local);
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_tx.subscribe();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Local,
        };
        reason
    }
}

/// Holds connects until released
pub struct ConnectGate {
    tx: watch::Sender<bool>,
}

impl ConnectGate {
    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

pub struct MockConnector {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    failures: Mutex<VecDeque<SshError>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    /// Fail the next connect with `err`
    pub fn fail_next(&self, err: SshError) {
        self.failures.lock().push_back(err);
    }

    /// Block connects until the returned gate is released
    pub fn hold_connects(&self) -> ConnectGate {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(rx);
        ConnectGate { tx }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The n-th transport handed out
    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _session_id: &str,
        _target: &SshTarget,
    ) -> Result<Arc<dyn Transport>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let transport = MockTransport::new();
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Acceptor whose first accept fails
pub struct FailingAcceptor {
    message: String,
}

impl FailingAcceptor {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Acceptor for FailingAcceptor {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Other, self.message.clone()))
    }
}

/// Loopback TCP server echoing every byte back
pub struct TcpEchoServer {
    port: u16,
    task: JoinHandle<()>,
}

impl TcpEchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Event sink keeping everything it is told
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(EventLevel, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(EventLevel, String)> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, level: EventLevel, message: &str) {
        self.events.lock().push((level, message.to_string()));
    }
}
