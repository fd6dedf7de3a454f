//! Session — one registered peer connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;

use roster_core::wire::{unix_timestamp, ControlMessage, RoundTrip, WireError};

use crate::connection::Connection;

/// Connection ID assigned by the registry, unique for the process lifetime.
pub type SessionId = u64;

/// Where the last ping on this session got to.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PingState {
    #[default]
    Idle,
    /// `ping <t1>` is out, waiting for the echo.
    AwaitingEcho { t1: f64 },
    Complete(RoundTrip),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),
}

/// A connected, named peer.
///
/// The name is fixed at handshake. All I/O goes through one lock, so sends
/// on a session leave in call order and a ping's send/receive pair is never
/// interleaved with another send.
pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    name: String,
    connected_at: Instant,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    ping_state: StdMutex<PingState>,
}

impl Session {
    pub fn new(id: SessionId, conn: Connection, name: String, io_timeout: Duration) -> Self {
        Self {
            id,
            addr: conn.peer_addr(),
            name,
            connected_at: Instant::now(),
            io_timeout,
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            ping_state: StdMutex::new(PingState::Idle),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ping_state(&self) -> PingState {
        self.ping_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_ping_state(&self, state: PingState) {
        *self.ping_state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Send one frame, bounded by the I/O timeout.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::Closed)?;
        self.bounded(conn.write_frame(text)).await
    }

    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), SessionError> {
        self.send(&msg.encode()).await
    }

    /// Liveness probe: fails if the session is closed, the peer has hung up,
    /// or a `conntest` cannot be written.
    pub async fn probe(&self) -> Result<(), SessionError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::Closed)?;
        if conn.sweep() {
            return Err(SessionError::PeerClosed);
        }
        self.bounded(conn.write_frame(&ControlMessage::ConnTest.encode()))
            .await
    }

    /// Measure round-trip time: send `ping <t1>`, wait for `ping <t1> <t2>`.
    pub async fn ping(&self) -> Result<RoundTrip, SessionError> {
        let result = self.ping_inner().await;
        match &result {
            Ok(rtt) => self.set_ping_state(PingState::Complete(*rtt)),
            Err(e) => self.set_ping_state(PingState::Failed(e.to_string())),
        }
        result
    }

    async fn ping_inner(&self) -> Result<RoundTrip, SessionError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::Closed)?;

        // A late echo from an earlier ping must not be read as this one's.
        if conn.discard_pending() {
            return Err(SessionError::PeerClosed);
        }

        let t1 = unix_timestamp();
        self.set_ping_state(PingState::AwaitingEcho { t1 });
        self.bounded(conn.write_frame(&ControlMessage::Ping { t1 }.encode()))
            .await?;

        let reply = self
            .bounded(conn.read_frame())
            .await?
            .ok_or(SessionError::PeerClosed)?;
        let t3 = unix_timestamp();

        Ok(RoundTrip::from_echo(&reply, t1, t3)?)
    }

    /// Close the transport. Only the first call does anything; returns
    /// whether this call was it.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.shutdown().await;
        }
        true
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match timeout(self.io_timeout, fut).await {
            Ok(r) => Ok(r?),
            Err(_) => Err(SessionError::Timeout(self.io_timeout)),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
