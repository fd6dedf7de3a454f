//! Server — listening socket, accept loop, and name handshake.
//!
//! `start` binds and spawns the accept loop; `stop` tells every peer to
//! stop, shuts the loop down, and closes all sessions. Two flags track run
//! state: "server running" (listener open) and "loop running" (the accept
//! task should keep going). They can drift apart if the task dies; see
//! `reconcile`.
//!
//! Handshakes in flight belong to the accept loop and are aborted when it
//! exits. The registry is closed by `stop` and reopened by `start`, so a
//! handshake that completes in between is turned away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use roster_core::config::{NetworkConfig, SessionConfig};
use roster_core::wire::{parse_handshake_name, ControlMessage, TIMEOUT_NOTICE};

use crate::connection::Connection;
use crate::registry::SharedRegistry;
use crate::session::Session;

/// Listen backlog.
const BACKLOG: i32 = 16;

/// How long `stop` waits for the accept task to drop the listener.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Pause after an unexpected accept error, so a persistent one does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,
    #[error("server not running")]
    NotRunning,
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

/// Snapshot of run state, as shown by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub server_running: bool,
    pub loop_running: bool,
    pub loop_alive: bool,
    pub sessions: usize,
    pub local_addr: Option<SocketAddr>,
}

impl ServerStatus {
    pub fn in_sync(&self) -> bool {
        self.loop_running == self.loop_alive
    }
}

struct AcceptTask {
    handle: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

pub struct Server {
    network: NetworkConfig,
    session: SessionConfig,
    registry: SharedRegistry,
    server_running: Arc<AtomicBool>,
    loop_running: Arc<AtomicBool>,
    task: Mutex<Option<AcceptTask>>,
}

impl Server {
    pub fn new(network: NetworkConfig, session: SessionConfig, registry: SharedRegistry) -> Self {
        Self {
            network,
            session,
            registry,
            server_running: Arc::new(AtomicBool::new(false)),
            loop_running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.server_running.load(Ordering::SeqCst)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.task.lock().await.as_ref().map(|t| t.local_addr)
    }

    /// Bind the listener and launch the accept loop.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut task = self.task.lock().await;
        if self.is_running() {
            tracing::error!("server already running");
            return Err(ServerError::AlreadyRunning);
        }

        let listener = bind_listener(&self.network.listen_addr()).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(self.network.listen_addr(), e))?;

        self.registry.reopen().await;
        self.server_running.store(true, Ordering::SeqCst);
        self.loop_running.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept = AcceptLoop {
            listener,
            registry: self.registry.clone(),
            session: self.session.clone(),
            server_running: self.server_running.clone(),
            loop_running: self.loop_running.clone(),
            shutdown: shutdown_rx,
            handshakes: JoinSet::new(),
        };
        *task = Some(AcceptTask {
            handle: tokio::spawn(accept.run()),
            shutdown: shutdown_tx,
            local_addr,
        });

        tracing::info!(addr = %local_addr, "server started");
        Ok(local_addr)
    }

    /// Tell peers to stop, close the listener, and drop every session.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut task = self.task.lock().await;
        if !self.is_running() {
            tracing::error!("server not running");
            return Err(ServerError::NotRunning);
        }

        tracing::info!("stopping server");
        let report = self
            .registry
            .broadcast(&ControlMessage::Stop.encode())
            .await;

        self.server_running.store(false, Ordering::SeqCst);
        self.loop_running.store(false, Ordering::SeqCst);

        if let Some(accept) = task.take() {
            let _ = accept.shutdown.send(());
            let abort = accept.handle.abort_handle();
            if timeout(STOP_GRACE, accept.handle).await.is_err() {
                tracing::warn!("accept loop did not exit in time, aborting");
                abort.abort();
            }
        }

        let closed = self.registry.close_all().await;
        tracing::info!(notified = report.delivered, closed, "server stopped");
        Ok(())
    }

    pub async fn status(&self) -> ServerStatus {
        let task = self.task.lock().await;
        ServerStatus {
            server_running: self.is_running(),
            loop_running: self.loop_running.load(Ordering::SeqCst),
            loop_alive: task.as_ref().is_some_and(|t| !t.handle.is_finished()),
            sessions: self.registry.len().await,
            local_addr: task.as_ref().map(|t| t.local_addr),
        }
    }

    /// Reset the loop-running flag to whether the accept task is actually
    /// alive. Returns the status as it was before the reset.
    pub async fn reconcile(&self) -> ServerStatus {
        let status = self.status().await;
        if !status.in_sync() {
            tracing::warn!(
                flag = status.loop_running,
                alive = status.loop_alive,
                "accept loop status mismatch, resetting flag"
            );
            self.loop_running.store(status.loop_alive, Ordering::SeqCst);
        }
        status
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

async fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    let bind_err = |e| ServerError::Bind(addr.to_string(), e);

    let sock_addr = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| ServerError::Resolve(addr.to_string()))?;

    let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&sock_addr.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

// ── Accept loop ───────────────────────────────────────────────────────────────

struct AcceptLoop {
    listener: TcpListener,
    registry: SharedRegistry,
    session: SessionConfig,
    server_running: Arc<AtomicBool>,
    loop_running: Arc<AtomicBool>,
    shutdown: broadcast::Receiver<()>,
    handshakes: JoinSet<()>,
}

impl AcceptLoop {
    async fn run(mut self) {
        tracing::info!("waiting for clients");

        while self.loop_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.recv() => break,

                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let handshake = Handshake {
                            registry: self.registry.clone(),
                            session: self.session.clone(),
                        };
                        self.handshakes.spawn(handshake.run(stream, peer_addr));
                    }
                    // Listener torn down under us during stop.
                    Err(_) if !self.server_running.load(Ordering::SeqCst) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },

                // Reap finished handshakes.
                Some(_) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {}
            }
        }

        if !self.handshakes.is_empty() {
            tracing::debug!(pending = self.handshakes.len(), "aborting handshakes in flight");
        }
        self.handshakes.shutdown().await;
        tracing::debug!("accept loop exited");
    }
}

/// One connection's name handshake. Runs in its own task so a silent peer
/// only ever holds up itself.
struct Handshake {
    registry: SharedRegistry,
    session: SessionConfig,
}

impl Handshake {
    async fn run(self, stream: TcpStream, peer_addr: SocketAddr) {
        let mut conn = Connection::new(stream, peer_addr, self.session.max_frame_bytes);
        let io_timeout = self.session.io_timeout();

        let frame = match timeout(self.session.handshake_timeout(), conn.read_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::debug!(peer = %peer_addr, "peer closed before handshake");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_addr, error = %e, "handshake read failed");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "client timed out during handshake");
                let _ = timeout(io_timeout, conn.write_frame(TIMEOUT_NOTICE)).await;
                conn.shutdown().await;
                return;
            }
        };

        let name = match parse_handshake_name(&frame) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "handshake rejected");
                return;
            }
        };

        let session = Session::new(self.registry.next_id(), conn, name, io_timeout);
        let Some(session) = self.registry.insert(session).await else {
            tracing::debug!(peer = %peer_addr, "server stopped during handshake");
            return;
        };
        tracing::info!(
            name = session.name(),
            peer = %peer_addr,
            id = session.id(),
            "client connected"
        );
    }
}
