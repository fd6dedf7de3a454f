//! Registry — the authoritative set of connected sessions.
//!
//! Sessions are kept in connection order behind one lock. Nothing holds
//! the lock across network I/O: operations that talk to peers take a
//! snapshot, do the I/O, then apply removals by session ID under the lock.
//! Sessions that arrive in the meantime are never touched.
//!
//! `close_all` also closes the registry: until `reopen`, `insert` turns
//! sessions away. Both flip under the same lock, so a handshake that
//! finishes late cannot slip a session in after a shutdown.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use roster_core::wire::ControlMessage;

use crate::session::{PingState, Session, SessionError, SessionId};

pub type SharedRegistry = Arc<Registry>;

/// Point-in-time view of one session, for listings.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub addr: SocketAddr,
    pub connected_secs: u64,
    pub ping: PingState,
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<Vec<Arc<Session>>>,
    next_id: AtomicU64,
    /// Only read or written with `sessions` locked.
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Self::new())
    }

    /// Allocate a connection ID for a session about to be inserted.
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Append a session. A stale entry with the same (IP, port) is evicted
    /// first; names are allowed to repeat.
    ///
    /// Returns `None` if the registry is closed. The session is then told
    /// to `stop` and closed.
    pub async fn insert(&self, session: Session) -> Option<Arc<Session>> {
        let session = Arc::new(session);
        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            if self.closed.load(Ordering::Acquire) {
                drop(sessions);
                tracing::debug!(
                    name = session.name(),
                    peer = %session.addr(),
                    "registry closed, turning session away"
                );
                let _ = session.send_control(&ControlMessage::Stop).await;
                session.close().await;
                return None;
            }
            let (stale, kept): (Vec<_>, Vec<_>) = sessions
                .drain(..)
                .partition(|s| s.addr() == session.addr());
            *sessions = kept;
            sessions.push(session.clone());
            stale
        };
        for old in evicted {
            tracing::warn!(
                name = old.name(),
                peer = %old.addr(),
                "evicting stale session with same address"
            );
            old.close().await;
        }
        Some(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Current sessions in connection order, without probing.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.clone()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.snapshot()
            .await
            .iter()
            .map(|s| SessionInfo {
                id: s.id(),
                name: s.name().to_string(),
                addr: s.addr(),
                connected_secs: s.connected_at().elapsed().as_secs(),
                ping: s.ping_state(),
            })
            .collect()
    }

    /// Probe every session and drop the dead ones. Returns what was removed.
    pub async fn refresh(&self) -> Vec<Arc<Session>> {
        let snapshot = self.snapshot().await;
        let results = join_all(snapshot.iter().map(|s| async move { (s.id(), s.probe().await) })).await;

        let dead: HashMap<SessionId, SessionError> = results
            .into_iter()
            .filter_map(|(id, r)| r.err().map(|e| (id, e)))
            .collect();
        self.prune(dead).await
    }

    /// First session (in connection order) from `ip`, after a refresh.
    pub async fn find_by_address(&self, ip: IpAddr) -> Option<Arc<Session>> {
        self.refresh().await;
        self.first_where(|s| s.ip() == ip).await
    }

    /// First session (in connection order) named `name`, after a refresh.
    pub async fn find_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.refresh().await;
        self.first_where(|s| s.name() == name).await
    }

    async fn first_where<P>(&self, pred: P) -> Option<Arc<Session>>
    where
        P: Fn(&Session) -> bool,
    {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|s| pred(s))
            .cloned()
    }

    /// Refresh, then send `message` to every remaining session. A failed
    /// send drops that session and does not stop the rest.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        self.refresh().await;
        let snapshot = self.snapshot().await;
        let results = join_all(snapshot.iter().map(|s| async move { (s.id(), s.send(message).await) })).await;

        let mut report = BroadcastReport::default();
        let mut dead = HashMap::new();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    dead.insert(id, e);
                }
            }
        }
        self.prune(dead).await;

        tracing::debug!(
            message,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast"
        );
        report
    }

    /// Refresh, then kick the first session from `ip`. Returns whether a
    /// session was removed; absence is not an error.
    pub async fn kick(&self, ip: IpAddr) -> bool {
        match self.find_by_address(ip).await {
            Some(session) => self.kick_session(&session).await,
            None => false,
        }
    }

    /// Send `kick` to this exact session, close it, and remove it.
    pub async fn kick_session(&self, session: &Arc<Session>) -> bool {
        if let Err(e) = session.send_control(&ControlMessage::Kick).await {
            tracing::debug!(name = session.name(), error = %e, "kick notice not delivered");
        }
        let removed = self.remove(session.id()).await.is_some();
        if removed {
            tracing::info!(name = session.name(), peer = %session.addr(), "client kicked");
        }
        removed
    }

    /// Remove and close one session by ID.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let pos = sessions.iter().position(|s| s.id() == id)?;
            sessions.remove(pos)
        };
        removed.close().await;
        Some(removed)
    }

    /// Close and remove every session, and stop admitting new ones until
    /// `reopen`. Returns how many there were.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            self.closed.store(true, Ordering::Release);
            sessions.drain(..).collect()
        };
        for s in &drained {
            s.close().await;
        }
        drained.len()
    }

    /// Admit sessions again after `close_all`.
    pub async fn reopen(&self) {
        let _sessions = self.sessions.lock().await;
        self.closed.store(false, Ordering::Release);
    }

    pub async fn is_closed(&self) -> bool {
        let _sessions = self.sessions.lock().await;
        self.closed.load(Ordering::Acquire)
    }

    async fn prune(&self, dead: HashMap<SessionId, SessionError>) -> Vec<Arc<Session>> {
        if dead.is_empty() {
            return Vec::new();
        }
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let (gone, kept): (Vec<_>, Vec<_>) = sessions
                .drain(..)
                .partition(|s| dead.contains_key(&s.id()));
            *sessions = kept;
            gone
        };
        for s in &removed {
            s.close().await;
            tracing::warn!(
                name = s.name(),
                peer = %s.addr(),
                reason = %dead[&s.id()],
                "client disconnected"
            );
        }
        removed
    }
}

/// Refresh the registry on a fixed interval.
///
/// Runs until the task is aborted.
pub async fn refresh_loop(registry: SharedRegistry, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = registry.refresh().await;
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "periodic refresh pruned sessions");
        }
    }
}
