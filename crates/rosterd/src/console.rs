//! Operator console — runs parsed commands against the server and registry.

use std::sync::Arc;

use roster_core::wire::RoundTrip;
use roster_services::{PingState, Server, ServerStatus, Session, SessionInfo};

use crate::command::{usage, Command, Lookup, PingTarget};

/// Whether the console loop should keep reading commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Clone)]
pub struct Console {
    server: Arc<Server>,
}

impl Console {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub async fn execute(&self, cmd: Command) -> Flow {
        match cmd {
            Command::Start => {
                // Failures are already logged by the server.
                let _ = self.server.start().await;
            }
            Command::Stop => {
                let _ = self.server.stop().await;
            }
            Command::List => {
                println!("{}", render_list(&self.server.registry().list().await));
            }
            Command::Stat => {
                let status = self.server.reconcile().await;
                println!("{}", render_status(&status));
            }
            Command::Ping(target) => self.ping(target).await,
            Command::Resolve(lookup) => self.resolve(lookup).await,
            Command::Kick(lookup) => self.kick(lookup).await,
            Command::Refresh => {
                let removed = self.server.registry().refresh().await;
                let remaining = self.server.registry().len().await;
                tracing::info!(
                    removed = removed.len(),
                    remaining = remaining,
                    "refreshed client list"
                );
            }
            Command::Clear => print!("\x1B[2J\x1B[1;1H"),
            Command::Help => println!("{}", usage()),
            Command::Exit => {
                self.shutdown().await;
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Stop the server if it is running. Used on exit, interrupt, and
    /// after an unexpected failure.
    pub async fn shutdown(&self) {
        if self.server.is_running() {
            let _ = self.server.stop().await;
        }
        tracing::info!("exiting");
    }

    async fn find(&self, lookup: &Lookup) -> Option<Arc<Session>> {
        let registry = self.server.registry();
        match lookup {
            Lookup::Ip(ip) => registry.find_by_address(*ip).await,
            Lookup::Name(name) => registry.find_by_name(name).await,
        }
    }

    async fn ping(&self, target: PingTarget) {
        let sessions = match target {
            PingTarget::All => {
                self.server.registry().refresh().await;
                self.server.registry().snapshot().await
            }
            PingTarget::One(lookup) => match self.find(&lookup).await {
                Some(session) => vec![session],
                None => {
                    tracing::warn!("client not found");
                    return;
                }
            },
        };

        if sessions.is_empty() {
            println!("No clients connected.");
            return;
        }

        for session in sessions {
            println!("Pinging {} [{}]", session.name(), session.ip());
            match session.ping().await {
                Ok(rtt) => println!("{}", render_ping(&rtt)),
                Err(e) => tracing::warn!(
                    name = session.name(),
                    peer = %session.addr(),
                    error = %e,
                    "ping failed for client"
                ),
            }
        }
        println!("  (per-leg times assume client and server clocks agree)");
    }

    async fn resolve(&self, lookup: Lookup) {
        let found = self.find(&lookup).await;
        let line = match (&lookup, found) {
            (Lookup::Ip(ip), Some(s)) => format!("resolve ip {ip} => {}", s.name()),
            (Lookup::Ip(ip), None) => format!("resolve ip {ip} => None"),
            (Lookup::Name(name), Some(s)) => format!("resolve name {name} => {}", s.ip()),
            (Lookup::Name(name), None) => format!("resolve name {name} => None"),
        };
        println!("{line}");
    }

    async fn kick(&self, lookup: Lookup) {
        let registry = self.server.registry();
        let kicked = match &lookup {
            Lookup::Ip(ip) => registry.kick(*ip).await,
            Lookup::Name(name) => match registry.find_by_name(name).await {
                Some(session) => registry.kick_session(&session).await,
                None => false,
            },
        };
        if !kicked {
            tracing::warn!(?lookup, "client not found");
        }
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

pub fn render_list(sessions: &[SessionInfo]) -> String {
    let mut out = format!(
        "{:>4}  {:32}{:40}{:>6}  {:>10}  {}",
        "ID", "Name", "IP Address", "Port", "Connected", "Last ping"
    );
    for s in sessions {
        out.push_str(&format!(
            "\n{:>4}  {:32}{:40}{:>6}  {:>9}s  {}",
            s.id,
            s.name,
            s.addr.ip().to_string(),
            s.addr.port(),
            s.connected_secs,
            ping_summary(&s.ping)
        ));
    }
    if sessions.is_empty() {
        out.push_str("\n(no clients connected)");
    }
    out
}

fn ping_summary(state: &PingState) -> String {
    match state {
        PingState::Idle => "-".to_string(),
        PingState::AwaitingEcho { .. } => "waiting".to_string(),
        PingState::Complete(rtt) => format!("{:.2} ms", rtt.round_trip_ms),
        PingState::Failed(reason) => format!("failed ({reason})"),
    }
}

pub fn render_status(status: &ServerStatus) -> String {
    let addr = status
        .local_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        "═══════════════════════════════════════".to_string(),
        "  Server Status".to_string(),
        "═══════════════════════════════════════".to_string(),
        format!("  Server running    : {}", status.server_running),
        format!("  Accept loop flag  : {}", status.loop_running),
        format!("  Accept loop alive : {}", status.loop_alive),
        format!("  Clients connected : {}", status.sessions),
        format!("  Listening on      : {}", addr),
    ];
    if !status.in_sync() {
        lines.push("  ! accept loop flag did not match the task; it has been reset".to_string());
    }
    lines.join("\n")
}

pub fn render_ping(rtt: &RoundTrip) -> String {
    format!(
        "  Server -> Client           : {:.2} ms\n  Client -> Server           : {:.2} ms\n  Client -> Server -> Client : {:.2} ms",
        rtt.send_ms, rtt.recv_ms, rtt.round_trip_ms
    )
}
