//! Roster integration test harness.
//!
//! Every test runs a real server on an ephemeral loopback port and drives it
//! with plain TCP clients, so nothing here needs privileges or fixed ports:
//!
//!   cargo test --test integration
//!
//! Each test owns its server and must stop it before returning.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use roster_core::config::{NetworkConfig, SessionConfig};
use roster_core::wire::ControlMessage;
use roster_services::{Registry, Server};

mod control;
mod lifecycle;
mod liveness;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A server bound to 127.0.0.1:0 with one-second timeouts.
pub fn test_server() -> Server {
    let network = NetworkConfig {
        bind_addr: "127.0.0.1".into(),
        port: 0,
    };
    let session = SessionConfig {
        handshake_timeout_secs: 1,
        io_timeout_secs: 1,
        max_frame_bytes: 1024,
    };
    Server::new(network, session, Registry::shared())
}

/// Poll until the registry holds exactly `n` sessions.
pub async fn wait_for_sessions(server: &Server, n: usize) -> Result<()> {
    for _ in 0..200 {
        if server.registry().len().await == n {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!(
        "expected {n} sessions, registry has {}",
        server.registry().len().await
    )
}

/// A line-oriented test peer.
pub struct Peer {
    pub lines: Lines<BufReader<OwnedReadHalf>>,
    pub write: OwnedWriteHalf,
    pub local: SocketAddr,
}

impl Peer {
    /// Connect without sending a name.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let local = stream.local_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
            local,
        })
    }

    /// Connect and complete the name handshake.
    pub async fn join(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut peer = Self::connect(addr).await?;
        peer.send(name).await?;
        Ok(peer)
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.write.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    /// Next line from the server, skipping liveness probes. `None` on EOF.
    pub async fn next_command(&mut self) -> Result<Option<String>> {
        let read = async {
            while let Some(line) = self.lines.next_line().await? {
                if line != ControlMessage::ConnTest.encode() {
                    return Ok(Some(line));
                }
            }
            Ok::<_, anyhow::Error>(None)
        };
        tokio::time::timeout(Duration::from_secs(3), read)
            .await
            .context("timed out waiting for the server")?
    }

    /// Answer pings until the server says stop or kick, then return the
    /// final verb.
    pub fn spawn_echo(mut self) -> JoinHandle<Result<String>> {
        tokio::spawn(async move {
            loop {
                let Some(line) = self.next_command().await? else {
                    bail!("server closed without a final verb");
                };
                match ControlMessage::parse(&line) {
                    Ok(ping @ ControlMessage::Ping { .. }) => {
                        if let Some(echo) = ping.echo(roster_core::wire::unix_timestamp()) {
                            self.send(&echo.encode()).await?;
                        }
                    }
                    Ok(ControlMessage::Stop) | Ok(ControlMessage::Kick) => return Ok(line),
                    _ => {}
                }
            }
        })
    }
}
