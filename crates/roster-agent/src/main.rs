//! roster-agent — reference peer for a Roster server.
//!
//! Connects, declares a name, then answers the server's control verbs
//! until told to stop or kicked.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use roster_core::wire::{
    encode_frame, unix_timestamp, ControlMessage, FrameDecoder, DEFAULT_PORT, MAX_FRAME,
    TIMEOUT_NOTICE,
};

const DEFAULT_HOST: &str = "127.0.0.1";

/// What to do with one frame from the server.
#[derive(Debug, PartialEq)]
enum Action {
    Reply(String),
    Ignore,
    Exit(&'static str),
}

/// `now` is the local clock at receipt, used as `t2` in a ping echo.
fn respond(frame: &str, now: f64) -> Action {
    if frame == TIMEOUT_NOTICE {
        return Action::Exit("server timed out the handshake");
    }
    match ControlMessage::parse(frame) {
        Ok(ping @ ControlMessage::Ping { .. }) => match ping.echo(now) {
            Some(echo) => Action::Reply(echo.encode()),
            None => Action::Ignore,
        },
        Ok(ControlMessage::ConnTest) | Ok(ControlMessage::PingEcho { .. }) => Action::Ignore,
        Ok(ControlMessage::Kick) => Action::Exit("kicked by server"),
        Ok(ControlMessage::Stop) => Action::Exit("server stopped"),
        Err(e) => {
            tracing::debug!(frame, error = %e, "ignoring unrecognised frame");
            Action::Ignore
        }
    }
}

struct Agent {
    stream: TcpStream,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl Agent {
    async fn connect(host: &str, port: u16, name: &str) -> Result<Self> {
        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}, is rosterd started?"))?;
        stream
            .write_all(&encode_frame(name))
            .await
            .context("failed to send name")?;
        tracing::info!(host, port, name, "connected");
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(MAX_FRAME),
            decoder: FrameDecoder::default(),
        })
    }

    async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer) {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn run(mut self) -> Result<()> {
        while let Some(frame) = self.next_frame().await? {
            match respond(&frame, unix_timestamp()) {
                Action::Reply(text) => self.stream.write_all(&encode_frame(&text)).await?,
                Action::Ignore => {}
                Action::Exit(reason) => {
                    tracing::info!(reason, "disconnecting");
                    return Ok(());
                }
            }
        }
        tracing::info!("server closed the connection");
        Ok(())
    }
}

async fn prompt_name() -> Result<String> {
    use std::io::Write;
    print!("Enter Name: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read name")?;
    let name = line.trim().to_string();
    if name.is_empty() {
        bail!("a name is required");
    }
    Ok(name)
}

fn print_usage() {
    println!("Usage: roster-agent [--host <host>] [--port <port>] [NAME]");
    println!();
    println!("Options:");
    println!("  --host <host>   Server address (default: {})", DEFAULT_HOST);
    println!("  --port <port>   Server port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut host = DEFAULT_HOST.to_string();
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args.get(i).context("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let name = match remaining.as_slice() {
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            return Ok(());
        }
        [name] => name.to_string(),
        [] => prompt_name().await?,
        other => {
            eprintln!("Unexpected arguments: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    Agent::connect(&host, port, &name).await?.run().await
}
