//! rosterd — Roster control-plane server with an interactive console.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use roster_core::config::RosterConfig;
use roster_services::{refresh_loop, Registry, Server};

mod command;
mod console;

use command::{Command, ParseError};
use console::{Console, Flow};

fn print_usage() {
    println!("Usage: rosterd [--bind <host:port>]");
    println!();
    println!("Options:");
    println!("  --bind <host:port>   Listen address (default: from config, 127.0.0.1:8080)");
    println!();
    println!("{}", command::usage());
}

/// Split `host:port`, keeping IPv6 brackets intact.
fn parse_bind(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .context("--bind expects host:port")?;
    let port = port.parse().context("--bind port must be a number")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

/// Run one command in its own task, racing it against `interrupt`.
///
/// A panic in the command or an interrupt while it runs both stop the
/// server and end the console.
async fn dispatch<F>(console: &Console, cmd: Command, interrupt: F) -> Flow
where
    F: Future<Output = ()>,
{
    let runner = console.clone();
    let mut task = tokio::spawn(async move { runner.execute(cmd).await });

    tokio::select! {
        joined = &mut task => match joined {
            Ok(flow) => flow,
            Err(e) => {
                tracing::error!(error = %e, "command failed unexpectedly");
                console.shutdown().await;
                Flow::Exit
            }
        },
        _ = interrupt => {
            tracing::info!("interrupt received");
            task.abort();
            console.shutdown().await;
            Flow::Exit
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = RosterConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = RosterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RosterConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => {}
        ["--bind", value] => {
            let (host, port) = parse_bind(value)?;
            config.network.bind_addr = host;
            config.network.port = port;
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            return Ok(());
        }
        other => {
            eprintln!("Unknown arguments: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }

    tracing::info!(addr = %config.network.listen_addr(), "rosterd ready, type `start` to listen");

    let registry = Registry::shared();
    let server = Arc::new(Server::new(
        config.network.clone(),
        config.session.clone(),
        registry.clone(),
    ));

    if let Some(every) = config.liveness.refresh_interval() {
        tracing::info!(secs = every.as_secs(), "periodic liveness refresh enabled");
        tokio::spawn(refresh_loop(registry.clone(), every));
    }

    let console = Console::new(server);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!(">>> ");
        let _ = std::io::stdout().flush();

        tokio::select! {
            _ = interrupted() => {
                tracing::info!("interrupt received");
                console.shutdown().await;
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let cmd = match Command::parse(&line) {
                        Ok(cmd) => cmd,
                        Err(ParseError::Empty) => continue,
                        Err(e) => {
                            tracing::error!("{e}");
                            continue;
                        }
                    };
                    if dispatch(&console, cmd, interrupted()).await == Flow::Exit {
                        break;
                    }
                }
                Ok(None) => {
                    console.shutdown().await;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read console input");
                    console.shutdown().await;
                    break;
                }
            },
        }
    }

    // The blocking stdin reader would otherwise keep the runtime alive.
    std::process::exit(0)
}
