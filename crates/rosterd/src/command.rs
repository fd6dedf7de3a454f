//! Operator command parsing.
//!
//! One console line parses into one `Command`. Target flags follow the
//! usual short/long pairs; when several are given, `-a` wins over `-i`,
//! which wins over `-n`. Unrecognised trailing words on argument-less
//! commands are ignored.

use std::net::IpAddr;

/// How an operator names a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Ip(IpAddr),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingTarget {
    All,
    One(Lookup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    List,
    Stat,
    Ping(PingTarget),
    Resolve(Lookup),
    Kick(Lookup),
    Refresh,
    Clear,
    Exit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0} (try `help`)")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    MissingTarget(&'static str),
    #[error("{0} requires a value")]
    MissingValue(String),
    #[error("invalid IP address: {0}")]
    InvalidIp(String),
    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

const PING_USAGE: &str = "ping [-a | -i IP | -n NAME]";
const RESOLVE_USAGE: &str = "resolve [-i IP | -n NAME]";
const KICK_USAGE: &str = "kick [-i IP | -n NAME]";

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseError::Empty)?.to_lowercase();
        let args: Vec<&str> = words.collect();

        match verb.as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "list" => Ok(Command::List),
            "stat" => Ok(Command::Stat),
            "refresh" => Ok(Command::Refresh),
            "clear" | "cls" => Ok(Command::Clear),
            "exit" => Ok(Command::Exit),
            "help" => Ok(Command::Help),
            "ping" => {
                let flags = Flags::parse(&args, true)?;
                if flags.all {
                    return Ok(Command::Ping(PingTarget::All));
                }
                flags
                    .lookup()?
                    .map(|l| Command::Ping(PingTarget::One(l)))
                    .ok_or(ParseError::MissingTarget(PING_USAGE))
            }
            "resolve" => Flags::parse(&args, false)?
                .lookup()?
                .map(Command::Resolve)
                .ok_or(ParseError::MissingTarget(RESOLVE_USAGE)),
            "kick" => Flags::parse(&args, false)?
                .lookup()?
                .map(Command::Kick)
                .ok_or(ParseError::MissingTarget(KICK_USAGE)),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Default)]
struct Flags<'a> {
    all: bool,
    ip: Option<&'a str>,
    name: Option<&'a str>,
}

impl<'a> Flags<'a> {
    fn parse(args: &[&'a str], allow_all: bool) -> Result<Self, ParseError> {
        let mut flags = Flags::default();
        let mut iter = args.iter();
        while let Some(&arg) = iter.next() {
            match arg {
                "-a" | "--all" if allow_all => flags.all = true,
                "-i" | "--ip" => {
                    flags.ip = Some(*iter.next().ok_or_else(|| ParseError::MissingValue(arg.into()))?);
                }
                "-n" | "--name" => {
                    flags.name = Some(*iter.next().ok_or_else(|| ParseError::MissingValue(arg.into()))?);
                }
                other => return Err(ParseError::UnexpectedArgument(other.to_string())),
            }
        }
        Ok(flags)
    }

    fn lookup(&self) -> Result<Option<Lookup>, ParseError> {
        if let Some(ip) = self.ip {
            return ip
                .parse()
                .map(|ip| Some(Lookup::Ip(ip)))
                .map_err(|_| ParseError::InvalidIp(ip.to_string()));
        }
        Ok(self.name.map(|n| Lookup::Name(n.to_string())))
    }
}

pub fn usage() -> String {
    [
        "Commands:",
        "  start                        Start listening for clients",
        "  stop                         Tell clients to stop and close the listener",
        "  list                         List connected clients",
        "  stat                         Show server and accept-loop status",
        "  ping -a | -i IP | -n NAME    Measure round-trip time",
        "  resolve -i IP | -n NAME      Map an IP to a name, or a name to an IP",
        "  kick -i IP | -n NAME         Disconnect a client",
        "  refresh                      Probe clients and drop dead ones",
        "  clear                        Clear the screen",
        "  exit                         Stop the server and quit",
        "  help                         Show this message",
    ]
    .join("\n")
}
