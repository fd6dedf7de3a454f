//! Roster wire format — framing and control verbs.
//!
//! Every message on a peer connection is one line of UTF-8 text terminated
//! by `\n`. The first line a peer sends is its declared name; every line
//! after that is a control verb with optional space-separated arguments.
//!
//! Frames are capped at `MAX_FRAME` bytes. Anything past the cap is dropped
//! up to the next delimiter; long lines are truncated, never reassembled.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Maximum frame size in bytes, not including the delimiter.
pub const MAX_FRAME: usize = 1024;

/// Frame delimiter.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Window a new connection has to declare its name, in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Bound on steady-state sends and receives, in seconds.
pub const IO_TIMEOUT_SECS: u64 = 5;

/// Sent to a peer that missed the handshake window, right before the
/// connection is closed.
pub const TIMEOUT_NOTICE: &str = "Request Timed out";

/// Tolerance when matching an echoed `t1` against the one we sent.
/// Timestamps travel with microsecond precision.
const TIMESTAMP_EPSILON: f64 = 1e-5;

// ── Framing ───────────────────────────────────────────────────────────────────

/// Splits a byte stream into newline-delimited text frames.
///
/// The decoder keeps only the truncation state; the caller owns the buffer
/// and appends whatever the socket yields before calling `decode`.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame: usize,
    /// Set after a truncated frame until the next delimiter is consumed.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.max(1),
            discarding: false,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Pull the next complete frame out of `src`, if one is buffered.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            let newline = src.iter().position(|b| *b == FRAME_DELIMITER);

            if self.discarding {
                match newline {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return None;
                    }
                }
            }

            return match newline {
                Some(pos) if pos <= self.max_frame => {
                    let line = src.split_to(pos + 1);
                    Some(frame_text(&line[..pos]))
                }
                // Oversized: deliver the head, drop the tail.
                Some(_) => Some(self.truncate(src)),
                None if src.len() > self.max_frame => Some(self.truncate(src)),
                None => None,
            };
        }
    }

    fn truncate(&mut self, src: &mut BytesMut) -> String {
        let head = src.split_to(self.max_frame);
        self.discarding = true;
        frame_text(&head)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME)
    }
}

fn frame_text(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Encode one frame. Embedded newlines would split the message on the
/// receiving side, so they are flattened to spaces.
pub fn encode_frame(text: &str) -> Bytes {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend(
        text.bytes()
            .map(|b| if b == b'\n' || b == b'\r' { b' ' } else { b }),
    );
    out.push(FRAME_DELIMITER);
    Bytes::from(out)
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Interpret the first frame on a connection as the peer's declared name.
pub fn parse_handshake_name(frame: &str) -> Result<String, WireError> {
    let name = frame.trim();
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    Ok(name.to_string())
}

// ── Control verbs ─────────────────────────────────────────────────────────────

/// A control message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Server → peer: `ping <t1>`.
    Ping { t1: f64 },
    /// Peer → server: `ping <t1> <t2>`, the ping with the peer's clock appended.
    PingEcho { t1: f64, t2: f64 },
    /// Liveness probe. No reply expected.
    ConnTest,
    /// Sent right before the server closes the connection.
    Kick,
    /// Broadcast when the server shuts down.
    Stop,
}

impl ControlMessage {
    pub fn verb(&self) -> &'static str {
        match self {
            ControlMessage::Ping { .. } | ControlMessage::PingEcho { .. } => "ping",
            ControlMessage::ConnTest => "conntest",
            ControlMessage::Kick => "kick",
            ControlMessage::Stop => "stop",
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(text: &str) -> Result<Self, WireError> {
        let mut tokens = text.split_whitespace();
        let verb = tokens.next().ok_or(WireError::Empty)?;
        let args: Vec<&str> = tokens.collect();

        match (verb, args.as_slice()) {
            ("ping", [t1]) => Ok(ControlMessage::Ping {
                t1: parse_timestamp(t1)?,
            }),
            ("ping", [t1, t2]) => Ok(ControlMessage::PingEcho {
                t1: parse_timestamp(t1)?,
                t2: parse_timestamp(t2)?,
            }),
            ("ping", []) => Err(WireError::MissingTimestamp),
            ("conntest", []) => Ok(ControlMessage::ConnTest),
            ("kick", []) => Ok(ControlMessage::Kick),
            ("stop", []) => Ok(ControlMessage::Stop),
            ("ping" | "conntest" | "kick" | "stop", _) => {
                Err(WireError::UnexpectedArguments(text.trim().to_string()))
            }
            (other, _) => Err(WireError::UnknownVerb(other.to_string())),
        }
    }

    /// Build the peer's answer to a `ping`: the same message with `t2` appended.
    pub fn echo(&self, t2: f64) -> Option<ControlMessage> {
        match self {
            ControlMessage::Ping { t1 } => Some(ControlMessage::PingEcho { t1: *t1, t2 }),
            _ => None,
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Ping { t1 } => write!(f, "ping {t1:.6}"),
            ControlMessage::PingEcho { t1, t2 } => write!(f, "ping {t1:.6} {t2:.6}"),
            other => f.write_str(other.verb()),
        }
    }
}

fn parse_timestamp(token: &str) -> Result<f64, WireError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| WireError::BadTimestamp(token.to_string()))
}

/// Seconds since the Unix epoch on the local clock.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── Round-trip time ───────────────────────────────────────────────────────────

/// The three legs of a ping measurement, in milliseconds.
///
/// `t1` is taken on the server clock and `t2` on the peer's, with no skew
/// correction. The split between the two legs is only meaningful when both
/// clocks are synchronized; the total is not affected by a constant offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTrip {
    pub send_ms: f64,
    pub recv_ms: f64,
    pub round_trip_ms: f64,
}

impl RoundTrip {
    /// `t1` server send, `t2` peer echo, `t3` server receipt (seconds).
    pub fn from_timestamps(t1: f64, t2: f64, t3: f64) -> Self {
        let send_ms = round2((t2 - t1) * 1000.0);
        let recv_ms = round2((t3 - t2) * 1000.0);
        Self {
            send_ms,
            recv_ms,
            round_trip_ms: round2(send_ms + recv_ms),
        }
    }

    /// Parse a peer's echo of `ping <sent_t1>` received at `t3`.
    pub fn from_echo(reply: &str, sent_t1: f64, t3: f64) -> Result<Self, WireError> {
        match ControlMessage::parse(reply)? {
            ControlMessage::PingEcho { t1, t2 } => {
                if (t1 - sent_t1).abs() > TIMESTAMP_EPSILON {
                    return Err(WireError::EchoMismatch {
                        sent: sent_t1,
                        echoed: t1,
                    });
                }
                Ok(Self::from_timestamps(t1, t2, t3))
            }
            other => Err(WireError::NotAnEcho(other.verb().to_string())),
        }
    }
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting a frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("empty name in handshake")]
    EmptyName,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("ping without timestamp")]
    MissingTimestamp,

    #[error("bad timestamp: {0:?}")]
    BadTimestamp(String),

    #[error("unexpected arguments: {0:?}")]
    UnexpectedArguments(String),

    #[error("expected ping echo, got {0}")]
    NotAnEcho(String),

    #[error("echo carries t1={echoed:.6}, sent t1={sent:.6}")]
    EchoMismatch { sent: f64, echoed: f64 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_lines_and_keeps_partial_tail() {
        let mut dec = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"alice\nconntest\npi"[..]);

        assert_eq!(dec.decode(&mut buf).as_deref(), Some("alice"));
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("conntest"));
        assert_eq!(dec.decode(&mut buf), None);
        assert_eq!(&buf[..], b"pi");

        buf.extend_from_slice(b"ng 1.5\r\n");
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("ping 1.5"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_truncates_oversized_frame_and_resyncs() {
        let mut dec = FrameDecoder::new(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef\nstop\n"[..]);

        assert_eq!(dec.decode(&mut buf).as_deref(), Some("01234567"));
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("stop"));
        assert_eq!(dec.decode(&mut buf), None);
    }

    #[test]
    fn decoder_truncates_before_delimiter_arrives() {
        let mut dec = FrameDecoder::new(4);
        let mut buf = BytesMut::from(&b"abcdefg"[..]);

        assert_eq!(dec.decode(&mut buf).as_deref(), Some("abcd"));
        assert_eq!(dec.decode(&mut buf), None);
        assert!(buf.is_empty());

        // Remainder of the long line is still dropped once it shows up.
        buf.extend_from_slice(b"hij\nkick\n");
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("kick"));
    }

    #[test]
    fn frame_of_exactly_max_size_is_kept_whole() {
        let mut dec = FrameDecoder::new(4);
        let mut buf = BytesMut::from(&b"abcd"[..]);
        assert_eq!(dec.decode(&mut buf), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("abcd"));
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let mut dec = FrameDecoder::default();
        let mut buf = BytesMut::from(&b"bo\xffb\n"[..]);
        assert_eq!(dec.decode(&mut buf).as_deref(), Some("bo\u{fffd}b"));
    }

    #[test]
    fn encode_frame_appends_delimiter_and_flattens_newlines() {
        assert_eq!(&encode_frame("stop")[..], b"stop\n");
        assert_eq!(&encode_frame("a\nb")[..], b"a b\n");
    }

    #[test]
    fn handshake_name_is_trimmed_and_required() {
        assert_eq!(parse_handshake_name("  laptop-7 ").unwrap(), "laptop-7");
        assert_eq!(parse_handshake_name("   "), Err(WireError::EmptyName));
    }

    #[test]
    fn parses_every_verb() {
        assert_eq!(ControlMessage::parse("conntest"), Ok(ControlMessage::ConnTest));
        assert_eq!(ControlMessage::parse("kick"), Ok(ControlMessage::Kick));
        assert_eq!(ControlMessage::parse(" stop "), Ok(ControlMessage::Stop));
        assert_eq!(
            ControlMessage::parse("ping 100.5"),
            Ok(ControlMessage::Ping { t1: 100.5 })
        );
        assert_eq!(
            ControlMessage::parse("ping 100.5 100.75"),
            Ok(ControlMessage::PingEcho { t1: 100.5, t2: 100.75 })
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        assert_eq!(ControlMessage::parse(""), Err(WireError::Empty));
        assert_eq!(ControlMessage::parse("ping"), Err(WireError::MissingTimestamp));
        assert!(matches!(
            ControlMessage::parse("ping abc"),
            Err(WireError::BadTimestamp(_))
        ));
        assert!(matches!(
            ControlMessage::parse("ping NaN"),
            Err(WireError::BadTimestamp(_))
        ));
        assert!(matches!(
            ControlMessage::parse("kick now"),
            Err(WireError::UnexpectedArguments(_))
        ));
        assert!(matches!(
            ControlMessage::parse("beep"),
            Err(WireError::UnknownVerb(v)) if v == "beep"
        ));
    }

    #[test]
    fn ping_renders_microsecond_timestamps() {
        let ping = ControlMessage::Ping { t1: 1700000000.25 };
        assert_eq!(ping.encode(), "ping 1700000000.250000");
        let echo = ping.echo(1700000000.5).unwrap();
        assert_eq!(echo.encode(), "ping 1700000000.250000 1700000000.500000");
        assert_eq!(ControlMessage::Stop.echo(1.0), None);
    }

    #[test]
    fn round_trip_from_timestamps() {
        let rtt = RoundTrip::from_timestamps(100.000, 100.010, 100.025);
        assert_eq!(rtt.send_ms, 10.0);
        assert_eq!(rtt.recv_ms, 15.0);
        assert_eq!(rtt.round_trip_ms, 25.0);
    }

    #[test]
    fn round_trip_from_echo_checks_t1() {
        let rtt = RoundTrip::from_echo("ping 100.000000 100.010000", 100.0, 100.025).unwrap();
        assert_eq!(rtt.round_trip_ms, 25.0);

        assert!(matches!(
            RoundTrip::from_echo("ping 99.000000 100.010000", 100.0, 100.025),
            Err(WireError::EchoMismatch { .. })
        ));
        assert!(matches!(
            RoundTrip::from_echo("conntest", 100.0, 100.025),
            Err(WireError::NotAnEcho(_))
        ));
        assert!(RoundTrip::from_echo("ping 100.0", 100.0, 100.025).is_err());
    }

    #[test]
    fn skewed_clock_shows_up_as_negative_leg() {
        // Peer clock 50 ms behind: legs are skewed, total still adds up.
        let rtt = RoundTrip::from_timestamps(10.0, 9.96, 10.02);
        assert_eq!(rtt.send_ms, -40.0);
        assert_eq!(rtt.recv_ms, 60.0);
        assert_eq!(rtt.round_trip_ms, 20.0);
    }

    #[test]
    fn unix_timestamp_is_after_2020() {
        assert!(unix_timestamp() > 1_577_836_800.0);
    }
}
