//! roster-core — wire protocol and configuration.
//! All other Roster crates depend on this one.

pub mod config;
pub mod wire;

pub use config::RosterConfig;
pub use wire::{ControlMessage, FrameDecoder, RoundTrip, WireError};
