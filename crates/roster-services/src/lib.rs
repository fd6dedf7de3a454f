//! roster-services — sessions, the registry, and the accepting server.

pub mod connection;
pub mod registry;
pub mod server;
pub mod session;

pub use connection::Connection;
pub use registry::{refresh_loop, BroadcastReport, Registry, SessionInfo, SharedRegistry};
pub use server::{Server, ServerError, ServerStatus};
pub use session::{PingState, Session, SessionError, SessionId};
