//! Master/slave control plane over a line-framed TCP connection.
//!
//! Architecture:
//! - `protocol.rs` - message tokens and parsing
//! - `connection.rs` - framed socket with reply timeouts
//! - `master.rs` - peer session state machine run by the master
//! - `slave.rs` - listener that serves the master's commands
//! - `monitor.rs` - per-output crash watchdog used by both roles

mod connection;
mod error;
mod master;
pub mod monitor;
mod protocol;
mod slave;

pub use connection::Connection;
pub use error::SyncError;
pub use master::{wait_for_peer, MasterSettings, PeerSession, PeerStatus, SessionPhase};
pub use protocol::Message;
pub use slave::{ListenerSettings, SyncListener};
