//! Player remote-control commands.
//!
//! mpv speaks JSON IPC (https://mpv.io/manual/master/#json-ipc); VLC's `rc`
//! interface takes one plain-text command per line.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Global request ID counter for unique command identification.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for MPV commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Player-independent control command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteCommand {
  Play,
  Pause,
  /// Seek to an absolute position in whole seconds.
  Seek(u32),
  /// Cheap query used to detect a hung player.
  Probe,
}

impl RemoteCommand {
  pub fn to_mpv(self) -> MpvCommand {
    match self {
      RemoteCommand::Play => MpvCommand::set_pause(false),
      RemoteCommand::Pause => MpvCommand::set_pause(true),
      RemoteCommand::Seek(secs) => MpvCommand::seek(secs as f64),
      RemoteCommand::Probe => MpvCommand::get_property("pid"),
    }
  }

  pub fn to_rc_line(self) -> String {
    match self {
      RemoteCommand::Play => "play".to_string(),
      RemoteCommand::Pause => "pause".to_string(),
      RemoteCommand::Seek(secs) => format!("seek {}", secs),
      RemoteCommand::Probe => "get_time".to_string(),
    }
  }
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<serde_json::Value>,
  pub request_id: i64,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Seek to absolute position in seconds.
  pub fn seek(time: f64) -> Self {
    Self::new(vec!["seek".into(), time.into(), "absolute".into()])
  }

  /// Set pause state.
  pub fn set_pause(paused: bool) -> Self {
    Self::new(vec!["set_property".into(), "pause".into(), paused.into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  pub data: Option<serde_json::Value>,
  pub request_id: i64,
}

impl MpvResponse {
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Asynchronous event from MPV (end-file, idle, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  pub event: String,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub reason: Option<String>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    if line.contains("request_id") {
      Ok(MpvMessage::Response(serde_json::from_str(line)?))
    } else {
      Ok(MpvMessage::Event(serde_json::from_str(line)?))
    }
  }
}
