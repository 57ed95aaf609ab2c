//! Control-plane error types.

use thiserror::Error;

use super::protocol::Message;

/// Everything that ends a control connection.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("Socket error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Connect to {0} timed out")]
  ConnectTimeout(String),

  #[error("No reply to {0} in time")]
  ReplyTimeout(Message),

  #[error("Connection closed by peer")]
  Closed,

  #[error("Malformed message: {0:?}")]
  Malformed(String),

  #[error("Unexpected reply to {sent}: {got}")]
  UnexpectedReply { sent: Message, got: Message },

  #[error("Peer has no video")]
  NoVideo,
}

impl SyncError {
  /// Protocol violations, as opposed to transport failures.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(self, SyncError::Malformed(_) | SyncError::UnexpectedReply { .. })
  }
}
