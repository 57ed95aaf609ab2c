//! Control-plane vocabulary. One upper-case token per line.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
  /// master→slave: have local media ready.
  PrepareSync,
  Ready,
  NoVideo,
  /// master→slave: resync now and confirm.
  PlaySync,
  VideoStarted,
  /// master→slave: resync now, no precondition.
  SyncNow,
  Synced,
  /// master→slave: drift / liveness probe.
  CheckSync,
  NeedSync,
  InSync,
  /// Reachability probe.
  AreYouReady,
  Heartbeat,
  Alive,
}

impl Message {
  pub const ALL: [Message; 13] = [
    Message::PrepareSync,
    Message::Ready,
    Message::NoVideo,
    Message::PlaySync,
    Message::VideoStarted,
    Message::SyncNow,
    Message::Synced,
    Message::CheckSync,
    Message::NeedSync,
    Message::InSync,
    Message::AreYouReady,
    Message::Heartbeat,
    Message::Alive,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Message::PrepareSync => "PREPARE_SYNC",
      Message::Ready => "READY",
      Message::NoVideo => "NO_VIDEO",
      Message::PlaySync => "PLAY_SYNC",
      Message::VideoStarted => "VIDEO_STARTED",
      Message::SyncNow => "SYNC_NOW",
      Message::Synced => "SYNCED",
      Message::CheckSync => "CHECK_SYNC",
      Message::NeedSync => "NEED_SYNC",
      Message::InSync => "IN_SYNC",
      Message::AreYouReady => "ARE_YOU_READY",
      Message::Heartbeat => "HEARTBEAT",
      Message::Alive => "ALIVE",
    }
  }

  /// Whether the master may send this to the listener.
  pub fn is_request(self) -> bool {
    matches!(
      self,
      Message::PrepareSync
        | Message::PlaySync
        | Message::SyncNow
        | Message::CheckSync
        | Message::AreYouReady
        | Message::Heartbeat
    )
  }
}

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage(pub String);

impl FromStr for Message {
  type Err = UnknownMessage;

  /// Surrounding whitespace and line endings are ignored.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let token = s.trim();
    Message::ALL
      .into_iter()
      .find(|m| m.as_str() == token)
      .ok_or_else(|| UnknownMessage(token.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_ignores_line_endings() {
    assert_eq!("PREPARE_SYNC\r\n".parse::<Message>(), Ok(Message::PrepareSync));
    assert_eq!("  IN_SYNC".parse::<Message>(), Ok(Message::InSync));
  }

  #[test]
  fn test_tokens_are_distinct_and_parse_back() {
    for msg in Message::ALL {
      assert_eq!(msg.as_str().parse::<Message>(), Ok(msg));
    }
  }

  #[test]
  fn test_unknown_and_lowercase_are_rejected() {
    assert!("prepare_sync".parse::<Message>().is_err());
    assert!("PLAY".parse::<Message>().is_err());
    assert!("".parse::<Message>().is_err());
  }

  #[test]
  fn test_replies_are_not_requests() {
    assert!(Message::CheckSync.is_request());
    assert!(!Message::Ready.is_request());
    assert!(!Message::Alive.is_request());
  }
}
