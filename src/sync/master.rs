//! Master side: one persistent session to the slave.
//!
//! `Disconnected → Connecting → Handshake → Ready → SyncLoop`, and back to
//! `Disconnected` on any error, forever, until cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::error::SyncError;
use super::protocol::Message;
use crate::config::{AppConfig, SyncMode};
use crate::player::PlaybackGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
  Disconnected,
  Connecting,
  Handshake,
  Ready,
  SyncLoop,
}

/// Published on every transition.
#[derive(Debug, Clone)]
pub struct PeerStatus {
  pub phase: SessionPhase,
  /// True once the peer answered `READY`, until the connection drops.
  pub connected: bool,
  pub last_sync_sent_at: Option<Instant>,
}

impl Default for PeerStatus {
  fn default() -> Self {
    Self {
      phase: SessionPhase::Disconnected,
      connected: false,
      last_sync_sent_at: None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct MasterSettings {
  pub peer_address: String,
  pub connect_timeout: Duration,
  pub reply_timeout: Duration,
  /// Fixed delay between reconnection attempts.
  pub retry_interval: Duration,
  pub sync_interval: Duration,
  pub heartbeat_interval: Duration,
  pub mode: SyncMode,
}

impl MasterSettings {
  pub fn from_config(config: &AppConfig) -> Self {
    let t = &config.timing;
    Self {
      peer_address: config.peer_address(),
      connect_timeout: t.connect_timeout(),
      reply_timeout: t.reply_timeout(),
      retry_interval: t.retry_interval(),
      sync_interval: t.sync_interval(),
      heartbeat_interval: t.heartbeat_interval(),
      mode: config.sync_mode,
    }
  }
}

pub struct PeerSession {
  settings: MasterSettings,
  playback: Arc<PlaybackGroup>,
  status: watch::Sender<PeerStatus>,
}

impl PeerSession {
  pub fn new(settings: MasterSettings, playback: Arc<PlaybackGroup>) -> Self {
    let (status, _) = watch::channel(PeerStatus::default());
    Self {
      settings,
      playback,
      status,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
    self.status.subscribe()
  }

  fn set_phase(&self, phase: SessionPhase) {
    self.status.send_modify(|s| {
      s.phase = phase;
      if matches!(phase, SessionPhase::Disconnected | SessionPhase::Connecting) {
        s.connected = false;
      }
    });
  }

  fn mark_sync_sent(&self) {
    self.status.send_modify(|s| s.last_sync_sent_at = Some(Instant::now()));
  }

  /// Reconnect loop. Only returns once `cancel` fires.
  pub async fn run(self, cancel: CancellationToken) {
    log::info!("Master session targeting {}", self.settings.peer_address);

    loop {
      let result = tokio::select! {
        _ = cancel.cancelled() => break,
        result = self.run_connection() => result,
      };

      let e = match result {
        Ok(never) => match never {},
        Err(e) => e,
      };
      self.set_phase(SessionPhase::Disconnected);
      if e.is_protocol_violation() {
        log::error!("Protocol violation from {}: {}", self.settings.peer_address, e);
      } else {
        log::warn!("Peer session ended: {}", e);
      }

      log::info!("Reconnecting in {:?}", self.settings.retry_interval);
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(self.settings.retry_interval) => {}
      }
    }

    self.set_phase(SessionPhase::Disconnected);
    log::info!("Master session stopped");
  }

  async fn run_connection(&self) -> Result<std::convert::Infallible, SyncError> {
    let s = &self.settings;

    self.set_phase(SessionPhase::Connecting);
    let mut conn = Connection::connect(&s.peer_address, s.connect_timeout).await?;
    log::info!("Connected to peer {}", conn.peer());

    self.set_phase(SessionPhase::Handshake);
    match conn.request(Message::PrepareSync, s.reply_timeout).await? {
      Message::Ready => {}
      Message::NoVideo => return Err(SyncError::NoVideo),
      got => {
        return Err(SyncError::UnexpectedReply {
          sent: Message::PrepareSync,
          got,
        })
      }
    }

    self.status.send_modify(|st| {
      st.phase = SessionPhase::Ready;
      st.connected = true;
    });
    log::info!("Peer is ready, starting playback in sync");

    self.mark_sync_sent();
    match conn.request(Message::PlaySync, s.reply_timeout).await? {
      Message::VideoStarted => self.playback.resync().await,
      Message::NoVideo => return Err(SyncError::NoVideo),
      got => {
        return Err(SyncError::UnexpectedReply {
          sent: Message::PlaySync,
          got,
        })
      }
    }

    self.set_phase(SessionPhase::SyncLoop);
    self.sync_loop(&mut conn).await
  }

  async fn sync_loop(&self, conn: &mut Connection) -> Result<std::convert::Infallible, SyncError> {
    let s = &self.settings;
    let now = tokio::time::Instant::now();
    let mut sync_tick = interval_at(now + s.sync_interval, s.sync_interval);
    let mut heartbeat_tick = interval_at(now + s.heartbeat_interval, s.heartbeat_interval);
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = sync_tick.tick() => match s.mode {
          SyncMode::SyncNow => self.sync_now(conn).await?,
          SyncMode::CheckSync => match conn.request(Message::CheckSync, s.reply_timeout).await? {
            Message::NeedSync => {
              log::info!("Peer reports drift, resyncing both sides");
              self.sync_now(conn).await?;
            }
            Message::InSync => log::debug!("Peer in sync"),
            got => return Err(SyncError::UnexpectedReply { sent: Message::CheckSync, got }),
          },
        },
        _ = heartbeat_tick.tick() => {
          match conn.request(Message::Heartbeat, s.reply_timeout).await? {
            Message::Alive => {}
            got => return Err(SyncError::UnexpectedReply { sent: Message::Heartbeat, got }),
          }
        }
      }
    }
  }

  /// Command the peer and resync locally while its reply is in flight.
  async fn sync_now(&self, conn: &mut Connection) -> Result<(), SyncError> {
    conn.send(Message::SyncNow).await?;
    self.mark_sync_sent();
    self.playback.resync().await;
    match conn.recv_reply(Message::SyncNow, self.settings.reply_timeout).await? {
      Message::Synced => Ok(()),
      got => Err(SyncError::UnexpectedReply {
        sent: Message::SyncNow,
        got,
      }),
    }
  }
}

/// Wait until the session reports a ready peer, at most `timeout`.
pub async fn wait_for_peer(status: &mut watch::Receiver<PeerStatus>, timeout: Duration) -> bool {
  matches!(
    tokio::time::timeout(timeout, status.wait_for(|s| s.connected)).await,
    Ok(Ok(_))
  )
}
