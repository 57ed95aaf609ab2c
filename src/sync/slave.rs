//! Slave side: accepts the master's control connection and serves commands.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::error::SyncError;
use super::protocol::Message;
use crate::player::{PlaybackGroup, Readiness};

#[derive(Debug, Clone)]
pub struct ListenerSettings {
  pub bind_address: String,
  /// Source addresses allowed to connect; everyone else is dropped unanswered.
  pub allowed_peers: Vec<IpAddr>,
  /// A resync older than this makes `CHECK_SYNC` answer `NEED_SYNC`.
  pub sync_interval: Duration,
}

pub struct SyncListener {
  settings: ListenerSettings,
  playback: Arc<PlaybackGroup>,
  last_sync: Mutex<Option<Instant>>,
}

impl SyncListener {
  pub fn new(settings: ListenerSettings, playback: Arc<PlaybackGroup>) -> Self {
    Self {
      settings,
      playback,
      last_sync: Mutex::new(None),
    }
  }

  pub async fn bind(&self) -> Result<TcpListener, SyncError> {
    let listener = TcpListener::bind(&self.settings.bind_address).await?;
    log::info!("Control listener on {}", listener.local_addr()?);
    Ok(listener)
  }

  fn is_allowed(&self, ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    self
      .settings
      .allowed_peers
      .iter()
      .any(|allowed| allowed.to_canonical() == ip)
  }

  /// Accept loop. Each allowed connection gets its own task.
  pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
    loop {
      let accepted = tokio::select! {
        _ = cancel.cancelled() => break,
        accepted = listener.accept() => accepted,
      };

      let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
          log::error!("Accept failed: {}", e);
          continue;
        }
      };

      if !self.is_allowed(peer.ip()) {
        log::warn!("Rejected control connection from {}", peer);
        drop(stream);
        continue;
      }

      let conn = match Connection::from_stream(stream) {
        Ok(conn) => conn,
        Err(e) => {
          log::warn!("Dropping connection from {}: {}", peer, e);
          continue;
        }
      };

      log::info!("Master connected from {}", peer);
      let this = self.clone();
      let cancel = cancel.child_token();
      tokio::spawn(async move {
        match this.handle_connection(conn, cancel).await {
          Ok(()) => log::info!("Master {} disconnected", peer),
          Err(e) => log::warn!("Connection from {} closed: {}", peer, e),
        }
      });
    }
    log::info!("Control listener stopped");
  }

  async fn handle_connection(&self, mut conn: Connection, cancel: CancellationToken) -> Result<(), SyncError> {
    loop {
      let msg = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        msg = conn.recv() => msg?,
      };
      let Some(msg) = msg else {
        return Ok(());
      };
      let Some(reply) = self.dispatch(msg).await else {
        return Err(SyncError::Malformed(msg.to_string()));
      };
      conn.send(reply).await?;
    }
  }

  /// `recover` also replaces players that are alive but unresponsive.
  async fn bring_up(&self, recover: bool) -> Readiness {
    let result = if recover {
      self.playback.recover().await
    } else {
      self.playback.ensure_running().await
    };
    match result {
      Ok(readiness) => readiness,
      Err(e) => {
        log::error!("Cannot start local playback: {}", e);
        Readiness::NoVideo
      }
    }
  }

  async fn resync(&self) {
    self.playback.resync().await;
    *self.last_sync.lock() = Some(Instant::now());
  }

  fn sync_is_stale(&self) -> bool {
    match *self.last_sync.lock() {
      Some(at) => at.elapsed() > self.settings.sync_interval,
      None => true,
    }
  }

  /// Reply to one request; `None` for messages a master never sends.
  pub async fn dispatch(&self, msg: Message) -> Option<Message> {
    if !msg.is_request() {
      log::warn!("Unexpected {} from master", msg);
      return None;
    }

    let reply = match msg {
      Message::PrepareSync => match self.bring_up(false).await {
        Readiness::Ready => Message::Ready,
        Readiness::NoVideo => Message::NoVideo,
      },
      Message::PlaySync => match self.bring_up(true).await {
        Readiness::Ready => {
          self.resync().await;
          Message::VideoStarted
        }
        Readiness::NoVideo => Message::NoVideo,
      },
      Message::SyncNow => {
        self.bring_up(true).await;
        self.resync().await;
        Message::Synced
      }
      Message::CheckSync => {
        if !self.playback.check_running().await {
          log::warn!("Local playback down on CHECK_SYNC, restarting");
          self.bring_up(true).await;
          Message::NeedSync
        } else if self.sync_is_stale() {
          Message::NeedSync
        } else {
          Message::InSync
        }
      }
      Message::AreYouReady => {
        if self.playback.check_running().await {
          Message::Ready
        } else {
          Message::NoVideo
        }
      }
      Message::Heartbeat => Message::Alive,
      // Replies, filtered above.
      _ => return None,
    };
    Some(reply)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::media::MediaError;
  use crate::player::testing::{sleeper_controller, sleeper_group, FakeRc};
  use crate::player::ControlEndpoint;
  use nix::sys::signal::{self, Signal};
  use nix::unistd::Pid;
  use std::net::Ipv4Addr;
  use std::path::PathBuf;
  use tokio::io::AsyncReadExt;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpStream;

  fn listener(playback: Arc<PlaybackGroup>, allowed: IpAddr) -> Arc<SyncListener> {
    Arc::new(SyncListener::new(
      ListenerSettings {
        bind_address: "127.0.0.1:0".to_string(),
        allowed_peers: vec![allowed],
        sync_interval: Duration::from_secs(60),
      },
      playback,
    ))
  }

  async fn serve(listener: Arc<SyncListener>) -> (String, CancellationToken) {
    let socket = listener.bind().await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(listener.serve(socket, cancel.clone()));
    (address, cancel)
  }

  fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
  }

  #[tokio::test]
  async fn test_foreign_address_gets_no_reply() {
    let group = Arc::new(sleeper_group(1));
    let (address, cancel) = serve(listener(group, "10.255.255.1".parse().unwrap())).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    let _ = stream.write_all(b"HEARTBEAT\n").await;
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
      .await
      .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_prepare_sync_without_media_replies_no_video() {
    let controller = Arc::new(sleeper_controller("out-0", ControlEndpoint::None));
    let group = Arc::new(PlaybackGroup::new(
      vec![controller],
      Arc::new(|| Err(MediaError::NoVideo(0))),
    ));
    let (address, cancel) = serve(listener(group, localhost())).await;

    let mut conn = Connection::connect(&address, Duration::from_secs(1)).await.unwrap();
    let reply = conn.request(Message::PrepareSync, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, Message::NoVideo);
    let reply = conn.request(Message::PlaySync, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, Message::NoVideo);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_full_exchange() {
    let group = Arc::new(sleeper_group(1));
    let (address, cancel) = serve(listener(group.clone(), localhost())).await;

    let mut conn = Connection::connect(&address, Duration::from_secs(1)).await.unwrap();
    let t = Duration::from_secs(3);
    assert_eq!(conn.request(Message::AreYouReady, t).await.unwrap(), Message::NoVideo);
    assert_eq!(conn.request(Message::CheckSync, t).await.unwrap(), Message::NeedSync);
    assert_eq!(conn.request(Message::PrepareSync, t).await.unwrap(), Message::Ready);
    assert!(group.check_running().await);
    assert_eq!(conn.request(Message::PlaySync, t).await.unwrap(), Message::VideoStarted);
    assert_eq!(conn.request(Message::CheckSync, t).await.unwrap(), Message::InSync);
    assert_eq!(conn.request(Message::SyncNow, t).await.unwrap(), Message::Synced);
    assert_eq!(conn.request(Message::Heartbeat, t).await.unwrap(), Message::Alive);
    assert_eq!(conn.request(Message::AreYouReady, t).await.unwrap(), Message::Ready);

    cancel.cancel();
    group.stop().await;
  }

  #[tokio::test]
  async fn test_check_sync_restarts_dead_player() {
    let group = Arc::new(sleeper_group(1));
    let slave = listener(group.clone(), localhost());
    assert_eq!(slave.dispatch(Message::PlaySync).await, Some(Message::VideoStarted));
    assert_eq!(slave.dispatch(Message::CheckSync).await, Some(Message::InSync));

    let controller = &group.controllers()[0];
    let pid = controller.pid().await.unwrap();
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(slave.dispatch(Message::CheckSync).await, Some(Message::NeedSync));
    assert!(controller.check_running().await);
    assert_ne!(controller.pid().await, Some(pid));
    group.stop().await;
  }

  #[tokio::test]
  async fn test_stale_sync_needs_sync() {
    let group = Arc::new(sleeper_group(1));
    let slave = Arc::new(SyncListener::new(
      ListenerSettings {
        bind_address: "127.0.0.1:0".to_string(),
        allowed_peers: vec![localhost()],
        sync_interval: Duration::from_millis(100),
      },
      group.clone(),
    ));
    slave.dispatch(Message::SyncNow).await;
    assert_eq!(slave.dispatch(Message::CheckSync).await, Some(Message::InSync));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(slave.dispatch(Message::CheckSync).await, Some(Message::NeedSync));
    group.stop().await;
  }

  #[tokio::test]
  async fn test_reply_token_closes_connection() {
    let group = Arc::new(sleeper_group(1));
    let (address, cancel) = serve(listener(group, localhost())).await;

    let mut conn = Connection::connect(&address, Duration::from_secs(1)).await.unwrap();
    let err = conn.request(Message::Ready, Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, SyncError::Closed | SyncError::Io(_)));
    cancel.cancel();
  }

  #[test]
  fn test_ipv4_mapped_peer_is_allowed() {
    let group = Arc::new(sleeper_group(1));
    let slave = listener(group, localhost());
    assert!(slave.is_allowed("::ffff:127.0.0.1".parse().unwrap()));
    assert!(!slave.is_allowed("127.0.0.2".parse().unwrap()));
  }

  #[tokio::test]
  async fn test_master_session_over_loopback() {
    use crate::config::SyncMode;
    use crate::sync::master::{wait_for_peer, MasterSettings, PeerSession};

    let slave_group = Arc::new(sleeper_group(1));
    let (address, slave_cancel) = serve(listener(slave_group.clone(), localhost())).await;

    let master_group = Arc::new(sleeper_group(1));
    let session = PeerSession::new(
      MasterSettings {
        peer_address: address,
        connect_timeout: Duration::from_secs(1),
        reply_timeout: Duration::from_secs(3),
        retry_interval: Duration::from_millis(100),
        sync_interval: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(150),
        mode: SyncMode::CheckSync,
      },
      master_group.clone(),
    );
    let mut status = session.subscribe();
    let master_cancel = CancellationToken::new();
    let handle = tokio::spawn(session.run(master_cancel.clone()));

    assert!(wait_for_peer(&mut status, Duration::from_secs(5)).await);
    assert!(slave_group.check_running().await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(status.borrow().connected);

    master_cancel.cancel();
    handle.await.unwrap();
    slave_cancel.cancel();
    slave_group.stop().await;
    master_group.stop().await;
  }

  #[tokio::test]
  async fn test_play_sync_replaces_hung_player() {
    let fake = FakeRc::start(false).await;
    let controller = Arc::new(sleeper_controller("out-0", ControlEndpoint::Rc(fake.address.clone())));
    let group = Arc::new(PlaybackGroup::new(
      vec![controller.clone()],
      Arc::new(|| Ok(vec![PathBuf::from("0.mp4")])),
    ));
    let slave = listener(group.clone(), localhost());

    assert_eq!(slave.dispatch(Message::PrepareSync).await, Some(Message::Ready));
    let pid = controller.pid().await;
    assert!(pid.is_some());

    assert_eq!(slave.dispatch(Message::PlaySync).await, Some(Message::VideoStarted));
    assert_ne!(controller.pid().await, pid);
    assert_eq!(controller.stats().await.restarts, 1);
    group.stop().await;
  }

  #[tokio::test]
  async fn test_replies_from_master_are_rejected() {
    let group = Arc::new(sleeper_group(1));
    let slave = listener(group, localhost());
    for msg in Message::ALL.into_iter().filter(|m| !m.is_request()) {
      assert_eq!(slave.dispatch(msg).await, None);
    }
  }
}
