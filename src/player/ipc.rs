//! Remote-control side channel to a running player.
//!
//! mpv is reached over its JSON IPC unix socket, VLC over the `rc`
//! interface's TCP port. Both are optional: a player without a channel
//! keeps playing, it just cannot be resynchronized in place.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{MpvCommand, MpvMessage, MpvResponse, RemoteCommand};
use crate::config::{ControlConfig, PlayerKind};

/// First `rc` port handed out when VLC control is `auto`.
const RC_BASE_PORT: u16 = 4212;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(#[from] std::io::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("MPV error: {0}")]
  MpvError(String),
  #[error("Disconnected")]
  Disconnected,
}

/// Resolved control endpoint of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
  None,
  MpvIpc(PathBuf),
  Rc(String),
}

impl ControlEndpoint {
  /// Turn configuration into a concrete endpoint for the output at `index`.
  pub fn resolve(config: &ControlConfig, kind: PlayerKind, index: usize) -> Self {
    match config {
      ControlConfig::None => ControlEndpoint::None,
      ControlConfig::MpvIpc { path } => ControlEndpoint::MpvIpc(PathBuf::from(path)),
      ControlConfig::Rc { address } => ControlEndpoint::Rc(address.clone()),
      ControlConfig::Auto => match kind {
        PlayerKind::Mpv => ControlEndpoint::MpvIpc(std::env::temp_dir().join(format!(
          "vidsync-mpv-{}.sock",
          uuid::Uuid::new_v4()
        ))),
        PlayerKind::Vlc => {
          ControlEndpoint::Rc(format!("127.0.0.1:{}", RC_BASE_PORT + index as u16))
        }
        PlayerKind::Ffplay | PlayerKind::Custom => ControlEndpoint::None,
      },
    }
  }

  /// Remove a stale IPC socket left by a previous player.
  pub fn cleanup(&self) {
    if let ControlEndpoint::MpvIpc(path) = self {
      let _ = std::fs::remove_file(path);
    }
  }
}

async fn connect_with_retries<T, F, Fut>(retry_count: u32, mut attempt_fn: F) -> Result<T, IpcError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, IpcError>>,
{
  let mut last_error = None;

  for attempt in 0..retry_count.max(1) {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
    }

    match attempt_fn().await {
      Ok(conn) => return Ok(conn),
      Err(e) => {
        log::debug!("Control connect attempt {} failed: {}", attempt + 1, e);
        last_error = Some(e);
      }
    }
  }

  Err(last_error.unwrap_or_else(|| IpcError::ConnectionFailed("Unknown error".into())))
}

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<Result<MpvResponse, IpcError>>;

/// IPC connection state shared between writer and reader.
struct IpcState {
  pending: HashMap<i64, PendingRequest>,
}

/// Writer channel message.
enum WriteMessage {
  Command(Vec<u8>),
  Close,
}

/// MPV JSON IPC connection.
pub struct MpvIpc {
  state: Arc<Mutex<IpcState>>,
  write_tx: Sender<WriteMessage>,
  reader_handle: JoinHandle<()>,
  writer_handle: JoinHandle<()>,
}

impl MpvIpc {
  pub async fn connect(path: &std::path::Path, retry_count: u32) -> Result<Self, IpcError> {
    connect_with_retries(retry_count, move || async move {
      let stream = UnixStream::connect(path)
        .await
        .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
      let (reader, writer) = tokio::io::split(stream);
      Ok(Self::setup(reader, writer))
    })
    .await
  }

  fn setup<R, W>(reader: R, writer: W) -> Self
  where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
  {
    let state = Arc::new(Mutex::new(IpcState {
      pending: HashMap::new(),
    }));

    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let reader_state = state.clone();
    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, reader_state).await;
    });

    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
    });

    Self {
      state,
      write_tx,
      reader_handle,
      writer_handle,
    }
  }

  async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(reader: R, state: Arc<Mutex<IpcState>>) {
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
      line.clear();
      match buf_reader.read_line(&mut line).await {
        Ok(0) => {
          log::info!("MPV IPC connection closed");
          break;
        }
        Ok(_) => {
          let trimmed = line.trim();
          if trimmed.is_empty() {
            continue;
          }

          match MpvMessage::parse(trimmed) {
            Ok(MpvMessage::Response(response)) => {
              let mut state = state.lock();
              if let Some(tx) = state.pending.remove(&response.request_id) {
                let _ = tx.send(Ok(response));
              }
            }
            Ok(MpvMessage::Event(event)) => {
              log::debug!("MPV event: {} ({:?})", event.event, event.reason);
            }
            Err(e) => {
              log::warn!("Failed to parse MPV message: {} - {}", e, trimmed);
            }
          }
        }
        Err(e) => {
          log::error!("MPV IPC read error: {}", e);
          break;
        }
      }
    }

    // Fail everything still waiting instead of letting it hit the timeout.
    for (_, tx) in state.lock().pending.drain() {
      let _ = tx.send(Err(IpcError::Disconnected));
    }
  }

  async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: Receiver<WriteMessage>,
  ) {
    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Command(mut data) => {
          data.push(b'\n');
          if let Err(e) = writer.write_all(&data).await {
            log::error!("MPV IPC write error: {}", e);
            break;
          }
          if let Err(e) = writer.flush().await {
            log::error!("MPV IPC flush error: {}", e);
            break;
          }
        }
        WriteMessage::Close => {
          log::debug!("MPV IPC writer closing");
          break;
        }
      }
    }
  }

  /// Send a command to MPV and wait for its response.
  pub async fn send_command(&self, cmd: MpvCommand, timeout: Duration) -> Result<MpvResponse, IpcError> {
    let request_id = cmd.request_id;
    let (tx, rx) = oneshot::channel();
    self.state.lock().pending.insert(request_id, tx);

    let json = serde_json::to_string(&cmd).map_err(|e| IpcError::WriteFailed(e.into()))?;
    log::debug!("Sending MPV command: {}", json);

    self
      .write_tx
      .send(WriteMessage::Command(json.into_bytes()))
      .await
      .map_err(|_| IpcError::Disconnected)?;

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::warn!("MPV command timeout after {:?}, request_id={}", timeout, request_id);
        self.state.lock().pending.remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.reader_handle.abort();
    self.writer_handle.abort();
  }
}

/// VLC `rc` connection. Output lines are queued until a query consumes them.
pub struct RcChannel {
  writer: OwnedWriteHalf,
  lines: Receiver<String>,
  reader_handle: JoinHandle<()>,
}

impl RcChannel {
  pub async fn connect(address: &str, retry_count: u32) -> Result<Self, IpcError> {
    connect_with_retries(retry_count, move || async move {
      let stream = TcpStream::connect(address)
        .await
        .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
      Ok(Self::setup(stream))
    })
    .await
  }

  fn setup(stream: TcpStream) -> Self {
    let (reader, writer) = stream.into_split();
    let (line_tx, line_rx) = async_channel::unbounded();

    let reader_handle = tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            // rc prefixes replies with a "> " prompt.
            let line = line.trim_start_matches('>').trim().to_string();
            if !line.is_empty() && line_tx.send(line).await.is_err() {
              break;
            }
          }
          Ok(None) => {
            log::info!("rc connection closed");
            break;
          }
          Err(e) => {
            log::error!("rc read error: {}", e);
            break;
          }
        }
      }
    });

    Self {
      writer,
      lines: line_rx,
      reader_handle,
    }
  }

  pub async fn send_line(&mut self, line: &str) -> Result<(), IpcError> {
    log::debug!("Sending rc command: {}", line);
    self.writer.write_all(format!("{}\n", line).as_bytes()).await?;
    self.writer.flush().await?;
    Ok(())
  }

  /// Send `line` and wait for the next reply line.
  pub async fn query(&mut self, line: &str, timeout: Duration) -> Result<String, IpcError> {
    while self.lines.try_recv().is_ok() {}
    self.send_line(line).await?;
    match tokio::time::timeout(timeout, self.lines.recv()).await {
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => Err(IpcError::Timeout),
    }
  }
}

impl Drop for RcChannel {
  fn drop(&mut self) {
    self.reader_handle.abort();
  }
}

/// Live side channel to one player.
pub enum ControlChannel {
  Mpv(MpvIpc),
  Rc(RcChannel),
}

impl ControlChannel {
  /// Connect to `endpoint`. `Ok(None)` means the player has no channel.
  pub async fn connect(endpoint: &ControlEndpoint, retry_count: u32) -> Result<Option<Self>, IpcError> {
    match endpoint {
      ControlEndpoint::None => Ok(None),
      ControlEndpoint::MpvIpc(path) => Ok(Some(ControlChannel::Mpv(
        MpvIpc::connect(path, retry_count).await?,
      ))),
      ControlEndpoint::Rc(address) => Ok(Some(ControlChannel::Rc(
        RcChannel::connect(address, retry_count).await?,
      ))),
    }
  }

  async fn mpv_send(ipc: &MpvIpc, cmd: RemoteCommand, timeout: Duration) -> Result<(), IpcError> {
    let response = ipc.send_command(cmd.to_mpv(), timeout).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(IpcError::MpvError(response.error))
    }
  }

  /// Send a command without expecting any particular reply content.
  pub async fn send(&mut self, cmd: RemoteCommand, timeout: Duration) -> Result<(), IpcError> {
    match self {
      ControlChannel::Mpv(ipc) => Self::mpv_send(ipc, cmd, timeout).await,
      ControlChannel::Rc(rc) => rc.send_line(&cmd.to_rc_line()).await,
    }
  }

  /// Round-trip a cheap query; an error means the player is unresponsive.
  pub async fn probe(&mut self, timeout: Duration) -> Result<(), IpcError> {
    match self {
      ControlChannel::Mpv(ipc) => Self::mpv_send(ipc, RemoteCommand::Probe, timeout).await,
      ControlChannel::Rc(rc) => rc
        .query(&RemoteCommand::Probe.to_rc_line(), timeout)
        .await
        .map(|_| ()),
    }
  }

  pub fn close(self) {
    if let ControlChannel::Mpv(ipc) = &self {
      ipc.close();
    }
  }
}
