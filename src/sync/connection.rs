//! Line-framed control socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::error::SyncError;
use super::protocol::Message;

pub struct Connection {
  reader: BufReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
  peer: SocketAddr,
  line: String,
}

impl Connection {
  /// Open a connection, giving up after `timeout`.
  pub async fn connect(address: &str, timeout: Duration) -> Result<Self, SyncError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
      .await
      .map_err(|_| SyncError::ConnectTimeout(address.to_string()))??;
    Self::from_stream(stream)
  }

  pub fn from_stream(stream: TcpStream) -> Result<Self, SyncError> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();
    Ok(Self {
      reader: BufReader::new(reader),
      writer,
      peer,
      line: String::new(),
    })
  }

  pub fn peer(&self) -> SocketAddr {
    self.peer
  }

  pub async fn send(&mut self, msg: Message) -> Result<(), SyncError> {
    log::debug!("-> {} {}", self.peer, msg);
    self.writer.write_all(msg.as_str().as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await?;
    Ok(())
  }

  /// Next message, or `None` once the peer has closed the connection.
  /// Blank lines are skipped.
  pub async fn recv(&mut self) -> Result<Option<Message>, SyncError> {
    loop {
      self.line.clear();
      if self.reader.read_line(&mut self.line).await? == 0 {
        return Ok(None);
      }
      if self.line.trim().is_empty() {
        continue;
      }
      let msg = self
        .line
        .parse::<Message>()
        .map_err(|e| SyncError::Malformed(e.0))?;
      log::debug!("<- {} {}", self.peer, msg);
      return Ok(Some(msg));
    }
  }

  /// Wait up to `timeout` for the reply to `sent`.
  pub async fn recv_reply(&mut self, sent: Message, timeout: Duration) -> Result<Message, SyncError> {
    match tokio::time::timeout(timeout, self.recv()).await {
      Ok(Ok(Some(msg))) => Ok(msg),
      Ok(Ok(None)) => Err(SyncError::Closed),
      Ok(Err(e)) => Err(e),
      Err(_) => Err(SyncError::ReplyTimeout(sent)),
    }
  }

  /// Send `msg` and wait for its reply.
  pub async fn request(&mut self, msg: Message, timeout: Duration) -> Result<Message, SyncError> {
    self.send(msg).await?;
    self.recv_reply(msg, timeout).await
  }
}
