//! Local playback: external player processes and their control channels.
//!
//! Architecture:
//! - `process.rs` - player binary detection, command lines, process lifetime
//! - `ipc.rs` - optional remote-control channel (mpv JSON IPC, VLC rc)
//! - `protocol.rs` - remote-control command encoding
//! - `controller.rs` - lock-serialized start/stop/resync for one display
//! - `group.rs` - every display of the node driven as one unit

mod controller;
mod group;
mod ipc;
mod process;
mod protocol;

pub use controller::{ControllerError, ControllerSettings, ControllerStats, PlaybackController};
pub use group::{PlaybackGroup, Readiness, VideoResolver};
pub use ipc::{ControlEndpoint, IpcError};
pub use process::{build_args, find_player, resolve_program, LaunchSpec, MediaProcess, ProcessError};
pub use protocol::RemoteCommand;

#[cfg(test)]
pub(crate) mod testing {
  //! Stand-ins for a real player: `sh` sleeping, and an in-process rc server.

  use std::path::PathBuf;
  use std::sync::Arc;
  use std::time::Duration;

  use parking_lot::Mutex;
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
  use tokio::net::TcpListener;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::config::{DisplayTarget, PlayerKind};

  pub fn sleeper_spec(control: ControlEndpoint) -> LaunchSpec {
    LaunchSpec {
      kind: PlayerKind::Custom,
      program: PathBuf::from("/bin/sh"),
      display: DisplayTarget::default(),
      control,
      extra_args: Vec::new(),
      custom_args: vec![
        "-c".to_string(),
        "exec sleep 30".to_string(),
        "player".to_string(),
        "{video}".to_string(),
      ],
    }
  }

  pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
      restart_cooldown: Duration::ZERO,
      extended_cooldown: Duration::from_secs(1),
      max_consecutive_failures: 3,
      terminate_timeout: Duration::from_secs(2),
      settle_delay: Duration::from_millis(10),
      control_retries: 3,
      reply_timeout: Duration::from_millis(300),
    }
  }

  pub fn sleeper_controller(name: &str, control: ControlEndpoint) -> PlaybackController {
    PlaybackController::new(name, sleeper_spec(control), fast_settings(), CancellationToken::new())
  }

  /// Group of `outputs` sleepers playing `0.mp4`, `1.mp4`, ...
  pub fn sleeper_group(outputs: usize) -> PlaybackGroup {
    let controllers = (0..outputs)
      .map(|i| Arc::new(sleeper_controller(&format!("out-{}", i), ControlEndpoint::None)))
      .collect();
    PlaybackGroup::new(
      controllers,
      Arc::new(move || Ok((0..outputs).map(|i| PathBuf::from(format!("{}.mp4", i))).collect())),
    )
  }

  /// rc server that records every received line.
  pub struct FakeRc {
    pub address: String,
    lines: Arc<Mutex<Vec<String>>>,
  }

  impl FakeRc {
    /// `answer_probes = false` simulates a hung player.
    pub async fn start(answer_probes: bool) -> Self {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let address = listener.local_addr().unwrap().to_string();
      let lines = Arc::new(Mutex::new(Vec::new()));

      let recorded = lines.clone();
      tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
          let recorded = recorded.clone();
          tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader).lines();
            while let Ok(Some(line)) = reader.next_line().await {
              let probe = line == "get_time";
              recorded.lock().push(line);
              if probe && answer_probes && writer.write_all(b"> 0\n").await.is_err() {
                break;
              }
            }
          });
        }
      });

      Self { address, lines }
    }

    pub fn lines(&self) -> Vec<String> {
      self.lines.lock().clone()
    }

    pub async fn wait_for_lines(&self, count: usize) {
      for _ in 0..100 {
        if self.lines.lock().len() >= count {
          return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
    }

    /// Lines other than liveness probes.
    pub fn commands(&self) -> Vec<String> {
      self.lines().into_iter().filter(|l| l != "get_time").collect()
    }
  }
}
