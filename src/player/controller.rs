//! Playback controller: the single owner of a display's player process.
//!
//! Every transition runs under one async mutex, so the protocol tasks and
//! the health monitor never race on the same process.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::ipc::{ControlChannel, IpcError};
use super::process::{LaunchSpec, MediaProcess, ProcessError};
use super::protocol::RemoteCommand;
use crate::config::TimingConfig;

#[derive(Error, Debug)]
pub enum ControllerError {
  #[error("Launch failed ({failures} consecutive): {source}")]
  Launch {
    failures: u32,
    #[source]
    source: ProcessError,
  },
  #[error("Control channel error: {0}")]
  Control(#[from] IpcError),
  #[error("Controller is shutting down")]
  ShuttingDown,
}

/// Restart policy and per-step timeouts.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
  /// Minimum spacing between two launches.
  pub restart_cooldown: Duration,
  /// Spacing after `max_consecutive_failures` failed launches in a row.
  pub extended_cooldown: Duration,
  pub max_consecutive_failures: u32,
  pub terminate_timeout: Duration,
  /// Pause between remote-control steps; players apply commands asynchronously.
  pub settle_delay: Duration,
  pub control_retries: u32,
  pub reply_timeout: Duration,
}

impl From<&TimingConfig> for ControllerSettings {
  fn from(t: &TimingConfig) -> Self {
    Self {
      restart_cooldown: Duration::from_secs(t.restart_cooldown_secs),
      extended_cooldown: Duration::from_secs(t.extended_cooldown_secs),
      max_consecutive_failures: t.max_consecutive_failures,
      terminate_timeout: Duration::from_secs(t.terminate_timeout_secs),
      settle_delay: Duration::from_millis(t.settle_delay_ms),
      control_retries: t.control_connect_retries,
      reply_timeout: t.reply_timeout(),
    }
  }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
  /// Failed launches since the last successful one.
  pub consecutive_failures: u32,
  /// Launch attempts made after the first one.
  pub restarts: u32,
}

struct PlaybackSession {
  process: MediaProcess,
  control: Option<ControlChannel>,
}

#[derive(Default)]
struct ControllerState {
  session: Option<PlaybackSession>,
  /// Video requested by the last `start`; cleared by `stop`.
  video: Option<PathBuf>,
  stats: ControllerStats,
  launched_once: bool,
  next_launch_at: Option<Instant>,
}

pub struct PlaybackController {
  name: String,
  spec: LaunchSpec,
  settings: ControllerSettings,
  state: Mutex<ControllerState>,
  shutdown: CancellationToken,
}

impl PlaybackController {
  pub fn new(
    name: impl Into<String>,
    spec: LaunchSpec,
    settings: ControllerSettings,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      name: name.into(),
      spec,
      settings,
      state: Mutex::new(ControllerState::default()),
      shutdown,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Replace any current session with a new player for `video`.
  pub async fn start(&self, video: &Path) -> Result<(), ControllerError> {
    self.launch(video, true).await.map(|_| ())
  }

  /// Start `video` only if no player is alive. Returns whether it launched.
  pub async fn ensure_running(&self, video: &Path) -> Result<bool, ControllerError> {
    self.launch(video, false).await
  }

  async fn launch(&self, video: &Path, replace: bool) -> Result<bool, ControllerError> {
    let mut state = loop {
      let mut state = self.state.lock().await;
      if !replace {
        if let Some(session) = state.session.as_mut() {
          if session.process.is_alive() {
            return Ok(false);
          }
        }
      }

      let wait = state
        .next_launch_at
        .map(|at| at.saturating_duration_since(Instant::now()))
        .unwrap_or_default();
      if wait.is_zero() {
        break state;
      }

      // Do not hold the lock while cooling down: stop() must stay available.
      drop(state);
      log::info!("[{}] Waiting {:?} before next launch", self.name, wait);
      tokio::select! {
        _ = self.shutdown.cancelled() => return Err(ControllerError::ShuttingDown),
        _ = tokio::time::sleep(wait) => {}
      }
    };

    if self.shutdown.is_cancelled() {
      return Err(ControllerError::ShuttingDown);
    }

    self.teardown(&mut state).await;
    state.video = Some(video.to_path_buf());
    if state.launched_once {
      state.stats.restarts += 1;
    }
    state.launched_once = true;

    self.spec.control.cleanup();
    let process = match MediaProcess::launch(&self.spec, video) {
      Ok(process) => process,
      Err(source) => {
        state.stats.consecutive_failures += 1;
        let failures = state.stats.consecutive_failures;
        let cooldown = if failures >= self.settings.max_consecutive_failures {
          log::error!(
            "[{}] {} consecutive launch failures, backing off for {:?}",
            self.name,
            failures,
            self.settings.extended_cooldown
          );
          self.settings.extended_cooldown
        } else {
          self.settings.restart_cooldown
        };
        state.next_launch_at = Some(Instant::now() + cooldown);
        return Err(ControllerError::Launch { failures, source });
      }
    };

    let control = match ControlChannel::connect(&self.spec.control, self.settings.control_retries).await {
      Ok(control) => control,
      Err(e) => {
        log::warn!(
          "[{}] Control channel unavailable, continuing without resync: {}",
          self.name,
          e
        );
        None
      }
    };

    state.session = Some(PlaybackSession { process, control });
    state.stats.consecutive_failures = 0;
    state.next_launch_at = Some(Instant::now() + self.settings.restart_cooldown);
    log::info!("[{}] Playing {:?}", self.name, video);
    Ok(true)
  }

  async fn teardown(&self, state: &mut ControllerState) {
    let Some(session) = state.session.take() else {
      return;
    };

    if let Some(control) = session.control {
      control.close();
    }
    let pid = session.process.pid();
    if let Err(e) = session.process.terminate(self.settings.terminate_timeout).await {
      log::error!("[{}] Failed to terminate player (pid: {:?}): {}", self.name, pid, e);
    }
    self.spec.control.cleanup();
  }

  /// Terminate the player and forget the requested video. Idempotent.
  pub async fn stop(&self) {
    let mut state = self.state.lock().await;
    if state.session.is_some() {
      log::info!("[{}] Stopping playback", self.name);
    }
    self.teardown(&mut state).await;
    state.video = None;
  }

  /// Rewind to the start and resume: pause, seek 0, play.
  ///
  /// Returns `false` when there is no control channel to do it with.
  pub async fn resync(&self) -> Result<bool, ControllerError> {
    let mut state = self.state.lock().await;
    let Some(control) = state.session.as_mut().and_then(|s| s.control.as_mut()) else {
      log::debug!("[{}] No control channel, resync skipped", self.name);
      return Ok(false);
    };

    let steps = [
      RemoteCommand::Pause,
      RemoteCommand::Seek(0),
      RemoteCommand::Play,
    ];
    for (i, cmd) in steps.into_iter().enumerate() {
      if i > 0 {
        tokio::time::sleep(self.settings.settle_delay).await;
      }
      control.send(cmd, self.settings.reply_timeout).await?;
    }

    log::info!("[{}] Resynced", self.name);
    Ok(true)
  }

  /// Whether the player is alive and, when a control channel exists, answering.
  pub async fn check_running(&self) -> bool {
    let mut state = self.state.lock().await;
    let Some(session) = state.session.as_mut() else {
      return false;
    };

    if !session.process.is_alive() {
      return false;
    }

    if let Some(control) = session.control.as_mut() {
      if let Err(e) = control.probe(self.settings.reply_timeout).await {
        log::warn!("[{}] Player is alive but not responding: {}", self.name, e);
        return false;
      }
    }
    true
  }

  /// Video last requested by `start`, if not stopped since.
  pub async fn video(&self) -> Option<PathBuf> {
    self.state.lock().await.video.clone()
  }

  pub async fn stats(&self) -> ControllerStats {
    self.state.lock().await.stats
  }

  pub async fn pid(&self) -> Option<u32> {
    self
      .state
      .lock()
      .await
      .session
      .as_ref()
      .and_then(|s| s.process.pid())
  }
}
