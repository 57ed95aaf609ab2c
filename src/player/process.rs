//! Player binary detection, argument construction and process lifetime.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};

use super::ipc::ControlEndpoint;
use crate::config::{DisplayTarget, PlayerKind};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("Player executable not found for {0:?}")]
  NotFound(PlayerKind),
  #[error("Failed to spawn player: {0}")]
  SpawnFailed(#[source] std::io::Error),
  #[error("Failed to signal player (pid {pid}): {source}")]
  Signal { pid: u32, source: Errno },
  #[error("Failed to kill player: {0}")]
  KillFailed(#[source] std::io::Error),
}

/// Placeholder replaced by the video path in custom argument templates.
pub const VIDEO_PLACEHOLDER: &str = "{video}";

/// Everything needed to launch one player for one display.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
  pub kind: PlayerKind,
  pub program: PathBuf,
  pub display: DisplayTarget,
  pub control: ControlEndpoint,
  pub extra_args: Vec<String>,
  pub custom_args: Vec<String>,
}

fn binary_names(kind: PlayerKind) -> &'static [&'static str] {
  match kind {
    PlayerKind::Mpv => &["mpv"],
    PlayerKind::Vlc => &["cvlc", "vlc"],
    PlayerKind::Ffplay => &["ffplay"],
    PlayerKind::Custom => &[],
  }
}

/// Find the player executable on PATH or in common install locations.
pub fn find_player(kind: PlayerKind) -> Option<PathBuf> {
  let names = binary_names(kind);

  for name in names {
    if let Ok(path) = which::which(name) {
      return Some(path);
    }
  }

  for dir in ["/usr/bin", "/usr/local/bin"] {
    for name in names {
      let p = Path::new(dir).join(name);
      if p.exists() {
        return Some(p);
      }
    }
  }

  None
}

/// Resolve the executable: explicit path first, then lookup.
pub fn resolve_program(kind: PlayerKind, path: Option<&str>) -> Result<PathBuf, ProcessError> {
  match path.filter(|p| !p.is_empty()) {
    Some(p) => Ok(PathBuf::from(p)),
    None => find_player(kind).ok_or(ProcessError::NotFound(kind)),
  }
}

fn mpv_args(spec: &LaunchSpec, args: &mut Vec<String>) {
  let display = &spec.display;
  if display.fullscreen {
    args.push("--fullscreen=yes".into());
  }
  if display.loop_playback {
    args.push("--loop=inf".into());
  }
  args.push("--no-osc".into());
  args.push("--no-terminal".into());
  if let Some(screen) = &display.display_selector {
    args.push(format!("--screen={}", screen));
    args.push(format!("--fs-screen={}", screen));
  }
  if let Some(g) = &display.geometry {
    args.push(format!("--geometry={}x{}+{}+{}", g.width, g.height, g.x, g.y));
  }
  if let ControlEndpoint::MpvIpc(path) = &spec.control {
    args.push(format!("--input-ipc-server={}", path.display()));
  }
}

fn vlc_args(spec: &LaunchSpec, args: &mut Vec<String>) {
  let display = &spec.display;
  args.push("--intf=dummy".into());
  if display.fullscreen {
    args.push("--fullscreen".into());
  }
  if display.loop_playback {
    args.push("--loop".into());
  }
  args.push("--no-osd".into());
  args.push("--no-video-title-show".into());
  args.push("--quiet".into());
  if let Some(vout) = &display.display_selector {
    args.push(format!("--vout={}", vout));
  }
  if let Some(g) = &display.geometry {
    args.push(format!("--video-x={}", g.x));
    args.push(format!("--video-y={}", g.y));
    args.push(format!("--width={}", g.width));
    args.push(format!("--height={}", g.height));
  }
  if let ControlEndpoint::Rc(address) = &spec.control {
    args.push("--extraintf=rc".into());
    args.push(format!("--rc-host={}", address));
  }
}

fn ffplay_args(spec: &LaunchSpec, args: &mut Vec<String>) {
  let display = &spec.display;
  if display.fullscreen {
    args.push("-fs".into());
  }
  if display.loop_playback {
    args.push("-loop".into());
    args.push("0".into());
  }
  if let Some(g) = &display.geometry {
    args.extend([
      "-left".to_string(),
      g.x.to_string(),
      "-top".to_string(),
      g.y.to_string(),
      "-x".to_string(),
      g.width.to_string(),
      "-y".to_string(),
      g.height.to_string(),
    ]);
  }
  args.push("-loglevel".into());
  args.push("quiet".into());
}

/// Build the player command line for `video`.
pub fn build_args(spec: &LaunchSpec, video: &Path) -> Vec<String> {
  let video = video.to_string_lossy();

  if spec.kind == PlayerKind::Custom {
    return spec
      .custom_args
      .iter()
      .map(|arg| arg.replace(VIDEO_PLACEHOLDER, &video))
      .chain(spec.extra_args.iter().cloned())
      .collect();
  }

  let mut args = Vec::new();
  match spec.kind {
    PlayerKind::Mpv => mpv_args(spec, &mut args),
    PlayerKind::Vlc => vlc_args(spec, &mut args),
    PlayerKind::Ffplay => ffplay_args(spec, &mut args),
    PlayerKind::Custom => {}
  }
  args.extend(spec.extra_args.iter().cloned());
  args.push(video.into_owned());
  args
}

/// One running external player.
#[derive(Debug)]
pub struct MediaProcess {
  child: Child,
  pid: Option<u32>,
  video: PathBuf,
}

impl MediaProcess {
  /// Spawn the player. Does not wait for it to start rendering.
  pub fn launch(spec: &LaunchSpec, video: &Path) -> Result<Self, ProcessError> {
    let args = build_args(spec, video);
    log::info!("Spawning player: {:?} {:?}", spec.program, args);

    let child = Command::new(&spec.program)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(ProcessError::SpawnFailed)?;

    let pid = child.id();
    log::info!("Player started (pid: {:?}) for {:?}", pid, video);

    Ok(Self {
      child,
      pid,
      video: video.to_path_buf(),
    })
  }

  pub fn pid(&self) -> Option<u32> {
    self.pid
  }

  pub fn video(&self) -> &Path {
    &self.video
  }

  /// Non-blocking liveness poll. An exited or unpollable process is dead.
  pub fn is_alive(&mut self) -> bool {
    match self.child.try_wait() {
      Ok(None) => true,
      Ok(Some(status)) => {
        log::debug!("Player (pid: {:?}) exited with {}", self.pid, status);
        false
      }
      Err(e) => {
        log::warn!("Failed to poll player (pid: {:?}): {}", self.pid, e);
        false
      }
    }
  }

  /// SIGTERM, wait up to `timeout`, then SIGKILL. The process is reaped on return.
  pub async fn terminate(mut self, timeout: Duration) -> Result<(), ProcessError> {
    if !self.is_alive() {
      return Ok(());
    }

    if let Some(pid) = self.pid {
      match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(source) => return Err(ProcessError::Signal { pid, source }),
      }
    }

    match tokio::time::timeout(timeout, self.child.wait()).await {
      Ok(Ok(status)) => {
        log::info!("Player (pid: {:?}) exited with: {}", self.pid, status);
        Ok(())
      }
      Ok(Err(e)) => {
        log::warn!("wait() failed for player (pid: {:?}): {}", self.pid, e);
        self.force_kill().await
      }
      Err(_) => {
        log::warn!(
          "Player (pid: {:?}) ignored SIGTERM for {:?}, killing",
          self.pid,
          timeout
        );
        self.force_kill().await
      }
    }
  }

  async fn force_kill(&mut self) -> Result<(), ProcessError> {
    self.child.kill().await.map_err(ProcessError::KillFailed)?;
    log::info!("Player (pid: {:?}) killed", self.pid);
    Ok(())
  }
}
