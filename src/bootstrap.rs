//! Startup: CLI, role selection, network readiness, and the per-role wiring.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigError, NodeRole};
use crate::media;
use crate::player::{
  resolve_program, ControlEndpoint, ControllerError, ControllerSettings, LaunchSpec, PlaybackController,
  PlaybackGroup, ProcessError, Readiness,
};
use crate::sync::{monitor, wait_for_peer, ListenerSettings, MasterSettings, PeerSession, SyncError, SyncListener};

#[derive(Debug, Parser)]
#[command(name = "vidsync", version, about = "Keep video loops on two machines in step")]
pub struct Cli {
  /// Config file (default: ~/.config/vidsync/config.json)
  #[arg(long)]
  pub config: Option<PathBuf>,

  /// Override the role instead of matching the hostname
  #[arg(long, value_enum)]
  pub role: Option<NodeRole>,

  /// Peer host: the slave for a master, the allowed master for a slave
  #[arg(long)]
  pub peer: Option<String>,

  #[arg(long)]
  pub port: Option<u16>,

  /// Video for the first output
  #[arg(long)]
  pub video: Option<String>,

  #[arg(long)]
  pub media_dir: Option<String>,

  /// Play locally without any control plane
  #[arg(long)]
  pub standalone: bool,

  /// Log filter, e.g. `debug` or `vidsync_lib::sync=trace`
  #[arg(long)]
  pub log_level: Option<String>,
}

impl Cli {
  /// Command-line values win over the file.
  pub fn apply(&self, config: &mut AppConfig) {
    if let Some(role) = self.role {
      config.role = Some(role);
    }
    if let Some(peer) = &self.peer {
      config.peer_host = peer.clone();
    }
    if let Some(port) = self.port {
      config.control_port = port;
    }
    if let Some(video) = &self.video {
      if let Some(output) = config.outputs.first_mut() {
        output.video = Some(video.clone());
      }
    }
    if let Some(dir) = &self.media_dir {
      config.media_dir = Some(dir.clone());
    }
  }
}

#[derive(Error, Debug)]
pub enum BootstrapError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("Failed to read hostname: {0}")]
  Hostname(#[source] nix::Error),

  #[error("Cannot decide role for host {0:?}: set `role` or `masterHostname`")]
  UnknownRole(String),

  #[error("No route to {peer} after {waited:?}")]
  NetworkTimeout { peer: String, waited: Duration },

  #[error("Cannot resolve peer {0}")]
  PeerAddress(String),

  #[error("Peer {peer} not ready after {waited:?}")]
  PeerNotReady { peer: String, waited: Duration },

  #[error("No local video to play")]
  NoVideo,

  #[error(transparent)]
  Player(#[from] ProcessError),

  #[error("Control listener failed: {0}")]
  Listener(#[from] SyncError),

  #[error("Interrupted during startup")]
  Interrupted,
}

/// How this process will run, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Master,
  Slave,
  Standalone,
}

fn role_for_hostname(config: &AppConfig, hostname: &str) -> Option<NodeRole> {
  let master = config.master_hostname.as_deref()?;
  if master.eq_ignore_ascii_case(hostname) {
    Some(NodeRole::Master)
  } else {
    Some(NodeRole::Slave)
  }
}

/// Explicit role first, then the hostname match.
pub fn resolve_role(config: &AppConfig) -> Result<NodeRole, BootstrapError> {
  if let Some(role) = config.role {
    return Ok(role);
  }
  let hostname = nix::unistd::gethostname().map_err(BootstrapError::Hostname)?;
  let hostname = hostname.to_string_lossy();
  let role = role_for_hostname(config, &hostname).ok_or_else(|| BootstrapError::UnknownRole(hostname.to_string()))?;
  log::info!("Host {:?} runs as {}", hostname, role);
  Ok(role)
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), BootstrapError> {
  tokio::select! {
    _ = cancel.cancelled() => Err(BootstrapError::Interrupted),
    _ = tokio::time::sleep(duration) => Ok(()),
  }
}

/// Local address the kernel would use to reach `peer`, if any route exists.
async fn local_route_to(peer: SocketAddr) -> Option<IpAddr> {
  let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
  let socket = UdpSocket::bind(bind).await.ok()?;
  socket.connect(peer).await.ok()?;
  let local = socket.local_addr().ok()?.ip();
  (!local.is_loopback() && !local.is_unspecified()).then_some(local)
}

async fn network_ready(peer: &str) -> bool {
  let Ok(addrs) = tokio::net::lookup_host(peer).await else {
    return false;
  };
  for addr in addrs {
    if addr.ip().is_loopback() {
      return true;
    }
    if let Some(local) = local_route_to(addr).await {
      log::debug!("Route to {} via {}", addr, local);
      return true;
    }
  }
  false
}

/// Poll until a route to `peer` exists, at most `timeout`.
pub async fn wait_for_network(
  peer: &str,
  timeout: Duration,
  poll: Duration,
  cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
  let started = Instant::now();
  loop {
    if network_ready(peer).await {
      log::info!("Network ready for {}", peer);
      return Ok(());
    }
    if started.elapsed() >= timeout {
      return Err(BootstrapError::NetworkTimeout {
        peer: peer.to_string(),
        waited: started.elapsed(),
      });
    }
    log::info!("Waiting for network to reach {}", peer);
    sleep_or_cancel(poll, cancel).await?;
  }
}

/// One controller per configured output, all sharing the shutdown token.
pub fn build_group(config: &AppConfig, shutdown: &CancellationToken) -> Result<PlaybackGroup, BootstrapError> {
  let kind = config.player.kind;
  let program = resolve_program(kind, config.player.path.as_deref())?;
  log::info!("Using {:?} player at {:?}", kind, program);
  let settings = ControllerSettings::from(&config.timing);

  let controllers = config
    .outputs
    .iter()
    .enumerate()
    .map(|(index, output)| {
      let spec = LaunchSpec {
        kind,
        program: program.clone(),
        display: output.display.clone(),
        control: ControlEndpoint::resolve(&config.player.control, kind, index),
        extra_args: config.player.extra_args.clone(),
        custom_args: config.player.custom_args.clone(),
      };
      Arc::new(PlaybackController::new(
        format!("output-{}", index),
        spec,
        settings.clone(),
        shutdown.clone(),
      ))
    })
    .collect();

  let media_config = config.clone();
  let group = PlaybackGroup::new(controllers, Arc::new(move || media::resolve_videos(&media_config)));
  Ok(group.with_stagger(config.timing.output_stagger()))
}

/// Only missing media is fatal. Launch failures are left to the
/// controllers' cooldown and the watchdog.
async fn start_local(group: &PlaybackGroup) -> Result<(), BootstrapError> {
  match group.ensure_running().await {
    Ok(Readiness::Ready) => Ok(()),
    Ok(Readiness::NoVideo) => Err(BootstrapError::NoVideo),
    Err(ControllerError::ShuttingDown) => Err(BootstrapError::Interrupted),
    Err(e) => {
      log::error!("Local playback failed to start, will keep retrying: {}", e);
      Ok(())
    }
  }
}

async fn run_standalone(
  config: &AppConfig,
  group: &Arc<PlaybackGroup>,
  tasks: &mut Vec<JoinHandle<()>>,
  cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
  start_local(group).await?;
  tasks.extend(monitor::spawn_all(group, config.timing.monitor_interval(), cancel));
  log::info!("Playing standalone, no synchronization");
  Ok(())
}

async fn run_master(
  config: &AppConfig,
  group: &Arc<PlaybackGroup>,
  tasks: &mut Vec<JoinHandle<()>>,
  cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
  start_local(group).await?;
  tasks.extend(monitor::spawn_all(group, config.timing.monitor_interval(), cancel));

  let session = PeerSession::new(MasterSettings::from_config(config), group.clone());
  let mut status = session.subscribe();
  tasks.push(tokio::spawn(session.run(cancel.clone())));

  let timeout = config.timing.peer_ready_timeout();
  let ready = tokio::select! {
    _ = cancel.cancelled() => return Err(BootstrapError::Interrupted),
    ready = wait_for_peer(&mut status, timeout) => ready,
  };
  if ready {
    log::info!("Peer {} is ready", config.peer_address());
  } else if config.standalone_fallback {
    log::warn!(
      "Peer {} not ready after {:?}, playing unsynchronized until it shows up",
      config.peer_address(),
      timeout
    );
  } else {
    return Err(BootstrapError::PeerNotReady {
      peer: config.peer_address(),
      waited: timeout,
    });
  }
  Ok(())
}

async fn allowed_peers(config: &AppConfig) -> Result<Vec<IpAddr>, BootstrapError> {
  let peer = config.peer_address();
  let addrs: Vec<IpAddr> = tokio::net::lookup_host(&peer)
    .await
    .map_err(|_| BootstrapError::PeerAddress(peer.clone()))?
    .map(|addr| addr.ip())
    .collect();
  if addrs.is_empty() {
    return Err(BootstrapError::PeerAddress(peer));
  }
  Ok(addrs)
}

async fn run_slave(
  config: &AppConfig,
  group: &Arc<PlaybackGroup>,
  tasks: &mut Vec<JoinHandle<()>>,
  cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
  let listener = Arc::new(SyncListener::new(
    ListenerSettings {
      bind_address: config.bind_endpoint(),
      allowed_peers: allowed_peers(config).await?,
      sync_interval: config.timing.sync_interval(),
    },
    group.clone(),
  ));
  let socket = listener.bind().await?;

  // Without fallback, playback waits for the master's first PREPARE_SYNC.
  if config.standalone_fallback {
    match group.ensure_running().await {
      Ok(Readiness::Ready) => {}
      Ok(Readiness::NoVideo) => log::warn!("No local video yet, waiting for the master"),
      Err(e) => log::error!("Local playback failed to start: {}", e),
    }
  }

  tasks.extend(monitor::spawn_all(group, config.timing.monitor_interval(), cancel));
  tasks.push(tokio::spawn(listener.serve(socket, cancel.clone())));
  Ok(())
}

/// Decide the mode: network readiness failure is fatal unless standalone
/// fallback is allowed.
async fn select_mode(config: &AppConfig, standalone: bool, cancel: &CancellationToken) -> Result<Mode, BootstrapError> {
  if standalone {
    return Ok(Mode::Standalone);
  }
  let role = resolve_role(config)?;

  let t = &config.timing;
  match wait_for_network(&config.peer_address(), t.network_timeout(), t.network_poll(), cancel).await {
    Ok(()) => {}
    Err(e @ BootstrapError::NetworkTimeout { .. }) if config.standalone_fallback => {
      log::warn!("{}; falling back to standalone playback", e);
      return Ok(Mode::Standalone);
    }
    Err(e) => return Err(e),
  }

  Ok(match role {
    NodeRole::Master => Mode::Master,
    NodeRole::Slave => Mode::Slave,
  })
}

/// Run one node until `cancel` fires. Players are always stopped on the way
/// out, whether startup failed or not.
pub async fn run_node(config: AppConfig, standalone: bool, cancel: CancellationToken) -> Result<(), BootstrapError> {
  config.validate()?;
  sleep_or_cancel(config.timing.startup_delay(), &cancel).await?;

  let mode = select_mode(&config, standalone, &cancel).await?;
  log::info!("Starting in {:?} mode", mode);

  let group = Arc::new(build_group(&config, &cancel)?);
  let mut tasks = Vec::new();

  let started = match mode {
    Mode::Master => run_master(&config, &group, &mut tasks, &cancel).await,
    Mode::Slave => run_slave(&config, &group, &mut tasks, &cancel).await,
    Mode::Standalone => run_standalone(&config, &group, &mut tasks, &cancel).await,
  };

  let result = match started {
    Ok(()) => {
      cancel.cancelled().await;
      log::info!("Shutting down");
      Ok(())
    }
    Err(BootstrapError::Interrupted) => Ok(()),
    Err(e) => Err(e),
  };

  cancel.cancel();
  for task in tasks {
    let _ = task.await;
  }
  group.stop().await;
  result
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(token: CancellationToken) {
  tokio::spawn(async move {
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(signal) => signal,
      Err(e) => {
        log::error!("Failed to install SIGTERM handler: {}", e);
        let _ = tokio::signal::ctrl_c().await;
        token.cancel();
        return;
      }
    };
    tokio::select! {
      _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
      _ = terminate.recv() => log::info!("Received SIGTERM"),
    }
    token.cancel();
  });
}

/// Load config, apply CLI overrides, and run until a signal arrives.
pub async fn run(cli: Cli) -> Result<(), BootstrapError> {
  let mut config = AppConfig::load(cli.config.as_deref())?;
  cli.apply(&mut config);

  let cancel = CancellationToken::new();
  spawn_signal_handler(cancel.clone());
  run_node(config, cli.standalone, cancel).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{ControlConfig, PlayerKind};

  struct TempDir(PathBuf);

  impl TempDir {
    fn new() -> Self {
      let path = std::env::temp_dir().join(format!("vidsync-boot-{}", uuid::Uuid::new_v4()));
      std::fs::create_dir_all(&path).unwrap();
      Self(path)
    }
  }

  impl Drop for TempDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn sleeper_config(media_dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.player.kind = PlayerKind::Custom;
    config.player.path = Some("/bin/sh".to_string());
    config.player.control = ControlConfig::None;
    config.player.custom_args = vec![
      "-c".to_string(),
      "exec sleep 30".to_string(),
      "player".to_string(),
      "{video}".to_string(),
    ];
    config.media_dir = Some(media_dir.0.to_string_lossy().into_owned());
    config.peer_host = "127.0.0.1".to_string();
    config.timing.startup_delay_secs = 0;
    config
  }

  fn with_video(media_dir: &TempDir) -> AppConfig {
    std::fs::write(media_dir.0.join("loop.mp4"), b"").unwrap();
    sleeper_config(media_dir)
  }

  fn unused_port() -> u16 {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
  }

  fn is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
  }

  #[test]
  fn test_cli_overrides_config() {
    let cli = Cli::try_parse_from([
      "vidsync",
      "--role",
      "slave",
      "--peer",
      "10.0.0.1",
      "--port",
      "6000",
      "--video",
      "/media/loop.mp4",
      "--standalone",
    ])
    .unwrap();
    let mut config = AppConfig::default();
    cli.apply(&mut config);

    assert!(cli.standalone);
    assert_eq!(config.role, Some(NodeRole::Slave));
    assert_eq!(config.peer_address(), "10.0.0.1:6000");
    assert_eq!(config.outputs[0].video.as_deref(), Some("/media/loop.mp4"));
    assert_eq!(config.media_dir, None);
  }

  #[test]
  fn test_role_by_hostname() {
    let mut config = AppConfig::default();
    assert_eq!(role_for_hostname(&config, "pi-a"), None);

    config.master_hostname = Some("PI-A".to_string());
    assert_eq!(role_for_hostname(&config, "pi-a"), Some(NodeRole::Master));
    assert_eq!(role_for_hostname(&config, "pi-b"), Some(NodeRole::Slave));

    config.role = Some(NodeRole::Slave);
    assert_eq!(resolve_role(&config).unwrap(), NodeRole::Slave);
  }

  #[tokio::test]
  async fn test_loopback_peer_is_ready() {
    let cancel = CancellationToken::new();
    let result = wait_for_network(
      "127.0.0.1:5005",
      Duration::from_secs(1),
      Duration::from_millis(100),
      &cancel,
    )
    .await;
    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn test_build_group_uses_every_output() {
    let media = TempDir::new();
    let mut config = sleeper_config(&media);
    config.outputs.push(Default::default());
    let group = build_group(&config, &CancellationToken::new()).unwrap();
    assert_eq!(group.controllers().len(), 2);
    assert_eq!(group.controllers()[1].name(), "output-1");
  }

  #[tokio::test]
  async fn test_standalone_without_media_fails_and_cleans_up() {
    let media = TempDir::new();
    let config = sleeper_config(&media);
    let result = run_node(config, true, CancellationToken::new()).await;
    assert!(matches!(result, Err(BootstrapError::NoVideo)));
  }

  #[tokio::test]
  async fn test_standalone_runs_until_cancelled() {
    let media = TempDir::new();
    std::fs::write(media.0.join("loop.mp4"), b"").unwrap();
    let config = sleeper_config(&media);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      trigger.cancel();
    });
    assert!(run_node(config, true, cancel).await.is_ok());
  }

  #[tokio::test]
  async fn test_master_without_peer_and_fallback_disabled_fails() {
    let media = TempDir::new();
    std::fs::write(media.0.join("loop.mp4"), b"").unwrap();
    let mut config = sleeper_config(&media);
    config.role = Some(NodeRole::Master);
    config.standalone_fallback = false;
    config.timing.peer_ready_timeout_secs = 1;
    config.timing.connect_timeout_secs = 1;
    config.timing.retry_interval_secs = 1;
    // Nothing listens on this port.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    config.control_port = unused.local_addr().unwrap().port();
    drop(unused);

    let result = run_node(config, false, CancellationToken::new()).await;
    assert!(matches!(result, Err(BootstrapError::PeerNotReady { .. })));
  }

  #[tokio::test]
  async fn test_failed_launch_does_not_stop_the_node() {
    let media = TempDir::new();
    let mut config = with_video(&media);
    config.player.path = Some("/nonexistent/player".to_string());

    let cancel = CancellationToken::new();
    let node = tokio::spawn(run_node(config, true, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!node.is_finished());

    cancel.cancel();
    assert!(node.await.unwrap().is_ok());
  }

  #[tokio::test]
  async fn test_master_plays_alone_when_peer_never_answers() {
    let media = TempDir::new();
    let mut config = with_video(&media);
    let pid_file = media.0.join("player.pid");
    config.player.custom_args[1] = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    config.role = Some(NodeRole::Master);
    config.standalone_fallback = true;
    config.timing.peer_ready_timeout_secs = 1;
    config.timing.connect_timeout_secs = 1;
    config.timing.retry_interval_secs = 1;
    config.control_port = unused_port();

    let cancel = CancellationToken::new();
    let node = tokio::spawn(run_node(config, false, cancel.clone()));

    // Past the peer-ready timeout: still running, still playing.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(!node.is_finished());
    let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(is_alive(pid));

    cancel.cancel();
    assert!(node.await.unwrap().is_ok());
    assert!(!is_alive(pid));
  }
}
