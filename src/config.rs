//! Node configuration loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_DIR_NAME: &str = "vidsync";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Which side of the control plane this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
  Master,
  Slave,
}

impl std::fmt::Display for NodeRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      NodeRole::Master => f.write_str("master"),
      NodeRole::Slave => f.write_str("slave"),
    }
  }
}

/// External player binary family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
  Mpv,
  Vlc,
  Ffplay,
  /// Arbitrary program driven by `customArgs`.
  Custom,
}

/// Remote-control side channel to the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlConfig {
  /// No side channel; resync is a no-op.
  None,
  /// mpv gets a private IPC socket, VLC gets an `rc` port, others none.
  Auto,
  /// mpv JSON IPC on a unix socket.
  MpvIpc { path: String },
  /// Line-oriented `rc` interface on a TCP address.
  Rc { address: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
  pub x: i32,
  pub y: i32,
  pub width: u32,
  pub height: u32,
}

/// Where and how a player renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTarget {
  #[serde(default = "default_true")]
  pub fullscreen: bool,

  #[serde(rename = "loop", default = "default_true")]
  pub loop_playback: bool,

  #[serde(default)]
  pub geometry: Option<Rect>,

  /// Screen index, output name or video-output module, depending on player.
  #[serde(default)]
  pub display_selector: Option<String>,
}

impl Default for DisplayTarget {
  fn default() -> Self {
    Self {
      fullscreen: true,
      loop_playback: true,
      geometry: None,
      display_selector: None,
    }
  }
}

/// One display driven by one player process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
  /// Explicit video file; falls back to media directory discovery.
  #[serde(default)]
  pub video: Option<String>,

  #[serde(default)]
  pub display: DisplayTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  #[serde(default = "default_player_kind")]
  pub kind: PlayerKind,

  /// Player executable (None = look it up on PATH).
  #[serde(default)]
  pub path: Option<String>,

  /// Appended to the built-in argument list.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Full argument list for `custom` players; `{video}` is replaced.
  #[serde(default)]
  pub custom_args: Vec<String>,

  #[serde(default = "default_control")]
  pub control: ControlConfig,
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      kind: default_player_kind(),
      path: None,
      extra_args: Vec::new(),
      custom_args: Vec::new(),
      control: default_control(),
    }
  }
}

/// Timeouts, intervals and restart policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_secs: u64,
  #[serde(default = "default_reply_timeout")]
  pub reply_timeout_secs: u64,
  #[serde(default = "default_retry_interval")]
  pub retry_interval_secs: u64,
  #[serde(default = "default_sync_interval")]
  pub sync_interval_secs: u64,
  #[serde(default = "default_heartbeat_interval")]
  pub heartbeat_interval_secs: u64,
  #[serde(default = "default_peer_ready_timeout")]
  pub peer_ready_timeout_secs: u64,
  #[serde(default = "default_monitor_interval")]
  pub monitor_interval_ms: u64,
  #[serde(default = "default_terminate_timeout")]
  pub terminate_timeout_secs: u64,
  #[serde(default = "default_restart_cooldown")]
  pub restart_cooldown_secs: u64,
  #[serde(default = "default_extended_cooldown")]
  pub extended_cooldown_secs: u64,
  #[serde(default = "default_max_failures")]
  pub max_consecutive_failures: u32,
  #[serde(default = "default_settle_delay")]
  pub settle_delay_ms: u64,
  #[serde(default = "default_control_retries")]
  pub control_connect_retries: u32,
  #[serde(default = "default_network_timeout")]
  pub network_timeout_secs: u64,
  #[serde(default = "default_network_poll")]
  pub network_poll_secs: u64,
  /// Wait before touching the display stack at boot.
  #[serde(default = "default_startup_delay")]
  pub startup_delay_secs: u64,
  /// Pause between launching consecutive outputs.
  #[serde(default = "default_output_stagger")]
  pub output_stagger_ms: u64,
}

impl Default for TimingConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: default_connect_timeout(),
      reply_timeout_secs: default_reply_timeout(),
      retry_interval_secs: default_retry_interval(),
      sync_interval_secs: default_sync_interval(),
      heartbeat_interval_secs: default_heartbeat_interval(),
      peer_ready_timeout_secs: default_peer_ready_timeout(),
      monitor_interval_ms: default_monitor_interval(),
      terminate_timeout_secs: default_terminate_timeout(),
      restart_cooldown_secs: default_restart_cooldown(),
      extended_cooldown_secs: default_extended_cooldown(),
      max_consecutive_failures: default_max_failures(),
      settle_delay_ms: default_settle_delay(),
      control_connect_retries: default_control_retries(),
      network_timeout_secs: default_network_timeout(),
      network_poll_secs: default_network_poll(),
      startup_delay_secs: default_startup_delay(),
      output_stagger_ms: default_output_stagger(),
    }
  }
}

impl TimingConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub fn reply_timeout(&self) -> Duration {
    Duration::from_secs(self.reply_timeout_secs)
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.retry_interval_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval_secs)
  }

  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_secs(self.heartbeat_interval_secs)
  }

  pub fn peer_ready_timeout(&self) -> Duration {
    Duration::from_secs(self.peer_ready_timeout_secs)
  }

  pub fn monitor_interval(&self) -> Duration {
    Duration::from_millis(self.monitor_interval_ms)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  pub fn network_poll(&self) -> Duration {
    Duration::from_secs(self.network_poll_secs)
  }

  pub fn startup_delay(&self) -> Duration {
    Duration::from_secs(self.startup_delay_secs)
  }

  pub fn output_stagger(&self) -> Duration {
    Duration::from_millis(self.output_stagger_ms)
  }
}

/// Steady-state resync strategy of the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
  /// Send `SYNC_NOW` on every tick.
  SyncNow,
  /// Probe with `CHECK_SYNC` and resync only on `NEED_SYNC`.
  CheckSync,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  /// Explicit role (None = decide by hostname).
  #[serde(default)]
  pub role: Option<NodeRole>,

  /// Hostname of the master node, used when `role` is unset.
  #[serde(default)]
  pub master_hostname: Option<String>,

  /// Slave address for the master; allowed source address for the slave.
  #[serde(default = "default_peer_host")]
  pub peer_host: String,

  #[serde(default = "default_control_port")]
  pub control_port: u16,

  /// Listener bind address on the slave.
  #[serde(default = "default_bind_address")]
  pub bind_address: String,

  #[serde(default)]
  pub player: PlayerConfig,

  #[serde(default = "default_outputs")]
  pub outputs: Vec<OutputConfig>,

  /// Mount point searched for videos when an output has none.
  #[serde(default)]
  pub media_dir: Option<String>,

  #[serde(default = "default_video_extensions")]
  pub video_extensions: Vec<String>,

  #[serde(default)]
  pub timing: TimingConfig,

  /// Play unsynchronized when no peer or network is available.
  #[serde(default = "default_true")]
  pub standalone_fallback: bool,

  #[serde(default = "default_sync_mode")]
  pub sync_mode: SyncMode,
}

fn default_true() -> bool {
  true
}

fn default_player_kind() -> PlayerKind {
  PlayerKind::Mpv
}

fn default_control() -> ControlConfig {
  ControlConfig::Auto
}

fn default_peer_host() -> String {
  "192.168.1.2".to_string()
}

fn default_control_port() -> u16 {
  5005
}

fn default_bind_address() -> String {
  "0.0.0.0".to_string()
}

fn default_outputs() -> Vec<OutputConfig> {
  vec![OutputConfig::default()]
}

fn default_video_extensions() -> Vec<String> {
  ["mp4", "avi", "mkv", "mov"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sync_mode() -> SyncMode {
  SyncMode::CheckSync
}

fn default_connect_timeout() -> u64 {
  5
}

fn default_reply_timeout() -> u64 {
  10
}

fn default_retry_interval() -> u64 {
  5
}

fn default_sync_interval() -> u64 {
  60
}

fn default_heartbeat_interval() -> u64 {
  10
}

fn default_peer_ready_timeout() -> u64 {
  30
}

fn default_monitor_interval() -> u64 {
  1000
}

fn default_terminate_timeout() -> u64 {
  3
}

fn default_restart_cooldown() -> u64 {
  10
}

fn default_extended_cooldown() -> u64 {
  60
}

fn default_max_failures() -> u32 {
  3
}

fn default_settle_delay() -> u64 {
  100
}

fn default_control_retries() -> u32 {
  10
}

fn default_network_timeout() -> u64 {
  60
}

fn default_network_poll() -> u64 {
  2
}

fn default_startup_delay() -> u64 {
  5
}

fn default_output_stagger() -> u64 {
  500
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      role: None,
      master_hostname: None,
      peer_host: default_peer_host(),
      control_port: default_control_port(),
      bind_address: default_bind_address(),
      player: PlayerConfig::default(),
      outputs: default_outputs(),
      media_dir: None,
      video_extensions: default_video_extensions(),
      timing: TimingConfig::default(),
      standalone_fallback: true,
      sync_mode: default_sync_mode(),
    }
  }
}

fn host_port(host: &str, port: u16) -> String {
  match host.parse::<std::net::Ipv6Addr>() {
    Ok(ip) => format!("[{}]:{}", ip, port),
    Err(_) => format!("{}:{}", host, port),
  }
}

/// Default config location (`~/.config/vidsync/config.json` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl AppConfig {
  /// Load configuration.
  ///
  /// An explicit path must exist. Without one, the default location is tried
  /// and defaults are used if nothing is there.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let (path, required) = match path {
      Some(p) => (p.to_path_buf(), true),
      None => match default_config_path() {
        Some(p) => (p, false),
        None => return Ok(Self::default()),
      },
    };

    if !required && !path.exists() {
      log::info!("No config at {:?}, using defaults", path);
      return Ok(Self::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
      path: path.clone(),
      source,
    })?;
    let config = Self::from_json(&text)?;
    log::info!("Loaded config from {:?}", path);
    Ok(config)
  }

  /// `peerHost:controlPort`, bracketing IPv6 literals.
  pub fn peer_address(&self) -> String {
    host_port(&self.peer_host, self.control_port)
  }

  /// Listener address on the slave.
  pub fn bind_endpoint(&self) -> String {
    host_port(&self.bind_address, self.control_port)
  }

  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(text)?)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.peer_host.trim().is_empty() {
      return Err(ConfigError::Invalid("Peer host cannot be empty".to_string()));
    }
    if self.control_port == 0 {
      return Err(ConfigError::Invalid("Control port cannot be 0".to_string()));
    }
    if self.outputs.is_empty() {
      return Err(ConfigError::Invalid(
        "At least one output is required".to_string(),
      ));
    }
    if self.player.kind == PlayerKind::Custom && self.player.path.is_none() {
      return Err(ConfigError::Invalid(
        "Custom players need an explicit path".to_string(),
      ));
    }
    let t = &self.timing;
    if t.connect_timeout_secs == 0
      || t.reply_timeout_secs == 0
      || t.retry_interval_secs == 0
      || t.sync_interval_secs == 0
      || t.heartbeat_interval_secs == 0
      || t.monitor_interval_ms == 0
      || t.network_poll_secs == 0
    {
      return Err(ConfigError::Invalid(
        "Timeouts and intervals must be greater than zero".to_string(),
      ));
    }
    if t.max_consecutive_failures == 0 {
      return Err(ConfigError::Invalid(
        "maxConsecutiveFailures must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}
