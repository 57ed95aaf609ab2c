//! Crash watchdog: restarts outputs whose player died or stopped answering.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::player::{PlaybackController, PlaybackGroup};

/// Poll `controller` every `interval` until cancelled.
pub async fn watch(controller: Arc<PlaybackController>, interval: Duration, cancel: CancellationToken) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = ticker.tick() => {}
    }

    // Stopped outputs (no requested video) are left alone.
    let Some(video) = controller.video().await else {
      continue;
    };
    if controller.check_running().await {
      continue;
    }

    log::warn!("[{}] Player is down, restarting", controller.name());
    tokio::select! {
      _ = cancel.cancelled() => break,
      result = controller.start(&video) => {
        if let Err(e) = result {
          log::error!("[{}] Restart failed: {}", controller.name(), e);
        }
      }
    }
  }
  log::debug!("[{}] Monitor stopped", controller.name());
}

/// One watchdog task per output.
pub fn spawn_all(group: &PlaybackGroup, interval: Duration, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
  group
    .controllers()
    .iter()
    .map(|controller| tokio::spawn(watch(controller.clone(), interval, cancel.clone())))
    .collect()
}
