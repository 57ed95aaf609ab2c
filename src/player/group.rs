//! All local outputs of a node, driven together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::controller::{ControllerError, PlaybackController};
use crate::media::MediaError;

/// Finds the videos to play, one per output.
pub type VideoResolver = Arc<dyn Fn() -> Result<Vec<PathBuf>, MediaError> + Send + Sync>;

/// Outcome of bringing local playback up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
  Ready,
  NoVideo,
}

pub struct PlaybackGroup {
  controllers: Vec<Arc<PlaybackController>>,
  resolver: VideoResolver,
  videos: RwLock<Option<Vec<PathBuf>>>,
  stagger: Duration,
}

impl PlaybackGroup {
  pub fn new(controllers: Vec<Arc<PlaybackController>>, resolver: VideoResolver) -> Self {
    Self {
      controllers,
      resolver,
      videos: RwLock::new(None),
      stagger: Duration::ZERO,
    }
  }

  /// Pause between launching consecutive outputs.
  pub fn with_stagger(mut self, stagger: Duration) -> Self {
    self.stagger = stagger;
    self
  }

  pub fn controllers(&self) -> &[Arc<PlaybackController>] {
    &self.controllers
  }

  /// Cached videos, resolving them on first use. Media may show up late
  /// (USB stick plugged in after boot), so failures are not cached.
  fn videos(&self) -> Result<Vec<PathBuf>, MediaError> {
    if let Some(videos) = self.videos.read().as_ref() {
      return Ok(videos.clone());
    }
    let videos = (self.resolver)()?;
    *self.videos.write() = Some(videos.clone());
    Ok(videos)
  }

  /// Start every output that is not already playing.
  pub async fn ensure_running(&self) -> Result<Readiness, ControllerError> {
    self.bring_up(false).await
  }

  /// Like `ensure_running`, but also replaces players that are alive and
  /// no longer answering.
  pub async fn recover(&self) -> Result<Readiness, ControllerError> {
    self.bring_up(true).await
  }

  /// A failed output does not keep the others from starting. Errors only
  /// when no output is playing afterwards.
  async fn bring_up(&self, replace_unhealthy: bool) -> Result<Readiness, ControllerError> {
    let videos = match self.videos() {
      Ok(videos) => videos,
      Err(e) => {
        log::warn!("No local media: {}", e);
        return Ok(Readiness::NoVideo);
      }
    };

    let mut playing = 0;
    let mut first_error = None;
    let last = self.controllers.len().min(videos.len()).saturating_sub(1);
    for (index, (controller, video)) in self.controllers.iter().zip(videos.iter()).enumerate() {
      let result = if replace_unhealthy && !controller.check_running().await {
        controller.start(video).await.map(|()| true)
      } else {
        controller.ensure_running(video).await
      };

      match result {
        Ok(launched) => {
          playing += 1;
          if launched {
            log::info!("[{}] Local playback started", controller.name());
            // Let the display settle before the next player grabs it.
            if index < last && !self.stagger.is_zero() {
              tokio::time::sleep(self.stagger).await;
            }
          }
        }
        Err(ControllerError::ShuttingDown) => return Err(ControllerError::ShuttingDown),
        Err(e) => {
          log::error!("[{}] Failed to start playback: {}", controller.name(), e);
          first_error.get_or_insert(e);
        }
      }
    }

    match first_error {
      Some(e) if playing == 0 => Err(e),
      _ => Ok(Readiness::Ready),
    }
  }

  /// True only if every output is playing and responsive.
  pub async fn check_running(&self) -> bool {
    for controller in &self.controllers {
      if !controller.check_running().await {
        return false;
      }
    }
    !self.controllers.is_empty()
  }

  /// Resync every output; failures are logged and do not stop the others.
  pub async fn resync(&self) {
    for controller in &self.controllers {
      if let Err(e) = controller.resync().await {
        log::warn!("[{}] Resync failed: {}", controller.name(), e);
      }
    }
  }

  pub async fn stop(&self) {
    for controller in &self.controllers {
      controller.stop().await;
    }
  }
}
