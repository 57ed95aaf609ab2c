//! Video file discovery on an already mounted removable volume.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::AppConfig;

#[derive(Error, Debug)]
pub enum MediaError {
  #[error("Cannot read media directory {path:?}: {source}")]
  Unreadable {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Video file not found: {0:?}")]
  Missing(PathBuf),
  #[error("No video available for output {0}")]
  NoVideo(usize),
}

/// Prefix of AppleDouble files macOS leaves on FAT volumes.
const RESOURCE_FORK_PREFIX: &str = "._";

fn is_video(name: &str, extensions: &[String]) -> bool {
  if name.starts_with(RESOURCE_FORK_PREFIX) {
    return false;
  }
  let Some((_, ext)) = name.rsplit_once('.') else {
    return false;
  };
  extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// All videos in `dir`, sorted by file name.
pub fn list_videos(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, MediaError> {
  let entries = std::fs::read_dir(dir).map_err(|source| MediaError::Unreadable {
    path: dir.to_path_buf(),
    source,
  })?;

  let mut videos: Vec<PathBuf> = entries
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
    .filter(|entry| {
      entry
        .file_name()
        .to_str()
        .map(|name| is_video(name, extensions))
        .unwrap_or(false)
    })
    .map(|entry| entry.path())
    .collect();
  videos.sort();
  Ok(videos)
}

/// First video in `dir`, if any.
pub fn find_first_video(dir: &Path, extensions: &[String]) -> Result<Option<PathBuf>, MediaError> {
  Ok(list_videos(dir, extensions)?.into_iter().next())
}

/// Resolve one video per configured output.
///
/// An explicit per-output path wins; otherwise outputs take the media
/// directory's videos in order, wrapping around when there are fewer
/// videos than outputs.
pub fn resolve_videos(config: &AppConfig) -> Result<Vec<PathBuf>, MediaError> {
  let discovered = match &config.media_dir {
    Some(dir) => list_videos(Path::new(dir), &config.video_extensions)?,
    None => Vec::new(),
  };

  config
    .outputs
    .iter()
    .enumerate()
    .map(|(index, output)| match &output.video {
      Some(video) => {
        let path = PathBuf::from(video);
        if path.is_file() {
          Ok(path)
        } else {
          Err(MediaError::Missing(path))
        }
      }
      None if discovered.is_empty() => Err(MediaError::NoVideo(index)),
      None => Ok(discovered[index % discovered.len()].clone()),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::OutputConfig;

  struct TempDir(PathBuf);

  impl TempDir {
    fn new() -> Self {
      let path = std::env::temp_dir().join(format!("vidsync-media-{}", uuid::Uuid::new_v4()));
      std::fs::create_dir_all(&path).unwrap();
      Self(path)
    }

    fn touch(&self, name: &str) -> PathBuf {
      let path = self.0.join(name);
      std::fs::write(&path, b"").unwrap();
      path
    }
  }

  impl Drop for TempDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn extensions() -> Vec<String> {
    AppConfig::default().video_extensions
  }

  #[test]
  fn test_skips_resource_forks_and_other_files() {
    let dir = TempDir::new();
    dir.touch("._1.mp4");
    dir.touch("notes.txt");
    dir.touch("b.MKV");
    let a = dir.touch("a.mov");
    std::fs::create_dir(dir.0.join("folder.mp4")).unwrap();

    let videos = list_videos(&dir.0, &extensions()).unwrap();
    assert_eq!(videos.len(), 2);
    assert_eq!(find_first_video(&dir.0, &extensions()).unwrap(), Some(a));
  }

  #[test]
  fn test_empty_dir_has_no_video() {
    let dir = TempDir::new();
    assert_eq!(find_first_video(&dir.0, &extensions()).unwrap(), None);
  }

  #[test]
  fn test_missing_dir_is_error() {
    let path = std::env::temp_dir().join(format!("vidsync-none-{}", uuid::Uuid::new_v4()));
    assert!(matches!(
      find_first_video(&path, &extensions()),
      Err(MediaError::Unreadable { .. })
    ));
  }

  #[test]
  fn test_resolve_videos_per_output() {
    let dir = TempDir::new();
    let one = dir.touch("1.mp4");
    let two = dir.touch("2.mp4");

    let mut config = AppConfig::default();
    config.media_dir = Some(dir.0.to_string_lossy().into_owned());
    config.outputs = vec![OutputConfig::default(); 3];
    let videos = resolve_videos(&config).unwrap();
    assert_eq!(videos, vec![one.clone(), two, one.clone()]);

    config.outputs[1].video = Some(one.to_string_lossy().into_owned());
    config.outputs[2].video = Some(dir.0.join("gone.mp4").to_string_lossy().into_owned());
    assert!(matches!(resolve_videos(&config), Err(MediaError::Missing(_))));
  }

  #[test]
  fn test_resolve_without_media_is_no_video() {
    let config = AppConfig::default();
    assert!(matches!(resolve_videos(&config), Err(MediaError::NoVideo(0))));
  }
}
