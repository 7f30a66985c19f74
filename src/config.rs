use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::constants;

/// User preferences persisted as TOML under the platform config dir.
///
/// Every field is optional; `None` falls back to the built-in default.
/// Load and save are best-effort — a missing or malformed prefs file never
/// prevents startup.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Config {
  pub download_dir: Option<PathBuf>,
  pub max_concurrent_downloads: Option<usize>,
  pub player_bin: Option<String>,
  pub extractor_bin: Option<String>,
  pub volume: Option<i64>,
}

impl Config {
  pub fn load() -> Self {
    if let Some(proj_dirs) = ProjectDirs::from("", "", "tapedeck") {
      let config_file = proj_dirs.config_dir().join("prefs.toml");
      if let Ok(content) = std::fs::read_to_string(config_file)
        && let Ok(config) = toml::from_str(&content)
      {
        return config;
      }
    }
    Self::default()
  }

  pub fn save(&self) {
    if let Some(proj_dirs) = ProjectDirs::from("", "", "tapedeck") {
      let config_dir = proj_dirs.config_dir();
      if std::fs::create_dir_all(config_dir).is_ok() {
        let config_file = config_dir.join("prefs.toml");
        if let Ok(content) = toml::to_string(self) {
          let _ = std::fs::write(config_file, content);
        }
      }
    }
  }

  /// Destination directory for downloads: configured path, or
  /// `<video dir>/tapedeck`, or `~/tapedeck` as a last resort.
  pub fn download_dir(&self) -> PathBuf {
    if let Some(dir) = &self.download_dir {
      return dir.clone();
    }
    if let Some(user_dirs) = UserDirs::new() {
      if let Some(video_dir) = user_dirs.video_dir() {
        return video_dir.join("tapedeck");
      }
      return user_dirs.home_dir().join("tapedeck");
    }
    PathBuf::from("tapedeck")
  }

  pub fn max_concurrent_downloads(&self) -> usize {
    self.max_concurrent_downloads.unwrap_or(constants().max_concurrent_downloads).max(1)
  }

  pub fn player_bin(&self) -> &str {
    self.player_bin.as_deref().unwrap_or(&constants().player_bin)
  }

  pub fn extractor_bin(&self) -> &str {
    self.extractor_bin.as_deref().unwrap_or(&constants().extractor_bin)
  }
}
