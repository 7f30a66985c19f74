//! Application constants loaded from `constants.ron` at compile time.
//!
//! The RON file is embedded via `include_str!` so it's always available —
//! no runtime file I/O. Parsed once on first access via `LazyLock`.

use serde::Deserialize;
use std::sync::LazyLock;

/// All tuneable application constants.
#[derive(Debug, Deserialize)]
pub struct Constants {
  // External binaries
  pub player_bin: String,
  pub extractor_bin: String,

  // Player IPC
  pub socket_prefix: String,
  pub ipc_connect_timeout_ms: u64,
  pub ipc_connect_retry_ms: u64,
  pub ipc_command_timeout_ms: u64,
  pub file_loaded_timeout_ms: u64,

  // Process supervision
  pub terminate_grace_ms: u64,

  // Downloads
  pub max_concurrent_downloads: usize,
  pub stall_timeout_secs: u64,
  pub progress_update_interval_ms: u64,
  pub speed_smoothing_alpha: f64,
  pub partial_suffix: String,

  // Facade
  pub update_channel_capacity: usize,

  // Extractor listings
  pub search_limit: usize,
  pub search_print_format: String,
  pub enrich_concurrency: usize,
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Safety: the RON file is embedded at compile time; if it's malformed this is a build-time error.
  ron::from_str(include_str!("../constants.ron")).expect("constants.ron must be valid RON (embedded at compile time)")
});

/// Returns a reference to the parsed application constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}
