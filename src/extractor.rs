//! Extractor-backed search and metadata.
//!
//! The extractor resolves queries and URLs into playable targets. Listings
//! use its tab-separated `--print` output (one line per entry); per-URL
//! format tables come from its JSON dump. Parsing is tolerant: a mangled
//! line drops that entry, never the whole listing.

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::constants::constants;

/// What kind of stream a target should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Video,
  AudioOnly,
}

/// A playable or downloadable resource, as selected by the user.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTarget {
  pub url: String,
  /// Extractor format selector (e.g. `137+140`). `None` lets the
  /// extractor/player pick per `kind`.
  pub format: Option<String>,
  pub kind: MediaKind,
}

impl MediaTarget {
  pub fn video(url: impl Into<String>) -> Self {
    Self { url: url.into(), format: None, kind: MediaKind::Video }
  }

  pub fn audio(url: impl Into<String>) -> Self {
    Self { url: url.into(), format: None, kind: MediaKind::AudioOnly }
  }

  pub fn with_format(mut self, format: impl Into<String>) -> Self {
    self.format = Some(format.into());
    self
  }

  /// The format selector to hand the extractor for a download.
  pub fn download_format(&self) -> &str {
    match (&self.format, self.kind) {
      (Some(format), _) => format,
      (None, MediaKind::AudioOnly) => "bestaudio/best",
      (None, MediaKind::Video) => "bestvideo*+bestaudio/best",
    }
  }
}

/// A single entry from a search or playlist listing.
#[derive(Debug, Clone, Serialize)]
pub struct SearchEntry {
  pub title: String,
  pub id: String,
  pub url: String,
  pub uploader: Option<String>,
  pub duration: Option<String>,
  pub thumbnail: Option<String>,
}

/// One downloadable format of a single media URL.
#[derive(Debug, Clone)]
pub struct FormatEntry {
  pub format_id: String,
  pub ext: String,
  pub resolution: String,
  pub note: String,
  pub filesize: Option<u64>,
}

fn missing_tool_error(e: std::io::Error, bin: &str) -> anyhow::Error {
  if e.kind() == std::io::ErrorKind::NotFound {
    anyhow!("{} not found. Install it with: brew install {} (macOS) or pip install {} (Linux)", bin, bin, bin)
  } else {
    anyhow!(e).context(format!("Failed to execute {}", bin))
  }
}

/// Parse a single tab-separated listing line into a SearchEntry.
/// Expected format: `title\tid\turl[\tuploader\tduration\tthumbnail]`
fn parse_search_line(line: &str) -> Option<SearchEntry> {
  let parts: Vec<&str> = line.split('\t').collect();
  if parts.len() < 3 {
    return None;
  }
  let title = parts[0].trim().to_string();
  let id = parts[1].trim().to_string();
  let url = parts[2].trim().to_string();
  if id.is_empty() || url.is_empty() {
    return None;
  }
  let opt = |idx: usize| -> Option<String> {
    parts.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty() && *s != "NA").map(|s| s.to_string())
  };
  Some(SearchEntry { title, id, url, uploader: opt(3), duration: opt(4), thumbnail: opt(5) })
}

fn parse_search_output(stdout: &str) -> Vec<SearchEntry> {
  stdout.lines().map(str::trim).filter(|l| !l.is_empty()).filter_map(parse_search_line).collect()
}

/// Search for media matching a query. A URL is listed directly; free text
/// goes through the extractor's search shorthand.
pub async fn search(bin: &str, query: &str, limit: usize) -> Result<Vec<SearchEntry>> {
  let is_url = query.starts_with("http://") || query.starts_with("https://");
  let search_arg = if is_url { query.to_string() } else { format!("ytsearch{}:{}", limit, query) };

  let output = Command::new(bin)
    .args([
      "--print",
      &constants().search_print_format,
      "--flat-playlist",
      "--skip-download",
      "--ignore-errors",
      "--no-warnings",
      "--",
      &search_arg,
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .await
    .map_err(|e| missing_tool_error(e, bin))?;

  if !output.status.success() {
    return Err(anyhow!("{} search failed: {}", bin, String::from_utf8_lossy(&output.stderr).trim()));
  }

  let stdout = String::from_utf8(output.stdout).context("extractor output non-UTF8")?;
  Ok(parse_search_output(&stdout))
}

/// List the downloadable formats of one URL from the extractor's JSON dump.
pub async fn formats(bin: &str, url: &str) -> Result<Vec<FormatEntry>> {
  let output = Command::new(bin)
    .args(["--dump-json", "--no-playlist", "--no-warnings", "--", url])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .await
    .map_err(|e| missing_tool_error(e, bin))?;

  if !output.status.success() {
    return Err(anyhow!("{} metadata fetch failed: {}", bin, String::from_utf8_lossy(&output.stderr).trim()));
  }

  let stdout = String::from_utf8(output.stdout).context("extractor output non-UTF8")?;
  let val: Value = serde_json::from_str(&stdout).context("Failed to parse extractor JSON")?;
  Ok(parse_formats(&val))
}

fn parse_formats(val: &Value) -> Vec<FormatEntry> {
  let Some(list) = val.get("formats").and_then(|f| f.as_array()) else {
    return Vec::new();
  };
  let mut formats: Vec<FormatEntry> = list
    .iter()
    .filter_map(|f| {
      let format_id = f.get("format_id").and_then(|v| v.as_str())?.to_string();
      Some(FormatEntry {
        format_id,
        ext: f.get("ext").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        resolution: f.get("resolution").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
        note: f.get("format_note").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        filesize: f.get("filesize").and_then(|v| v.as_u64()).or_else(|| f.get("filesize_approx").and_then(|v| v.as_u64())),
      })
    })
    .collect();
  // Best formats last in extractor output; show them first.
  formats.reverse();
  formats
}

/// Resolve the final output filename the extractor would use for a target.
/// Needed up front so the download job owns its partial path.
pub async fn resolve_filename(bin: &str, target: &MediaTarget) -> Result<String> {
  let output = Command::new(bin)
    .args([
      "--print",
      "filename",
      "-f",
      target.download_format(),
      "--skip-download",
      "--no-playlist",
      "--no-warnings",
      "--",
      &target.url,
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .await
    .map_err(|e| missing_tool_error(e, bin))?;

  if !output.status.success() {
    return Err(anyhow!("{} filename resolution failed: {}", bin, String::from_utf8_lossy(&output.stderr).trim()));
  }

  let stdout = String::from_utf8(output.stdout).context("extractor output non-UTF8")?;
  let name = stdout.lines().next().map(str::trim).unwrap_or_default();
  if name.is_empty() {
    return Err(anyhow!("extractor reported an empty filename for {}", target.url));
  }
  // Strip any directory components the template may have produced.
  Ok(name.rsplit('/').next().unwrap_or(name).to_string())
}

/// Metadata filled in by background enrichment of flat listings.
#[derive(Debug, Clone)]
pub struct EntryMeta {
  pub id: String,
  pub uploader: Option<String>,
  pub duration: Option<String>,
}

/// Enrich flat listing entries with uploader/duration metadata. Spawns up
/// to `enrich_concurrency` extractor processes; each result is sent through
/// `tx` as it becomes available.
pub async fn enrich_entries(bin: &str, urls: Vec<(String, String)>, tx: mpsc::Sender<EntryMeta>) {
  use futures::stream::{self, StreamExt};

  let bin = bin.to_string();
  stream::iter(urls)
    .map(|(id, url)| {
      let tx = tx.clone();
      let bin = bin.clone();
      async move {
        let result = Command::new(&bin)
          .args(["--print", "%(uploader)s\t%(duration_string)s", "--skip-download", "--no-warnings", "--", &url])
          .stdin(Stdio::null())
          .stdout(Stdio::piped())
          .stderr(Stdio::null())
          .output()
          .await;

        if let Ok(output) = result
          && output.status.success()
          && let Ok(stdout) = String::from_utf8(output.stdout)
        {
          let parts: Vec<&str> = stdout.trim().split('\t').collect();
          let opt = |idx: usize| -> Option<String> {
            parts.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty() && *s != "NA").map(|s| s.to_string())
          };
          let _ = tx.send(EntryMeta { id, uploader: opt(0), duration: opt(1) }).await;
        }
      }
    })
    .buffer_unordered(constants().enrich_concurrency)
    .collect::<()>()
    .await;
}
