//! Extractor progress-line parsing.
//!
//! The extractor reports progress as ad-hoc human-readable lines:
//!
//! ```text
//! [download] Destination: /downloads/clip.mp4
//! [download]  23.5% of 10.00MiB at 2.50MiB/s ETA 00:04
//! [download] 100% of 10.00MiB in 00:05
//! ```
//!
//! This module is the one place that knows that format. Everything else
//! consumes [`ProgressEvent`], so an extractor output change stays a
//! one-file fix. Unrecognised lines parse to `None` and are ignored.

use std::path::PathBuf;

/// One recognised progress line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
  /// The extractor announced where it is writing.
  Destination(PathBuf),
  /// A transfer-progress tick. Totals are optional — the extractor may not
  /// know the final size up front (`~` estimates are accepted as totals).
  Downloading { percent: f64, total_bytes: Option<u64>, speed_bps: Option<f64>, eta_secs: Option<u64> },
  /// The target file already exists in full.
  AlreadyComplete,
  /// A partial file is being continued from the given byte offset.
  Resuming { offset_bytes: u64 },
}

/// Parse one extractor output line. Returns `None` for anything that is not
/// a recognised progress line — unknown lines are never an error.
pub fn parse_progress(line: &str) -> Option<ProgressEvent> {
  let rest = line.trim().strip_prefix("[download]")?.trim();

  if let Some(path) = rest.strip_prefix("Destination:") {
    let path = path.trim();
    if path.is_empty() {
      return None;
    }
    return Some(ProgressEvent::Destination(PathBuf::from(path)));
  }

  if rest.ends_with("has already been downloaded") {
    return Some(ProgressEvent::AlreadyComplete);
  }

  if let Some(offset) = rest.strip_prefix("Resuming download at byte ") {
    return offset.trim().parse().ok().map(|offset_bytes| ProgressEvent::Resuming { offset_bytes });
  }

  // Transfer tick: "<pct>% of [~]<size> at <rate> ETA <clock>" with any of
  // the trailing fields possibly missing or "Unknown".
  let mut percent = None;
  let mut total_bytes = None;
  let mut speed_bps = None;
  let mut eta_secs = None;

  let mut prev: Option<&str> = None;
  for token in rest.split_whitespace() {
    if percent.is_none()
      && let Some(number) = token.strip_suffix('%')
      && let Ok(value) = number.parse::<f64>()
    {
      percent = Some(value);
    } else {
      match prev {
        Some("of") => total_bytes = parse_size(token.trim_start_matches('~')),
        Some("at") => speed_bps = parse_rate(token),
        Some("ETA") => eta_secs = parse_clock(token),
        _ => {}
      }
    }
    prev = Some(token);
  }

  percent.map(|percent| ProgressEvent::Downloading { percent, total_bytes, speed_bps, eta_secs })
}

/// Parse a size like `10.00MiB` or `523.4KiB` into bytes.
fn parse_size(token: &str) -> Option<u64> {
  const UNITS: [(&str, f64); 9] = [
    ("KiB", 1024.0),
    ("MiB", 1024.0 * 1024.0),
    ("GiB", 1024.0 * 1024.0 * 1024.0),
    ("TiB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("KB", 1000.0),
    ("MB", 1000.0 * 1000.0),
    ("GB", 1000.0 * 1000.0 * 1000.0),
    ("TB", 1000.0 * 1000.0 * 1000.0 * 1000.0),
    ("B", 1.0),
  ];
  for (suffix, factor) in UNITS {
    if let Some(number) = token.strip_suffix(suffix) {
      return number.parse::<f64>().ok().map(|value| (value * factor).round() as u64);
    }
  }
  None
}

/// Parse a rate like `2.50MiB/s` into bytes per second.
fn parse_rate(token: &str) -> Option<f64> {
  token.strip_suffix("/s").and_then(parse_size).map(|bytes| bytes as f64)
}

/// Parse a clock like `00:04` or `1:02:03` into seconds.
fn parse_clock(token: &str) -> Option<u64> {
  let parts: Vec<&str> = token.split(':').collect();
  if parts.is_empty() || parts.len() > 3 {
    return None;
  }
  let mut secs: u64 = 0;
  for part in parts {
    secs = secs.checked_mul(60)?.checked_add(part.parse().ok()?)?;
  }
  Some(secs)
}

#[cfg(test)]
mod tests {
  use super::*;

  // --- transfer ticks ---

  #[test]
  fn parses_full_progress_line() {
    let event = parse_progress("[download]  23.5% of 10.00MiB at 2.50MiB/s ETA 00:04").unwrap();
    assert_eq!(
      event,
      ProgressEvent::Downloading {
        percent: 23.5,
        total_bytes: Some(10 * 1024 * 1024),
        speed_bps: Some(2.5 * 1024.0 * 1024.0),
        eta_secs: Some(4),
      }
    );
  }

  #[test]
  fn parses_estimated_total() {
    let event = parse_progress("[download]   1.2% of ~523.40MiB at 1.00MiB/s ETA 08:37").unwrap();
    match event {
      ProgressEvent::Downloading { percent, total_bytes, eta_secs, .. } => {
        assert_eq!(percent, 1.2);
        assert_eq!(total_bytes, Some((523.4 * 1024.0 * 1024.0f64).round() as u64));
        assert_eq!(eta_secs, Some(8 * 60 + 37));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[test]
  fn unknown_rate_and_eta_parse_as_none() {
    let event = parse_progress("[download]  50.0% of 4.00MiB at Unknown speed ETA Unknown").unwrap();
    match event {
      ProgressEvent::Downloading { percent, speed_bps, eta_secs, .. } => {
        assert_eq!(percent, 50.0);
        assert_eq!(speed_bps, None);
        assert_eq!(eta_secs, None);
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[test]
  fn parses_completion_line() {
    let event = parse_progress("[download] 100% of 10.00MiB in 00:05").unwrap();
    match event {
      ProgressEvent::Downloading { percent, total_bytes, .. } => {
        assert_eq!(percent, 100.0);
        assert_eq!(total_bytes, Some(10 * 1024 * 1024));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[test]
  fn parses_hms_eta() {
    let event = parse_progress("[download]  0.1% of 9.00GiB at 512.00KiB/s ETA 1:02:03").unwrap();
    match event {
      ProgressEvent::Downloading { eta_secs, .. } => assert_eq!(eta_secs, Some(3723)),
      other => panic!("unexpected event: {:?}", other),
    }
  }

  // --- markers ---

  #[test]
  fn parses_destination() {
    let event = parse_progress("[download] Destination: /downloads/clip.mp4.part").unwrap();
    assert_eq!(event, ProgressEvent::Destination(PathBuf::from("/downloads/clip.mp4.part")));
  }

  #[test]
  fn parses_already_downloaded() {
    let event = parse_progress("[download] /downloads/clip.mp4 has already been downloaded").unwrap();
    assert_eq!(event, ProgressEvent::AlreadyComplete);
  }

  #[test]
  fn parses_resume_offset() {
    let event = parse_progress("[download] Resuming download at byte 1048576").unwrap();
    assert_eq!(event, ProgressEvent::Resuming { offset_bytes: 1048576 });
  }

  // --- tolerance ---

  #[test]
  fn unrecognised_lines_are_ignored() {
    assert_eq!(parse_progress("[youtube] abc123: Downloading webpage"), None);
    assert_eq!(parse_progress("[Merger] Merging formats into clip.mp4"), None);
    assert_eq!(parse_progress("WARNING: unable to extract uploader"), None);
    assert_eq!(parse_progress(""), None);
  }

  #[test]
  fn download_prefix_without_percent_is_ignored() {
    assert_eq!(parse_progress("[download] Downloading item 1 of 3"), None);
  }

  // --- units ---

  #[test]
  fn parses_size_units() {
    assert_eq!(parse_size("1.00KiB"), Some(1024));
    assert_eq!(parse_size("2MB"), Some(2_000_000));
    assert_eq!(parse_size("100B"), Some(100));
    assert_eq!(parse_size("nonsense"), None);
  }
}
