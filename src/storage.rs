//! Partial-artifact bookkeeping.
//!
//! A download in flight writes to `<final>.part`; the extractor may add a
//! `.ytdl` resume sidecar next to it. Completion renames the partial onto
//! the final name (atomic — same directory). Cleanup of leftovers is an
//! explicit, user-triggered operation: it must never touch the partial of
//! a live job, and it is never run automatically so another instance's
//! in-progress work stays safe.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::constants;

/// The in-flight path for a destination: `clip.mp4` → `clip.mp4.part`.
pub fn partial_path(dest: &Path) -> PathBuf {
  let mut name = dest.file_name().unwrap_or_default().to_os_string();
  name.push(".");
  name.push(&constants().partial_suffix);
  dest.with_file_name(name)
}

/// The extractor's resume sidecar for a partial: `clip.mp4.part` →
/// `clip.mp4.part.ytdl`.
pub fn sidecar_path(partial: &Path) -> PathBuf {
  let mut name = partial.file_name().unwrap_or_default().to_os_string();
  name.push(".ytdl");
  partial.with_file_name(name)
}

/// Whether a file name marks an incomplete download artifact (the partial
/// itself or the extractor's resume sidecar).
fn is_garbage_name(name: &str) -> bool {
  name.ends_with(&format!(".{}", constants().partial_suffix)) || name.ends_with(".ytdl")
}

/// Promote a finished partial to its final name. Same-directory rename, so
/// the swap is atomic on every sane filesystem.
pub fn finalize(partial: &Path, dest: &Path) -> io::Result<()> {
  std::fs::rename(partial, dest)
}

/// Collect incomplete-download artifacts in `dir` that no live job owns.
///
/// `live` holds the partial paths of every non-terminal job; their resume
/// sidecars are protected along with them.
pub fn scan_orphans(dir: &Path, live: &HashSet<PathBuf>) -> Vec<PathBuf> {
  let mut orphans = Vec::new();
  let Ok(entries) = std::fs::read_dir(dir) else {
    return orphans;
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if !path.is_file() {
      continue;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };
    if !is_garbage_name(name) {
      continue;
    }
    let owned = live.contains(&path)
      || name.strip_suffix(".ytdl").is_some_and(|stem| live.contains(&path.with_file_name(stem)));
    if !owned {
      orphans.push(path);
    }
  }
  orphans
}

/// Remove orphaned artifacts from `dir`, returning how many were deleted.
pub fn cleanup_garbage(dir: &Path, live: &HashSet<PathBuf>) -> usize {
  let mut removed = 0;
  for path in scan_orphans(dir, live) {
    match std::fs::remove_file(&path) {
      Ok(()) => {
        debug!(path = %path.display(), "removed orphaned partial artifact");
        removed += 1;
      }
      Err(e) => {
        warn!(path = %path.display(), err = %e, "failed to remove orphaned artifact");
      }
    }
  }
  removed
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tapedeck-storage-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn touch(path: &Path) {
    std::fs::write(path, b"x").unwrap();
  }

  // --- naming ---

  #[test]
  fn partial_path_appends_suffix() {
    assert_eq!(partial_path(Path::new("/d/clip.mp4")), PathBuf::from("/d/clip.mp4.part"));
    assert_eq!(partial_path(Path::new("/d/no_ext")), PathBuf::from("/d/no_ext.part"));
  }

  #[test]
  fn garbage_names() {
    assert!(is_garbage_name("clip.mp4.part"));
    assert!(is_garbage_name("clip.mp4.part.ytdl"));
    assert!(!is_garbage_name("clip.mp4"));
    assert!(!is_garbage_name("notes.txt"));
  }

  // --- finalize ---

  #[test]
  fn finalize_renames_partial_onto_destination() {
    let dir = test_dir("finalize");
    let dest = dir.join("clip.mp4");
    let partial = partial_path(&dest);
    touch(&partial);

    finalize(&partial, &dest).unwrap();
    assert!(dest.exists());
    assert!(!partial.exists());
  }

  // --- cleanup ---

  #[test]
  fn cleanup_removes_only_orphans() {
    let dir = test_dir("cleanup");
    let live_partial = dir.join("live.mp4.part");
    let orphan_a = dir.join("old-a.mp4.part");
    let orphan_b = dir.join("old-b.webm.part");
    let finished = dir.join("done.mp4");
    touch(&live_partial);
    touch(&orphan_a);
    touch(&orphan_b);
    touch(&finished);

    let live: HashSet<PathBuf> = [live_partial.clone()].into();
    let removed = cleanup_garbage(&dir, &live);

    assert_eq!(removed, 2);
    assert!(live_partial.exists(), "live job's partial must survive cleanup");
    assert!(finished.exists(), "finished artifacts are not garbage");
    assert!(!orphan_a.exists());
    assert!(!orphan_b.exists());
  }

  #[test]
  fn cleanup_protects_live_resume_sidecar() {
    let dir = test_dir("sidecar");
    let live_partial = dir.join("live.mp4.part");
    let live_sidecar = dir.join("live.mp4.part.ytdl");
    let orphan_sidecar = dir.join("old.mp4.part.ytdl");
    touch(&live_partial);
    touch(&live_sidecar);
    touch(&orphan_sidecar);

    let live: HashSet<PathBuf> = [live_partial.clone()].into();
    let removed = cleanup_garbage(&dir, &live);

    assert_eq!(removed, 1);
    assert!(live_sidecar.exists());
    assert!(!orphan_sidecar.exists());
  }

  #[test]
  fn cleanup_of_missing_dir_is_a_noop() {
    let live = HashSet::new();
    assert_eq!(cleanup_garbage(Path::new("/definitely/not/a/dir"), &live), 0);
  }
}
