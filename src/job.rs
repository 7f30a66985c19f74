//! One download job: a supervised extractor process plus its state machine.
//!
//! The extractor is pointed at the job's partial path with resume enabled,
//! so pausing is just a graceful terminate — a later run continues the same
//! bytes. The job owns the partial artifact until completion (finalize
//! rename) or cancellation (deletion).

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::error::CoreError;
use crate::extractor::MediaTarget;
use crate::progress::{ProgressEvent, parse_progress};
use crate::storage;
use crate::supervisor::{Supervisor, describe_exit};

/// Stable job identity, derived from what the job does rather than when it
/// was created: the same (url, destination) pair maps to the same id across
/// restarts and retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
  pub fn derive(url: &str, dest: &Path) -> Self {
    // DefaultHasher::new() uses fixed keys, so this is stable across runs.
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    dest.hash(&mut hasher);
    Self(format!("{:016x}", hasher.finish()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Queued,
  Downloading,
  Paused,
  Completed,
  Failed,
  Cancelled,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
  }
}

/// Derived transfer numbers for one job. Totals stay `None` until the
/// extractor reports them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobProgress {
  pub percent: f64,
  pub downloaded_bytes: Option<u64>,
  pub total_bytes: Option<u64>,
  /// EMA-smoothed transfer rate.
  pub speed_bps: Option<f64>,
  pub eta_secs: Option<u64>,
}

/// What a running job reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
  /// The extractor process is up.
  Started,
  Progress(JobProgress),
  /// Gracefully terminated with the partial preserved.
  Paused,
  Completed { path: PathBuf },
  /// `diagnostic` is the last output line captured before death, verbatim.
  Failed { error: String, diagnostic: Option<String> },
  Cancelled,
}

/// Control intents a running job accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCtl {
  Pause,
  Cancel,
}

/// Everything a runner needs to know about its job.
#[derive(Debug, Clone)]
pub struct JobSpec {
  pub id: JobId,
  pub target: MediaTarget,
  pub dest: PathBuf,
  pub partial: PathBuf,
  pub stall_timeout: Duration,
}

impl JobSpec {
  pub fn new(target: MediaTarget, dest: PathBuf) -> Self {
    let id = JobId::derive(&target.url, &dest);
    let partial = storage::partial_path(&dest);
    Self { id, target, dest, partial, stall_timeout: Duration::from_secs(constants().stall_timeout_secs) }
  }
}

// ---------------------------------------------------------------------------
// Speed smoothing
// ---------------------------------------------------------------------------

/// Exponential moving average over raw rate samples, so the displayed speed
/// doesn't jitter with every progress line.
#[derive(Debug, Default)]
struct SmoothedSpeed {
  current: Option<f64>,
}

impl SmoothedSpeed {
  fn update(&mut self, sample: f64) -> f64 {
    let alpha = constants().speed_smoothing_alpha;
    let next = match self.current {
      Some(prev) => alpha * sample + (1.0 - alpha) * prev,
      None => sample,
    };
    self.current = Some(next);
    next
  }
}

// ---------------------------------------------------------------------------
// Extractor invocation
// ---------------------------------------------------------------------------

/// Arguments for one download run. `--continue` + `--no-part` make the
/// extractor write the partial path directly and resume it if it exists, so
/// pause/resume is just process stop/restart. Whether the extractor truly
/// continues or restarts from zero is version-dependent — best effort.
fn extractor_args(target: &MediaTarget, partial: &Path) -> Vec<String> {
  vec![
    "-f".to_string(),
    target.download_format().to_string(),
    "--newline".to_string(),
    "--progress".to_string(),
    "--continue".to_string(),
    "--no-part".to_string(),
    "--no-playlist".to_string(),
    "--no-warnings".to_string(),
    "-o".to_string(),
    partial.to_string_lossy().to_string(),
    "--".to_string(),
    target.url.clone(),
  ]
}

/// Spawn the runner task for one admission of this job.
pub fn spawn(
  supervisor: Supervisor,
  extractor_bin: &str,
  spec: JobSpec,
  ctl_rx: mpsc::Receiver<JobCtl>,
  events: mpsc::Sender<(JobId, JobEvent)>,
) -> JoinHandle<()> {
  let mut cmd = Command::new(extractor_bin);
  cmd.args(extractor_args(&spec.target, &spec.partial));
  cmd.stdin(Stdio::null());
  cmd.stdout(Stdio::piped());
  cmd.stderr(Stdio::piped());
  spawn_with(supervisor, extractor_bin.to_string(), cmd, spec, ctl_rx, events)
}

/// Seam used by `spawn` and by tests (which substitute a scripted process
/// for the real extractor).
fn spawn_with(
  supervisor: Supervisor,
  program: String,
  cmd: Command,
  spec: JobSpec,
  ctl_rx: mpsc::Receiver<JobCtl>,
  events: mpsc::Sender<(JobId, JobEvent)>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    run_job(supervisor, program, cmd, spec, ctl_rx, events).await;
  })
}

async fn run_job(
  supervisor: Supervisor,
  program: String,
  mut cmd: Command,
  spec: JobSpec,
  mut ctl_rx: mpsc::Receiver<JobCtl>,
  events: mpsc::Sender<(JobId, JobEvent)>,
) {
  let send = |event: JobEvent| {
    let events = events.clone();
    let id = spec.id.clone();
    async move {
      let _ = events.send((id, event)).await;
    }
  };

  if let Some(parent) = spec.dest.parent()
    && let Err(e) = tokio::fs::create_dir_all(parent).await
  {
    send(JobEvent::Failed { error: format!("cannot create destination directory: {}", e), diagnostic: None }).await;
    return;
  }

  let mut handle = match supervisor.spawn(&program, &mut cmd) {
    Ok(handle) => handle,
    Err(e) => {
      send(JobEvent::Failed { error: e.user_message(), diagnostic: None }).await;
      return;
    }
  };
  info!(id = %spec.id, pid = ?handle.pid(), url = %spec.target.url, partial = %spec.partial.display(), "download started");
  send(JobEvent::Started).await;

  let mut stdout_lines = handle.take_stdout().map(|out| BufReader::new(out).lines());
  let mut stderr_lines = handle.take_stderr().map(|err| BufReader::new(err).lines());

  let throttle = Duration::from_millis(constants().progress_update_interval_ms);
  let mut last_sent = Instant::now() - throttle;
  let mut stall_deadline = Instant::now() + spec.stall_timeout;
  let mut progress = JobProgress::default();
  let mut speed = SmoothedSpeed::default();
  let mut last_line: Option<String> = None;

  loop {
    tokio::select! {
      line = next_line(&mut stdout_lines) => {
        if let Some(line) = line {
          if apply_line(&line, &mut progress, &mut speed, &mut last_line) {
            stall_deadline = Instant::now() + spec.stall_timeout;
            if last_sent.elapsed() >= throttle {
              send(JobEvent::Progress(progress.clone())).await;
              last_sent = Instant::now();
            }
          }
        }
      }

      line = next_line(&mut stderr_lines) => {
        if let Some(line) = line
          && !line.trim().is_empty()
        {
          debug!(id = %spec.id, line = %line, "extractor stderr");
          last_line = Some(line);
        }
      }

      _ = tokio::time::sleep_until(stall_deadline) => {
        warn!(id = %spec.id, "download stalled, giving up");
        let _ = handle.terminate().await;
        let error = CoreError::Stall { stalled_secs: spec.stall_timeout.as_secs() };
        send(JobEvent::Failed { error: error.to_string(), diagnostic: last_line }).await;
        return;
      }

      ctl = ctl_rx.recv() => {
        match ctl {
          Some(JobCtl::Pause) => {
            // Graceful stop; the extractor checkpoints the partial.
            let _ = handle.terminate().await;
            info!(id = %spec.id, "download paused");
            send(JobEvent::Paused).await;
            return;
          }
          Some(JobCtl::Cancel) => {
            let _ = handle.terminate().await;
            remove_partial(&spec);
            info!(id = %spec.id, "download cancelled");
            send(JobEvent::Cancelled).await;
            return;
          }
          // Scheduler is gone (shutdown): stop quietly, keep the partial
          // so the download stays resumable next run.
          None => {
            let _ = handle.terminate().await;
            return;
          }
        }
      }

      status = handle.wait() => {
        // The process can exit before its final lines are consumed; drain
        // briefly so the last diagnostic is captured verbatim.
        drain_output(&mut stdout_lines, &mut stderr_lines, &mut progress, &mut speed, &mut last_line).await;
        match status {
          Ok(status) if status.success() => {
            match finish(&spec) {
              Ok(path) => {
                info!(id = %spec.id, path = %path.display(), "download completed");
                send(JobEvent::Completed { path }).await;
              }
              Err(error) => send(JobEvent::Failed { error, diagnostic: last_line }).await,
            }
          }
          Ok(status) => {
            let error = CoreError::Crash {
              program: program.clone(),
              status: describe_exit(status),
              diagnostic: last_line.clone().unwrap_or_else(|| "no diagnostic output".to_string()),
            };
            send(JobEvent::Failed { error: error.to_string(), diagnostic: last_line }).await;
          }
          Err(e) => {
            send(JobEvent::Failed { error: format!("failed to wait on extractor: {}", e), diagnostic: last_line }).await;
          }
        }
        return;
      }
    }
  }
}

/// Read the next line from an optional stream; `None` once exhausted. A
/// finished stream parks forever so its select arm goes quiet instead of
/// busy-looping.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
  match lines {
    Some(reader) => match reader.next_line().await {
      Ok(Some(line)) => Some(line),
      Ok(None) | Err(_) => {
        *lines = None;
        std::future::pending().await
      }
    },
    None => std::future::pending().await,
  }
}

/// Fold one stdout line into the job's numbers. Returns whether the line
/// counted as progress (and therefore resets the stall watchdog).
fn apply_line(
  line: &str,
  progress: &mut JobProgress,
  speed: &mut SmoothedSpeed,
  last_line: &mut Option<String>,
) -> bool {
  match parse_progress(line) {
    Some(ProgressEvent::Downloading { percent, total_bytes, speed_bps, eta_secs }) => {
      progress.percent = percent;
      if total_bytes.is_some() {
        progress.total_bytes = total_bytes;
      }
      progress.downloaded_bytes =
        progress.total_bytes.map(|total| ((percent / 100.0) * total as f64).round() as u64);
      progress.speed_bps = speed_bps.map(|sample| speed.update(sample));
      progress.eta_secs = eta_secs;
      true
    }
    Some(ProgressEvent::AlreadyComplete) => {
      progress.percent = 100.0;
      true
    }
    Some(ProgressEvent::Resuming { offset_bytes }) => {
      debug!(offset_bytes, "extractor resuming partial");
      true
    }
    Some(ProgressEvent::Destination(_)) => true,
    None => {
      if !line.trim().is_empty() {
        *last_line = Some(line.to_string());
      }
      false
    }
  }
}

/// Consume whatever output is still buffered after process exit.
async fn drain_output<O: AsyncBufRead + Unpin, E: AsyncBufRead + Unpin>(
  stdout: &mut Option<Lines<O>>,
  stderr: &mut Option<Lines<E>>,
  progress: &mut JobProgress,
  speed: &mut SmoothedSpeed,
  last_line: &mut Option<String>,
) {
  if let Some(lines) = stdout {
    while let Ok(Ok(Some(line))) = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await {
      apply_line(&line, progress, speed, last_line);
    }
  }
  if let Some(lines) = stderr {
    while let Ok(Ok(Some(line))) = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await {
      if !line.trim().is_empty() {
        *last_line = Some(line);
      }
    }
  }
}

/// Zero exit: promote the partial to the final artifact and verify it is
/// actually there.
fn finish(spec: &JobSpec) -> Result<PathBuf, String> {
  if spec.partial.exists()
    && let Err(e) = storage::finalize(&spec.partial, &spec.dest)
  {
    return Err(format!("failed to finalize {}: {}", spec.dest.display(), e));
  }
  // The resume sidecar has served its purpose.
  let _ = std::fs::remove_file(storage::sidecar_path(&spec.partial));
  if spec.dest.exists() {
    Ok(spec.dest.clone())
  } else {
    Err("extractor exited cleanly but produced no artifact".to_string())
  }
}

fn remove_partial(spec: &JobSpec) {
  let _ = std::fs::remove_file(&spec.partial);
  let _ = std::fs::remove_file(storage::sidecar_path(&spec.partial));
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::time::timeout;

  fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tapedeck-job-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", script]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
  }

  fn spec_in(dir: &Path, stall_secs: u64) -> JobSpec {
    let mut spec = JobSpec::new(MediaTarget::video("https://example.com/v"), dir.join("out.bin"));
    spec.stall_timeout = Duration::from_secs(stall_secs);
    spec
  }

  async fn run_scripted(
    script: &str,
    spec: JobSpec,
  ) -> (mpsc::Sender<JobCtl>, mpsc::Receiver<(JobId, JobEvent)>) {
    let (ctl_tx, ctl_rx) = mpsc::channel(4);
    let (event_tx, event_rx) = mpsc::channel(64);
    let _ = spawn_with(Supervisor::new(), "sh".to_string(), sh(script), spec, ctl_rx, event_tx);
    (ctl_tx, event_rx)
  }

  async fn next_event(rx: &mut mpsc::Receiver<(JobId, JobEvent)>) -> JobEvent {
    timeout(Duration::from_secs(10), rx.recv()).await.expect("event in time").expect("channel open").1
  }

  // --- identity ---

  #[test]
  fn job_ids_are_stable_and_distinct() {
    let a1 = JobId::derive("https://a", Path::new("/d/a.mp4"));
    let a2 = JobId::derive("https://a", Path::new("/d/a.mp4"));
    let b = JobId::derive("https://b", Path::new("/d/b.mp4"));
    assert_eq!(a1, a2);
    assert_ne!(a1, b);
  }

  // --- invocation ---

  #[test]
  fn extractor_args_resume_into_partial() {
    let target = MediaTarget::video("https://example.com/v").with_format("22");
    let args = extractor_args(&target, Path::new("/d/clip.mp4.part"));
    assert!(args.contains(&"--continue".to_string()));
    assert!(args.contains(&"--no-part".to_string()));
    assert!(args.contains(&"--newline".to_string()));
    let o_idx = args.iter().position(|a| a == "-o").unwrap();
    assert_eq!(args[o_idx + 1], "/d/clip.mp4.part");
    let f_idx = args.iter().position(|a| a == "-f").unwrap();
    assert_eq!(args[f_idx + 1], "22");
    assert_eq!(args.last().unwrap(), "https://example.com/v");
  }

  // --- smoothing ---

  #[test]
  fn speed_smoothing_damps_jitter() {
    let mut speed = SmoothedSpeed::default();
    assert_eq!(speed.update(1000.0), 1000.0);
    let second = speed.update(2000.0);
    assert!(second > 1000.0 && second < 2000.0);
  }

  // --- progress folding ---

  #[test]
  fn progress_lines_update_numbers_and_reset_watchdog() {
    let mut progress = JobProgress::default();
    let mut speed = SmoothedSpeed::default();
    let mut last_line = None;

    assert!(apply_line("[download]  50.0% of 2.00MiB at 1.00MiB/s ETA 00:01", &mut progress, &mut speed, &mut last_line));
    assert_eq!(progress.percent, 50.0);
    assert_eq!(progress.total_bytes, Some(2 * 1024 * 1024));
    assert_eq!(progress.downloaded_bytes, Some(1024 * 1024));
    assert!(last_line.is_none());

    assert!(!apply_line("ERROR: fragment not found", &mut progress, &mut speed, &mut last_line));
    assert_eq!(last_line.as_deref(), Some("ERROR: fragment not found"));
  }

  // --- lifecycle, scripted ---

  #[tokio::test]
  async fn completes_and_finalizes_partial() {
    let dir = test_dir("complete");
    let spec = spec_in(&dir, 30);
    std::fs::write(&spec.partial, b"payload").unwrap();

    let script = "echo '[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01'; exit 0";
    let (_ctl, mut events) = run_scripted(script, spec.clone()).await;

    assert_eq!(next_event(&mut events).await, JobEvent::Started);
    let mut saw_completed = false;
    for _ in 0..4 {
      match next_event(&mut events).await {
        JobEvent::Completed { path } => {
          assert_eq!(path, spec.dest);
          saw_completed = true;
          break;
        }
        JobEvent::Progress(progress) => assert_eq!(progress.percent, 50.0),
        other => panic!("unexpected event: {:?}", other),
      }
    }
    assert!(saw_completed);
    assert!(spec.dest.exists());
    assert!(!spec.partial.exists(), "partial must be renamed away on completion");
  }

  #[tokio::test]
  async fn failure_captures_last_line_verbatim() {
    let dir = test_dir("fail");
    let spec = spec_in(&dir, 30);

    let script = "echo 'ERROR: unable to download video data' >&2; exit 1";
    let (_ctl, mut events) = run_scripted(script, spec).await;

    assert_eq!(next_event(&mut events).await, JobEvent::Started);
    match next_event(&mut events).await {
      JobEvent::Failed { error, diagnostic } => {
        assert_eq!(diagnostic.as_deref(), Some("ERROR: unable to download video data"));
        assert!(error.contains("exit code 1"));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn cancel_removes_the_partial() {
    let dir = test_dir("cancel");
    let spec = spec_in(&dir, 30);
    std::fs::write(&spec.partial, b"half").unwrap();

    let (ctl, mut events) = run_scripted("sleep 30", spec.clone()).await;
    assert_eq!(next_event(&mut events).await, JobEvent::Started);

    ctl.send(JobCtl::Cancel).await.unwrap();
    assert_eq!(next_event(&mut events).await, JobEvent::Cancelled);
    assert!(!spec.partial.exists(), "cancel must delete the partial artifact");
  }

  #[tokio::test]
  async fn pause_preserves_the_partial() {
    let dir = test_dir("pause");
    let spec = spec_in(&dir, 30);
    std::fs::write(&spec.partial, b"half").unwrap();

    let (ctl, mut events) = run_scripted("sleep 30", spec.clone()).await;
    assert_eq!(next_event(&mut events).await, JobEvent::Started);

    ctl.send(JobCtl::Pause).await.unwrap();
    assert_eq!(next_event(&mut events).await, JobEvent::Paused);
    assert!(spec.partial.exists(), "pause must preserve the partial artifact");
  }

  #[tokio::test]
  async fn stall_times_out_into_failed() {
    let dir = test_dir("stall");
    let spec = spec_in(&dir, 1);

    let (_ctl, mut events) = run_scripted("echo 'starting up'; sleep 30", spec).await;
    assert_eq!(next_event(&mut events).await, JobEvent::Started);
    match next_event(&mut events).await {
      JobEvent::Failed { error, diagnostic } => {
        assert!(error.contains("no download progress"));
        assert_eq!(diagnostic.as_deref(), Some("starting up"));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }
}
