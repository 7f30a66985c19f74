//! Orchestration facade.
//!
//! The one boundary the UI talks to: intents in, a single merged update
//! stream out. Player-session events and download events are multiplexed
//! onto one bounded channel in arrival order, so a consumer never juggles
//! two sources or misses an interleaving. The channel exerts backpressure
//! by briefly blocking producers; nothing is ever dropped.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::constants::constants;
use crate::extractor::{MediaKind, MediaTarget};
use crate::job::JobId;
use crate::player::{LaunchMode, PlaybackState, PlayerCommand, PlayerSession, PlayerUpdate};
use crate::scheduler::{DownloadCommand, DownloadUpdate, QueueSnapshot, Scheduler};
use crate::supervisor::Supervisor;

/// Everything a UI (or the media-key adapter — just another caller) can ask
/// for.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
  PlayExternal(MediaTarget),
  PlayInTerminal(MediaTarget),
  PlayAudioOnly(MediaTarget),
  /// Control the current player session, if any.
  Playback(PlayerCommand),
  Download { target: MediaTarget, dest: PathBuf },
  DownloadControl { id: JobId, cmd: DownloadCommand },
  /// Explicit orphaned-partial cleanup of a directory. Never automatic.
  CleanupGarbage { dir: PathBuf },
  Shutdown,
}

/// The merged, origin-tagged update stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
  Player(PlayerUpdate),
  Download { id: JobId, update: DownloadUpdate },
  /// A download intent the scheduler would not accept (duplicate job or
  /// destination conflict).
  DownloadRefused { reason: String },
  GarbageCleaned { removed: usize },
}

enum Query {
  Snapshot(oneshot::Sender<QueueSnapshot>),
}

/// Handle to the orchestration core.
pub struct Orchestrator {
  intents: mpsc::Sender<Intent>,
  queries: mpsc::Sender<Query>,
  task: JoinHandle<()>,
}

impl Orchestrator {
  /// Start the core: supervisor, scheduler, and the facade loop. Returns
  /// the handle and the update stream.
  pub fn spawn(config: Config) -> (Self, mpsc::Receiver<Update>) {
    let (update_tx, update_rx) = mpsc::channel(constants().update_channel_capacity);
    let (intent_tx, intent_rx) = mpsc::channel(64);
    let (query_tx, query_rx) = mpsc::channel(8);

    let task = tokio::spawn(async move {
      FacadeLoop::new(config, update_tx).run(intent_rx, query_rx).await;
    });

    (Self { intents: intent_tx, queries: query_tx, task }, update_rx)
  }

  /// Submit an intent. Returns `false` if the core has already shut down.
  pub async fn send(&self, intent: Intent) -> bool {
    self.intents.send(intent).await.is_ok()
  }

  /// Cheap aggregate download status for polling.
  pub async fn snapshot(&self) -> QueueSnapshot {
    let (reply, rx) = oneshot::channel();
    if self.queries.send(Query::Snapshot(reply)).await.is_err() {
      return QueueSnapshot::default();
    }
    rx.await.unwrap_or_default()
  }

  /// Shut the core down: player torn down, active downloads paused with
  /// partials preserved, every child process reaped.
  pub async fn shutdown(self) {
    let _ = self.intents.send(Intent::Shutdown).await;
    let _ = self.task.await;
  }
}

struct FacadeLoop {
  supervisor: Supervisor,
  scheduler: Scheduler,
  player_bin: String,
  initial_volume: Option<i64>,
  session: Option<PlayerSession>,
  session_counter: u64,
  player_tx: mpsc::Sender<PlayerUpdate>,
  player_rx: mpsc::Receiver<PlayerUpdate>,
  download_rx: mpsc::Receiver<(JobId, DownloadUpdate)>,
  updates: mpsc::Sender<Update>,
}

impl FacadeLoop {
  fn new(config: Config, updates: mpsc::Sender<Update>) -> Self {
    let supervisor = Supervisor::new();
    let (download_tx, download_rx) = mpsc::channel(constants().update_channel_capacity);
    let scheduler = Scheduler::spawn(
      supervisor.clone(),
      config.extractor_bin().to_string(),
      config.max_concurrent_downloads(),
      download_tx,
    );
    let (player_tx, player_rx) = mpsc::channel(constants().update_channel_capacity);

    Self {
      supervisor,
      scheduler,
      player_bin: config.player_bin().to_string(),
      initial_volume: config.volume,
      session: None,
      session_counter: 0,
      player_tx,
      player_rx,
      download_rx,
      updates,
    }
  }

  async fn run(mut self, mut intents: mpsc::Receiver<Intent>, mut queries: mpsc::Receiver<Query>) {
    loop {
      tokio::select! {
        intent = intents.recv() => {
          match intent {
            None | Some(Intent::Shutdown) => break,
            Some(intent) => self.handle_intent(intent).await,
          }
        }
        Some(query) = queries.recv() => {
          match query {
            Query::Snapshot(reply) => {
              let _ = reply.send(self.scheduler.snapshot().await);
            }
          }
        }
        Some(update) = self.player_rx.recv() => {
          let _ = self.updates.send(Update::Player(update)).await;
        }
        Some((id, update)) = self.download_rx.recv() => {
          let _ = self.updates.send(Update::Download { id, update }).await;
        }
      }
    }

    info!(live_processes = self.supervisor.live_count(), "orchestrator shutting down");
    if let Some(session) = self.session.take() {
      session.stop().await;
    }
    self.scheduler.shutdown().await;
    self.supervisor.shutdown().await;
  }

  async fn handle_intent(&mut self, intent: Intent) {
    match intent {
      Intent::PlayExternal(target) => self.start_session(target, LaunchMode::ExternalWindow).await,
      Intent::PlayInTerminal(target) => self.start_session(target, LaunchMode::TerminalOutput).await,
      Intent::PlayAudioOnly(mut target) => {
        target.kind = MediaKind::AudioOnly;
        self.start_session(target, LaunchMode::AudioOnly).await;
      }
      Intent::Playback(cmd) => {
        // A session whose loop already ended is a stale slot — drop it.
        if self.session.as_ref().is_some_and(|session| session.is_finished()) {
          self.session = None;
        }
        match &self.session {
          Some(session) => {
            session.send(cmd);
          }
          None => {
            warn!(?cmd, "playback control with no active player session");
            let _ = self.updates.send(Update::Player(PlayerUpdate::State(PlaybackState::Idle))).await;
          }
        }
      }
      Intent::Download { target, dest } => {
        if let Err(e) = self.scheduler.enqueue(target, dest).await {
          let _ = self.updates.send(Update::DownloadRefused { reason: e.to_string() }).await;
        }
      }
      Intent::DownloadControl { id, cmd } => self.scheduler.control(id, cmd).await,
      Intent::CleanupGarbage { dir } => {
        let removed = self.scheduler.cleanup_garbage(dir).await;
        let _ = self.updates.send(Update::GarbageCleaned { removed }).await;
      }
      Intent::Shutdown => unreachable!("Shutdown is handled by the run loop"),
    }
  }

  /// Launch a player session, superseding any live one. The previous
  /// session is fully torn down first, so exactly one player process exists
  /// afterwards.
  async fn start_session(&mut self, target: MediaTarget, mode: LaunchMode) {
    if let Some(old) = self.session.take() {
      info!("superseding current player session");
      old.stop().await;
    }
    self.session_counter += 1;
    let session = PlayerSession::launch(
      self.supervisor.clone(),
      self.player_bin.clone(),
      target,
      mode,
      self.session_counter,
      self.player_tx.clone(),
    );
    if let Some(volume) = self.initial_volume {
      session.send(PlayerCommand::SetVolume(volume));
    }
    self.session = Some(session);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::JobState;
  use crate::player::PlaybackState;
  use std::path::Path;
  use std::time::Duration;
  use tokio::time::timeout;

  fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tapedeck-facade-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  /// Config pointing both tools at binaries that don't exist, so every
  /// spawn fails fast and deterministically.
  fn broken_tools_config(dir: &Path) -> Config {
    Config {
      download_dir: Some(dir.to_path_buf()),
      max_concurrent_downloads: Some(2),
      player_bin: Some("tapedeck-test-missing-player".to_string()),
      extractor_bin: Some("tapedeck-test-missing-extractor".to_string()),
      volume: None,
    }
  }

  async fn next_update(rx: &mut mpsc::Receiver<Update>) -> Update {
    timeout(Duration::from_secs(10), rx.recv()).await.expect("update in time").expect("stream open")
  }

  // --- download routing ---

  #[tokio::test]
  async fn download_intent_flows_to_failed_update_when_extractor_is_missing() {
    let dir = test_dir("download");
    let (orchestrator, mut updates) = Orchestrator::spawn(broken_tools_config(&dir));

    let target = MediaTarget::video("https://example.com/v");
    assert!(orchestrator.send(Intent::Download { target, dest: dir.join("v.mp4") }).await);

    let mut states = Vec::new();
    loop {
      match next_update(&mut updates).await {
        Update::Download { update: DownloadUpdate::State(state), .. } => states.push(state),
        Update::Download { update: DownloadUpdate::Failed { error, .. }, .. } => {
          assert!(error.contains("not found"), "spawn failure surfaced: {}", error);
          break;
        }
        other => panic!("unexpected update: {:?}", other),
      }
    }
    assert_eq!(states, vec![JobState::Queued, JobState::Downloading]);
    orchestrator.shutdown().await;
  }

  #[tokio::test]
  async fn duplicate_download_is_refused() {
    let dir = test_dir("dup");
    // An "extractor" that ignores its arguments and blocks, so the first
    // job reliably stays live while the duplicate arrives.
    let stub = write_stub(&dir, "stub-extractor", "exec sleep 30");
    let mut config = broken_tools_config(&dir);
    config.extractor_bin = Some(stub.to_string_lossy().to_string());
    let (orchestrator, mut updates) = Orchestrator::spawn(config);

    let dest = dir.join("same.mp4");
    let a = MediaTarget::video("https://example.com/a");
    let b = MediaTarget::video("https://example.com/b");
    orchestrator.send(Intent::Download { target: a, dest: dest.clone() }).await;
    orchestrator.send(Intent::Download { target: b, dest }).await;

    let mut refused = false;
    for _ in 0..8 {
      if let Update::DownloadRefused { reason } = next_update(&mut updates).await {
        assert!(reason.contains("already"), "reason: {}", reason);
        refused = true;
        break;
      }
    }
    assert!(refused, "second download should have been refused");
    orchestrator.shutdown().await;
  }

  // --- cleanup routing ---

  #[tokio::test]
  async fn cleanup_garbage_reports_removed_count() {
    let dir = test_dir("cleanup");
    std::fs::write(dir.join("orphan-a.mp4.part"), b"x").unwrap();
    std::fs::write(dir.join("orphan-b.mp4.part"), b"x").unwrap();
    std::fs::write(dir.join("keep.mp4"), b"x").unwrap();

    let (orchestrator, mut updates) = Orchestrator::spawn(broken_tools_config(&dir));
    orchestrator.send(Intent::CleanupGarbage { dir: dir.clone() }).await;

    match next_update(&mut updates).await {
      Update::GarbageCleaned { removed } => assert_eq!(removed, 2),
      other => panic!("unexpected update: {:?}", other),
    }
    assert!(dir.join("keep.mp4").exists());
    orchestrator.shutdown().await;
  }

  // --- player routing ---

  #[tokio::test]
  async fn play_intent_with_missing_player_surfaces_one_structured_error() {
    let dir = test_dir("play");
    let (orchestrator, mut updates) = Orchestrator::spawn(broken_tools_config(&dir));

    orchestrator.send(Intent::PlayExternal(MediaTarget::video("https://example.com/v"))).await;

    assert_eq!(next_update(&mut updates).await, Update::Player(PlayerUpdate::State(PlaybackState::Launching)));
    match next_update(&mut updates).await {
      Update::Player(PlayerUpdate::SessionError(message)) => assert!(message.contains("not found")),
      other => panic!("unexpected update: {:?}", other),
    }
    assert_eq!(next_update(&mut updates).await, Update::Player(PlayerUpdate::State(PlaybackState::Errored)));
    orchestrator.shutdown().await;
  }
}
