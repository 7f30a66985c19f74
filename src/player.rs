//! Player session control.
//!
//! One [`PlayerSession`] wraps one player process and its IPC channel. The
//! session is an actor: commands go in over a channel, state updates come
//! out over the shared update stream. At most one session is alive at a
//! time — the facade tears the previous one down before launching the next.

use serde_json::{Value, json};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::error::CoreError;
use crate::extractor::MediaTarget;
use crate::ipc::{self, IpcConnection, IpcEvent};
use crate::supervisor::{ProcessHandle, Supervisor, describe_exit};

/// Where playback happens. The control protocol is identical across modes;
/// only launch arguments differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
  /// Player opens its own window.
  ExternalWindow,
  /// Player renders into the terminal cells.
  TerminalOutput,
  /// No video track at all.
  AudioOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
  Idle,
  Launching,
  Playing,
  Paused,
  Seeking,
  Stopped,
  Errored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
  /// Signed offset in seconds from the current position.
  Relative(f64),
  /// Absolute position in seconds.
  Absolute(f64),
}

/// UI intents the session accepts while running.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
  TogglePause,
  Seek(SeekTarget),
  SetVolume(i64),
  Stop,
}

/// State changes the session reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerUpdate {
  State(PlaybackState),
  /// Current position in seconds. Last writer wins.
  Position(f64),
  /// Media duration in seconds, once known.
  Duration(f64),
  Volume(i64),
  EndOfFile,
  /// One structured error describing why the session degraded or died.
  SessionError(String),
}

// ---------------------------------------------------------------------------
// Playback state tracking
// ---------------------------------------------------------------------------

/// Pure playback-state bookkeeping, separated from the IO loop so the
/// transition rules are testable without a player process.
#[derive(Debug)]
struct PlaybackTracker {
  state: PlaybackState,
  paused: bool,
  position: Option<f64>,
  duration: Option<f64>,
}

impl PlaybackTracker {
  fn new() -> Self {
    Self { state: PlaybackState::Launching, paused: false, position: None, duration: None }
  }

  /// The initial `file-loaded` event moves Launching → Playing.
  fn on_file_loaded(&mut self) -> Option<PlaybackState> {
    if self.state == PlaybackState::Launching {
      self.state = PlaybackState::Playing;
      return Some(self.state);
    }
    None
  }

  /// A seek command was acknowledged; position events will land us back in
  /// Playing/Paused.
  fn begin_seek(&mut self) -> Option<PlaybackState> {
    if matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
      self.state = PlaybackState::Seeking;
      return Some(self.state);
    }
    None
  }

  /// Apply one observed property change, returning the updates to surface.
  /// Duplicate or out-of-order events are tolerated: positions overwrite
  /// (last writer wins) and a pause flag equal to the current state emits
  /// nothing.
  fn apply_property(&mut self, name: &str, data: &Value) -> Vec<PlayerUpdate> {
    let mut out = Vec::new();
    match name {
      "time-pos" => {
        if let Some(secs) = data.as_f64() {
          self.position = Some(secs);
          out.push(PlayerUpdate::Position(secs));
          if self.state == PlaybackState::Seeking {
            self.state = if self.paused { PlaybackState::Paused } else { PlaybackState::Playing };
            out.push(PlayerUpdate::State(self.state));
          }
        }
      }
      "duration" => {
        if let Some(secs) = data.as_f64() {
          self.duration = Some(secs);
          out.push(PlayerUpdate::Duration(secs));
        }
      }
      "pause" => {
        if let Some(paused) = data.as_bool() {
          self.paused = paused;
          // While seeking, only record the flag; the state resolves when
          // the post-seek position arrives.
          if matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            let next = if paused { PlaybackState::Paused } else { PlaybackState::Playing };
            if next != self.state {
              self.state = next;
              out.push(PlayerUpdate::State(next));
            }
          }
        }
      }
      "volume" => {
        if let Some(vol) = data.as_f64() {
          out.push(PlayerUpdate::Volume(vol.round() as i64));
        }
      }
      _ => {}
    }
    out
  }
}

// ---------------------------------------------------------------------------
// Launch configuration
// ---------------------------------------------------------------------------

/// Build the player command line for a target and mode. The IPC endpoint is
/// pre-declared so the session can connect as soon as the player is up.
fn build_command(player_bin: &str, target: &MediaTarget, mode: LaunchMode, socket: &Path) -> Command {
  let mut cmd = Command::new(player_bin);
  cmd.arg(format!("--input-ipc-server={}", socket.display()));

  match mode {
    LaunchMode::ExternalWindow => {
      cmd.stdin(Stdio::null());
      cmd.stdout(Stdio::null());
    }
    LaunchMode::TerminalOutput => {
      cmd.arg("--vo=tct");
      cmd.arg("--really-quiet");
      cmd.arg("--cache=yes");
      cmd.arg("--demuxer-readahead-secs=2");
      // The player owns the terminal while rendering into it.
      cmd.stdin(Stdio::inherit());
      cmd.stdout(Stdio::inherit());
    }
    LaunchMode::AudioOnly => {
      cmd.arg("--no-video");
      cmd.stdin(Stdio::null());
      cmd.stdout(Stdio::null());
    }
  }

  match (&target.format, mode) {
    (Some(format), _) => {
      cmd.arg(format!("--ytdl-format={}", format));
    }
    (None, LaunchMode::AudioOnly) => {
      cmd.arg("--ytdl-format=bestaudio/best");
    }
    (None, _) => {}
  }

  cmd.arg(&target.url);
  // If piped but never drained, a full pipe buffer blocks the player.
  cmd.stderr(Stdio::null());
  cmd
}

// ---------------------------------------------------------------------------
// Session actor
// ---------------------------------------------------------------------------

/// Handle to a running player session.
pub struct PlayerSession {
  cmd_tx: mpsc::UnboundedSender<PlayerCommand>,
  task: JoinHandle<()>,
}

impl PlayerSession {
  /// Spawn the player and its control loop. Updates flow into `updates`
  /// in emission order until the session ends.
  pub fn launch(
    supervisor: Supervisor,
    player_bin: String,
    target: MediaTarget,
    mode: LaunchMode,
    session_id: u64,
    updates: mpsc::Sender<PlayerUpdate>,
  ) -> Self {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
      run_session(supervisor, player_bin, target, mode, session_id, cmd_rx, updates).await;
    });
    Self { cmd_tx, task }
  }

  /// Queue a command for the session loop. Returns `false` if the session
  /// is already gone.
  pub fn send(&self, cmd: PlayerCommand) -> bool {
    self.cmd_tx.send(cmd).is_ok()
  }

  /// Whether the session loop has finished (process exited or errored).
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Stop playback and wait for full teardown: socket closed, process
  /// reaped. Guarantees no live player outlives this call.
  pub async fn stop(self) {
    let _ = self.cmd_tx.send(PlayerCommand::Stop);
    let mut task = self.task;
    let grace = Duration::from_millis(constants().terminate_grace_ms * 2);
    if tokio::time::timeout(grace, &mut task).await.is_err() {
      warn!("player session did not stop in time; aborting its loop");
      // Aborting drops the process handle, which kills the child.
      task.abort();
      let _ = task.await;
    }
  }
}

async fn run_session(
  supervisor: Supervisor,
  player_bin: String,
  target: MediaTarget,
  mode: LaunchMode,
  session_id: u64,
  mut cmd_rx: mpsc::UnboundedReceiver<PlayerCommand>,
  updates: mpsc::Sender<PlayerUpdate>,
) {
  let _ = updates.send(PlayerUpdate::State(PlaybackState::Launching)).await;

  let socket = ipc::socket_path(session_id);
  // Remove a stale socket left by a previous crash.
  let _ = std::fs::remove_file(&socket);

  let mut cmd = build_command(&player_bin, &target, mode, &socket);
  info!(url = %target.url, ?mode, socket = %socket.display(), "launching player");

  let mut handle = match supervisor.spawn(&player_bin, &mut cmd) {
    Ok(handle) => handle,
    Err(e) => {
      let _ = updates.send(PlayerUpdate::SessionError(e.user_message())).await;
      let _ = updates.send(PlayerUpdate::State(PlaybackState::Errored)).await;
      return;
    }
  };

  let (conn, mut events) = match IpcConnection::connect(&socket).await {
    Ok(pair) => pair,
    Err(e) => {
      let _ = handle.terminate().await;
      let _ = std::fs::remove_file(&socket);
      let _ = updates.send(PlayerUpdate::SessionError(e.to_string())).await;
      let _ = updates.send(PlayerUpdate::State(PlaybackState::Errored)).await;
      return;
    }
  };

  let end_state = drive_session(&conn, &mut handle, &mut cmd_rx, &mut events, &updates).await;

  // Teardown is unconditional: reap the process (a no-op if it already
  // exited) and drop the socket file.
  drop(conn);
  let _ = handle.terminate().await;
  let _ = std::fs::remove_file(&socket);
  let _ = updates.send(PlayerUpdate::State(end_state)).await;
  debug!(?end_state, "player session ended");
}

/// The session event loop. Returns the terminal state to report after
/// teardown completes.
async fn drive_session(
  conn: &IpcConnection,
  handle: &mut ProcessHandle,
  cmd_rx: &mut mpsc::UnboundedReceiver<PlayerCommand>,
  events: &mut mpsc::Receiver<IpcEvent>,
  updates: &mpsc::Sender<PlayerUpdate>,
) -> PlaybackState {
  for (observe_id, property) in [(1, "time-pos"), (2, "duration"), (3, "pause"), (4, "volume")] {
    if let Err(e) = conn.observe_property(observe_id, property).await {
      let _ = updates.send(PlayerUpdate::SessionError(e.to_string())).await;
      return PlaybackState::Errored;
    }
  }

  let mut tracker = PlaybackTracker::new();
  let load_deadline = Instant::now() + Duration::from_millis(constants().file_loaded_timeout_ms);

  loop {
    tokio::select! {
      _ = tokio::time::sleep_until(load_deadline), if tracker.state == PlaybackState::Launching => {
        let _ = updates.send(PlayerUpdate::SessionError("player never reported the file as loaded".to_string())).await;
        return PlaybackState::Errored;
      }

      maybe_cmd = cmd_rx.recv() => {
        let cmd = match maybe_cmd {
          // All senders gone — treat as a stop intent.
          None | Some(PlayerCommand::Stop) => {
            let _ = conn.command(json!(["quit"])).await;
            return PlaybackState::Stopped;
          }
          Some(cmd) => cmd,
        };
        match apply_command(conn, &mut tracker, cmd, updates).await {
          Ok(()) => {}
          Err(e) => {
            // An unacknowledged or failed channel is desynchronised: tear
            // down rather than guess whether the command applied.
            let _ = updates.send(PlayerUpdate::SessionError(e.to_string())).await;
            return PlaybackState::Errored;
          }
        }
      }

      maybe_event = events.recv() => {
        match maybe_event {
          Some(IpcEvent::FileLoaded) => {
            if let Some(state) = tracker.on_file_loaded() {
              let _ = updates.send(PlayerUpdate::State(state)).await;
            }
          }
          Some(IpcEvent::PropertyChange { name, data }) => {
            for update in tracker.apply_property(&name, &data) {
              let _ = updates.send(update).await;
            }
          }
          Some(IpcEvent::EndFile { reason }) => {
            debug!(?reason, position = ?tracker.position, duration = ?tracker.duration, "player reached end of file");
            let _ = updates.send(PlayerUpdate::EndOfFile).await;
            return PlaybackState::Stopped;
          }
          Some(IpcEvent::Shutdown) | Some(IpcEvent::Disconnected) | None => {
            // Player quit on its own (window closed, `q` pressed).
            return PlaybackState::Stopped;
          }
          Some(IpcEvent::Protocol(violation)) => {
            let _ = updates.send(PlayerUpdate::SessionError(CoreError::Protocol(violation).to_string())).await;
            return PlaybackState::Errored;
          }
        }
      }

      status = handle.wait() => {
        return match status {
          Ok(status) if status.success() => PlaybackState::Stopped,
          Ok(status) => {
            let crash = CoreError::Crash {
              program: handle.program().to_string(),
              status: describe_exit(status),
              diagnostic: "player process exited unexpectedly".to_string(),
            };
            let _ = updates.send(PlayerUpdate::SessionError(crash.to_string())).await;
            PlaybackState::Errored
          }
          Err(e) => {
            let _ = updates.send(PlayerUpdate::SessionError(format!("failed to wait on player: {}", e))).await;
            PlaybackState::Errored
          }
        };
      }
    }
  }
}

/// Translate one UI command into protocol traffic. `Err` means the channel
/// itself failed and the session must end; a player-side rejection is
/// surfaced but survivable.
async fn apply_command(
  conn: &IpcConnection,
  tracker: &mut PlaybackTracker,
  cmd: PlayerCommand,
  updates: &mpsc::Sender<PlayerUpdate>,
) -> Result<(), CoreError> {
  let result = match &cmd {
    PlayerCommand::TogglePause => {
      // State flips when the observed `pause` property confirms it.
      conn.command(json!(["cycle", "pause"])).await.map(|_| ())
    }
    PlayerCommand::Seek(SeekTarget::Relative(secs)) => {
      conn.command(json!(["seek", secs, "relative"])).await.map(|_| ())
    }
    PlayerCommand::Seek(SeekTarget::Absolute(secs)) => {
      conn.command(json!(["seek", secs, "absolute"])).await.map(|_| ())
    }
    PlayerCommand::SetVolume(vol) => conn.command(json!(["set_property", "volume", vol])).await.map(|_| ()),
    PlayerCommand::Stop => unreachable!("Stop is handled by the session loop"),
  };

  match result {
    Ok(()) => {
      if let PlayerCommand::Seek(_) = cmd
        && let Some(state) = tracker.begin_seek()
      {
        let _ = updates.send(PlayerUpdate::State(state)).await;
      }
      Ok(())
    }
    // The player understood us and said no (e.g. seeking an unseekable
    // stream). The channel is fine.
    Err(CoreError::Rejected(msg)) => {
      warn!(cmd = ?cmd, reason = %msg, "player rejected command");
      let _ = updates.send(PlayerUpdate::SessionError(CoreError::Rejected(msg).to_string())).await;
      Ok(())
    }
    Err(e) => Err(e),
  }
}
