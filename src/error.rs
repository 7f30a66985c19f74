use std::path::PathBuf;
use thiserror::Error;

/// Error classes the orchestration core reports to the UI.
///
/// Every variant maps to a distinct recovery story: spawn failures are
/// surfaced and not retried, IPC failures tear the player session down,
/// stalls and crashes mark a single job Failed without touching siblings.
#[derive(Debug, Error)]
pub enum CoreError {
  /// The external executable is missing or not runnable.
  #[error("failed to launch {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The player's IPC socket never became connectable.
  #[error("player IPC socket {} not ready after {waited_ms}ms", path.display())]
  ConnectTimeout { path: PathBuf, waited_ms: u64 },

  /// Malformed or unexpected data on the IPC channel. Always fatal to the
  /// session — an ambiguous channel is worse than no channel.
  #[error("player protocol violation: {0}")]
  Protocol(String),

  /// The player answered a well-formed command with a non-success status.
  /// The session survives; the command simply did not apply.
  #[error("player rejected command: {0}")]
  Rejected(String),

  /// A download produced no progress within the stall window.
  #[error("no download progress for {stalled_secs}s")]
  Stall { stalled_secs: u64 },

  /// A child process exited non-zero or on a signal.
  #[error("{program} exited abnormally ({status}): {diagnostic}")]
  Crash {
    program: String,
    status: String,
    diagnostic: String,
  },
}

impl CoreError {
  /// Build a `Spawn` error, attaching an install hint when the binary is
  /// simply absent (the by far most common failure for new users).
  pub fn spawn(program: &str, source: std::io::Error) -> Self {
    Self::Spawn { program: program.to_string(), source }
  }

  /// Human-oriented one-liner including an install hint for missing tools.
  pub fn user_message(&self) -> String {
    match self {
      Self::Spawn { program, source } if source.kind() == std::io::ErrorKind::NotFound => {
        format!("{} not found. Install it with: brew install {} (macOS) or your package manager (Linux)", program, program)
      }
      other => other.to_string(),
    }
  }
}
