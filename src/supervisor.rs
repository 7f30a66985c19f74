//! Child-process supervision.
//!
//! Every external process (player, extractor) is spawned through the
//! [`Supervisor`] so one process-wide registry knows every live PID.
//! Teardown walks the registry and reaps stragglers, so no orphaned player
//! or extractor survives the application.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::constants::constants;
use crate::error::CoreError;

type Registry = Arc<Mutex<HashMap<u32, String>>>;

/// Spawns and tracks child processes. Cheap to clone; all clones share the
/// same registry.
#[derive(Clone, Default)]
pub struct Supervisor {
  registry: Registry,
}

impl Supervisor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Spawn `cmd`, registering the child in the live-process registry.
  ///
  /// `program` is the human-readable name used in errors and logs; the
  /// caller configures args and stdio on `cmd` before handing it over.
  pub fn spawn(&self, program: &str, cmd: &mut Command) -> Result<ProcessHandle, CoreError> {
    // Backstop: if a handle is dropped without an explicit wait/terminate,
    // the OS process goes with it.
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| CoreError::spawn(program, e))?;
    let pid = child.id();
    if let Some(pid) = pid {
      self.registry.lock().expect("supervisor registry poisoned").insert(pid, program.to_string());
      debug!(program, pid, "spawned child process");
    }

    Ok(ProcessHandle { program: program.to_string(), pid, child, registry: self.registry.clone() })
  }

  /// Number of currently live supervised processes.
  pub fn live_count(&self) -> usize {
    self.registry.lock().expect("supervisor registry poisoned").len()
  }

  /// Reap every process still in the registry: graceful signal first, then
  /// a force-kill for whatever is still alive after the grace window.
  pub async fn shutdown(&self) {
    let live: Vec<(u32, String)> = {
      let reg = self.registry.lock().expect("supervisor registry poisoned");
      reg.iter().map(|(pid, name)| (*pid, name.clone())).collect()
    };
    if live.is_empty() {
      return;
    }

    for (pid, program) in &live {
      debug!(program, pid, "shutdown: sending SIGTERM");
      unsafe { libc::kill(*pid as i32, libc::SIGTERM) };
    }

    tokio::time::sleep(Duration::from_millis(constants().terminate_grace_ms)).await;

    let remaining: Vec<(u32, String)> = {
      let reg = self.registry.lock().expect("supervisor registry poisoned");
      reg.iter().map(|(pid, name)| (*pid, name.clone())).collect()
    };
    for (pid, program) in remaining {
      warn!(program, pid, "shutdown: still alive after grace period, sending SIGKILL");
      unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    }
  }
}

/// One supervised child process.
///
/// Owns the OS handle; dropping it kills the child (`kill_on_drop`) and
/// removes it from the registry.
pub struct ProcessHandle {
  program: String,
  pid: Option<u32>,
  child: Child,
  registry: Registry,
}

impl ProcessHandle {
  pub fn pid(&self) -> Option<u32> {
    self.pid
  }

  pub fn program(&self) -> &str {
    &self.program
  }

  /// Take the piped stdout for line-oriented reading. Returns `None` if
  /// stdout was not piped or was already taken.
  pub fn take_stdout(&mut self) -> Option<ChildStdout> {
    self.child.stdout.take()
  }

  pub fn take_stderr(&mut self) -> Option<ChildStderr> {
    self.child.stderr.take()
  }

  /// Wait for the child to exit. Cancellable: dropping the future leaves
  /// the child running and the handle valid.
  pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
    let status = self.child.wait().await;
    self.deregister();
    status
  }

  /// Send a raw signal without waiting.
  pub fn signal(&self, sig: i32) {
    if let Some(pid) = self.pid {
      unsafe { libc::kill(pid as i32, sig) };
    }
  }

  /// Graceful-then-forceful shutdown: SIGTERM, wait out the grace window,
  /// SIGKILL on expiry. Always reaps the child.
  pub async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
    self.signal(libc::SIGTERM);
    let grace = Duration::from_millis(constants().terminate_grace_ms);
    let status = match tokio::time::timeout(grace, self.child.wait()).await {
      Ok(status) => status,
      Err(_) => {
        warn!(program = %self.program, pid = ?self.pid, "graceful terminate timed out, killing");
        self.child.start_kill()?;
        self.child.wait().await
      }
    };
    self.deregister();
    status
  }

  fn deregister(&self) {
    if let Some(pid) = self.pid {
      self.registry.lock().expect("supervisor registry poisoned").remove(&pid);
    }
  }
}

impl Drop for ProcessHandle {
  fn drop(&mut self) {
    self.deregister();
  }
}

/// Describe how a process ended: exit code or signal kind.
pub fn describe_exit(status: ExitStatus) -> String {
  if let Some(code) = status.code() {
    format!("exit code {}", code)
  } else if let Some(sig) = status.signal() {
    format!("signal {}", sig)
  } else {
    "unknown exit".to_string()
  }
}
