//! Newline-delimited JSON IPC to a running player process.
//!
//! The player multiplexes command responses and asynchronous event
//! notifications on one socket. Responses carry the `request_id` we sent;
//! everything else is an event. The reader task routes responses to their
//! waiting callers and forwards events to the session.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::constants::constants;
use crate::error::CoreError;

/// Decoded asynchronous traffic from the player.
#[derive(Debug)]
pub enum IpcEvent {
  PropertyChange { name: String, data: Value },
  FileLoaded,
  EndFile { reason: Option<String> },
  Shutdown,
  /// The socket reached EOF — the player hung up.
  Disconnected,
  /// Malformed or unexpected data on the channel. Fatal to the session.
  Protocol(String),
}

/// One parsed line of socket traffic.
enum ParsedLine {
  Event(IpcEvent),
  Response { request_id: u64, error: String, data: Value },
  /// Well-formed traffic we don't care about (other event kinds).
  Ignored,
}

/// Classify one line. `Err` means a protocol violation, which tears the
/// session down — an ambiguous channel must not be limped along.
fn parse_line(line: &str) -> Result<ParsedLine, String> {
  let val: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON from player: {} ({})", e, line.trim()))?;

  if let Some(event) = val.get("event").and_then(|v| v.as_str()) {
    let parsed = match event {
      "property-change" => {
        let Some(name) = val.get("name").and_then(|v| v.as_str()) else {
          return Err(format!("property-change event without a name: {}", line.trim()));
        };
        ParsedLine::Event(IpcEvent::PropertyChange {
          name: name.to_string(),
          data: val.get("data").cloned().unwrap_or(Value::Null),
        })
      }
      "file-loaded" => ParsedLine::Event(IpcEvent::FileLoaded),
      "end-file" => ParsedLine::Event(IpcEvent::EndFile {
        reason: val.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string()),
      }),
      "shutdown" => ParsedLine::Event(IpcEvent::Shutdown),
      // The player emits many event kinds we don't consume; conformant
      // traffic, just not ours.
      _ => ParsedLine::Ignored,
    };
    return Ok(parsed);
  }

  if let Some(request_id) = val.get("request_id").and_then(|v| v.as_u64()) {
    let Some(error) = val.get("error").and_then(|v| v.as_str()) else {
      return Err(format!("response without an error field: {}", line.trim()));
    };
    return Ok(ParsedLine::Response {
      request_id,
      error: error.to_string(),
      data: val.get("data").cloned().unwrap_or(Value::Null),
    });
  }

  Err(format!("unexpected message from player: {}", line.trim()))
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<(String, Value)>>>>;

/// A live command channel to the player.
///
/// Dropping the connection stops the reader task; the socket closes with it.
pub struct IpcConnection {
  writer: tokio::sync::Mutex<OwnedWriteHalf>,
  pending: Pending,
  next_id: AtomicU64,
  reader: JoinHandle<()>,
}

impl IpcConnection {
  /// Connect to the player's socket, retrying until it appears or the
  /// bounded window expires. The player creates the socket shortly after
  /// launch; before that, connects fail with ENOENT/ECONNREFUSED.
  pub async fn connect(path: &Path) -> Result<(Self, mpsc::Receiver<IpcEvent>), CoreError> {
    let c = constants();
    let deadline = Instant::now() + Duration::from_millis(c.ipc_connect_timeout_ms);
    let stream = loop {
      match UnixStream::connect(path).await {
        Ok(stream) => break stream,
        Err(e) => {
          if Instant::now() >= deadline {
            info!(path = %path.display(), err = %e, "player IPC socket never became ready");
            return Err(CoreError::ConnectTimeout { path: path.to_path_buf(), waited_ms: c.ipc_connect_timeout_ms });
          }
          tokio::time::sleep(Duration::from_millis(c.ipc_connect_retry_ms)).await;
        }
      }
    };
    debug!(path = %path.display(), "connected to player IPC socket");

    let (read_half, write_half) = stream.into_split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (event_tx, event_rx) = mpsc::channel::<IpcEvent>(64);

    let reader_pending = pending.clone();
    let reader = tokio::spawn(async move {
      let mut lines = BufReader::new(read_half).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => match parse_line(&line) {
            Ok(ParsedLine::Event(event)) => {
              if event_tx.send(event).await.is_err() {
                break;
              }
            }
            Ok(ParsedLine::Response { request_id, error, data }) => {
              let waiter = reader_pending.lock().expect("ipc pending map poisoned").remove(&request_id);
              if let Some(tx) = waiter {
                let _ = tx.send((error, data));
              }
            }
            Ok(ParsedLine::Ignored) => {}
            Err(violation) => {
              let _ = event_tx.send(IpcEvent::Protocol(violation)).await;
              break;
            }
          },
          Ok(None) => {
            let _ = event_tx.send(IpcEvent::Disconnected).await;
            break;
          }
          Err(e) => {
            let _ = event_tx.send(IpcEvent::Protocol(format!("socket read failed: {}", e))).await;
            break;
          }
        }
      }
    });

    let conn =
      Self { writer: tokio::sync::Mutex::new(write_half), pending, next_id: AtomicU64::new(1), reader };
    Ok((conn, event_rx))
  }

  /// Send one command and await its acknowledgement.
  ///
  /// A missing acknowledgement within the bounded window means the channel
  /// is desynchronised — callers tear the session down rather than guess
  /// whether the command applied.
  pub async fn command(&self, args: Value) -> Result<Value, CoreError> {
    let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    self.pending.lock().expect("ipc pending map poisoned").insert(request_id, tx);

    let line = format!("{}\n", json!({ "command": args, "request_id": request_id }));
    {
      let mut writer = self.writer.lock().await;
      if let Err(e) = writer.write_all(line.as_bytes()).await {
        self.pending.lock().expect("ipc pending map poisoned").remove(&request_id);
        return Err(CoreError::Protocol(format!("socket write failed: {}", e)));
      }
    }

    let ack = tokio::time::timeout(Duration::from_millis(constants().ipc_command_timeout_ms), rx).await;
    match ack {
      Err(_) => {
        self.pending.lock().expect("ipc pending map poisoned").remove(&request_id);
        Err(CoreError::Protocol(format!("command {} not acknowledged in time", args)))
      }
      Ok(Err(_)) => Err(CoreError::Protocol("connection closed while awaiting acknowledgement".to_string())),
      Ok(Ok((error, data))) => {
        if error == "success" {
          Ok(data)
        } else {
          Err(CoreError::Rejected(error))
        }
      }
    }
  }

  /// Subscribe to change notifications for a property.
  pub async fn observe_property(&self, observe_id: u64, name: &str) -> Result<(), CoreError> {
    self.command(json!(["observe_property", observe_id, name])).await.map(|_| ())
  }
}

impl Drop for IpcConnection {
  fn drop(&mut self) {
    self.reader.abort();
  }
}

/// Socket path for a new player session. Includes our PID and a session
/// counter so concurrent instances and successive sessions never collide.
pub fn socket_path(session: u64) -> PathBuf {
  std::env::temp_dir().join(format!("{}-{}-{}.sock", constants().socket_prefix, std::process::id(), session))
}
