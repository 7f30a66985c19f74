mod config;
mod constants;
mod error;
mod extractor;
mod facade;
mod ipc;
mod job;
mod player;
mod progress;
mod scheduler;
mod storage;
mod supervisor;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use directories::ProjectDirs;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use config::Config;
use extractor::MediaTarget;
use facade::{Intent, Orchestrator, Update};
use job::JobState;
use player::{PlaybackState, PlayerCommand, PlayerUpdate, SeekTarget};
use scheduler::{DownloadCommand, DownloadUpdate};

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about = "Search, stream and download online media from the terminal", long_about = None)]
struct Args {
  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Search for media (free text), or list the entries behind a URL
  Search {
    query: Vec<String>,
    /// Maximum number of results
    #[arg(short, long)]
    limit: Option<usize>,
    /// Emit one JSON object per result instead of a formatted listing
    #[arg(long)]
    json: bool,
  },
  /// List the downloadable formats of a URL
  Formats { url: String },
  /// Play a URL
  Play {
    url: String,
    /// Playback mode
    #[arg(short, long, default_value = "external")]
    mode: PlayMode,
    /// Format selector passed to the player
    #[arg(short, long)]
    format: Option<String>,
  },
  /// Download one or more URLs
  Download {
    urls: Vec<String>,
    /// Format selector passed to the extractor
    #[arg(short, long)]
    format: Option<String>,
    /// Destination directory (defaults to the configured download dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,
    /// Fetch audio only
    #[arg(short, long)]
    audio: bool,
  },
  /// Remove orphaned partial downloads from the download directory
  Cleanup {
    /// Directory to scan (defaults to the configured download dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,
  },
  /// Show or change persistent preferences
  Config {
    /// Set the download directory
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Set the maximum number of concurrent downloads
    #[arg(long)]
    concurrency: Option<usize>,
  },
  /// Generate shell completions
  Completions { shell: Shell },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PlayMode {
  /// Player opens its own window
  External,
  /// Render video into the terminal
  Terminal,
  /// Audio only
  Audio,
}

// --- Logging ---

/// Log to a file under the platform data dir; the terminal stays clean for
/// playback and progress output. Returns the guard keeping the writer alive.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let proj_dirs = ProjectDirs::from("", "", "tapedeck")?;
  let log_dir = proj_dirs.data_dir().join("logs");
  std::fs::create_dir_all(&log_dir).ok()?;

  let appender = tracing_appender::rolling::daily(log_dir, "tapedeck.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tapedeck=info"));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
  Some(guard)
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  let _log_guard = init_logging();
  let config = Config::load();
  info!(command = ?args.command, "starting");

  match args.command {
    Cmd::Search { query, limit, json } => run_search(&config, query, limit, json).await,
    Cmd::Formats { url } => run_formats(&config, &url).await,
    Cmd::Play { url, mode, format } => run_play(config, url, mode, format).await,
    Cmd::Download { urls, format, dir, audio } => run_download(config, urls, format, dir, audio).await,
    Cmd::Cleanup { dir } => run_cleanup(config, dir).await,
    Cmd::Config { download_dir, concurrency } => run_config(config, download_dir, concurrency),
    Cmd::Completions { shell } => {
      clap_complete::generate(shell, &mut Args::command(), "tapedeck", &mut std::io::stdout());
      Ok(())
    }
  }
}

// --- Subcommands ---

async fn run_search(config: &Config, query: Vec<String>, limit: Option<usize>, json: bool) -> Result<()> {
  let query = query.join(" ");
  if query.trim().is_empty() {
    anyhow::bail!("enter a search term or URL");
  }
  let limit = limit.unwrap_or(constants::constants().search_limit);
  let mut entries = extractor::search(config.extractor_bin(), &query, limit).await?;
  if entries.is_empty() {
    println!("No results.");
    return Ok(());
  }

  // Flat listings come back fast but thin; fill in uploader/duration with
  // a bounded fan-out before printing.
  let thin: Vec<(String, String)> = entries
    .iter()
    .filter(|entry| entry.uploader.is_none() && entry.duration.is_none())
    .map(|entry| (entry.id.clone(), entry.url.clone()))
    .collect();
  if !thin.is_empty() {
    let (meta_tx, mut meta_rx) = tokio::sync::mpsc::channel(16);
    let enrich = extractor::enrich_entries(config.extractor_bin(), thin, meta_tx);
    let collect = async {
      let mut metas = Vec::new();
      while let Some(meta) = meta_rx.recv().await {
        metas.push(meta);
      }
      metas
    };
    let (_, metas) = tokio::join!(enrich, collect);
    for meta in metas {
      if let Some(entry) = entries.iter_mut().find(|entry| entry.id == meta.id) {
        entry.uploader = meta.uploader;
        entry.duration = meta.duration;
      }
    }
  }

  if json {
    // Machine-readable listing for other front ends: one object per line.
    for entry in &entries {
      println!("{}", serde_json::to_string(entry)?);
    }
    return Ok(());
  }

  for (idx, entry) in entries.iter().enumerate() {
    let duration = entry.duration.as_deref().unwrap_or("?");
    let uploader = entry.uploader.as_deref().unwrap_or("unknown");
    println!("{:2}. {} [{}] by {}", idx + 1, entry.title, duration, uploader);
    println!("    {}", entry.url);
  }
  Ok(())
}

fn run_config(mut config: Config, download_dir: Option<PathBuf>, concurrency: Option<usize>) -> Result<()> {
  let changed = download_dir.is_some() || concurrency.is_some();
  if let Some(dir) = download_dir {
    config.download_dir = Some(dir);
  }
  if let Some(n) = concurrency {
    config.max_concurrent_downloads = Some(n.max(1));
  }
  if changed {
    config.save();
  }

  println!("download dir:         {}", config.download_dir().display());
  println!("concurrent downloads: {}", config.max_concurrent_downloads());
  println!("player:               {}", config.player_bin());
  println!("extractor:            {}", config.extractor_bin());
  Ok(())
}

async fn run_formats(config: &Config, url: &str) -> Result<()> {
  let formats = extractor::formats(config.extractor_bin(), url).await?;
  if formats.is_empty() {
    println!("No formats reported.");
    return Ok(());
  }

  println!("{:<10} {:<6} {:<12} {:<14} {}", "ID", "EXT", "RESOLUTION", "NOTE", "SIZE");
  for format in &formats {
    let size = format.filesize.map(fmt_size).unwrap_or_else(|| "?".to_string());
    println!("{:<10} {:<6} {:<12} {:<14} {}", format.format_id, format.ext, format.resolution, format.note, size);
  }
  Ok(())
}

async fn run_play(config: Config, url: String, mode: PlayMode, format: Option<String>) -> Result<()> {
  let mut target = match mode {
    PlayMode::Audio => MediaTarget::audio(url),
    _ => MediaTarget::video(url),
  };
  if let Some(format) = format {
    target = target.with_format(format);
  }
  let intent = match mode {
    PlayMode::External => Intent::PlayExternal(target),
    PlayMode::Terminal => Intent::PlayInTerminal(target),
    PlayMode::Audio => Intent::PlayAudioOnly(target),
  };

  let (orchestrator, mut updates) = Orchestrator::spawn(config);
  orchestrator.send(intent).await;

  // In terminal mode the player owns the tty, so no command prompt.
  let interactive = mode != PlayMode::Terminal;
  if interactive {
    println!("Controls: p pause/resume | s <secs> seek | g <secs> go to | v <vol> volume | q quit");
  }
  let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
  let mut duration: Option<f64> = None;

  loop {
    tokio::select! {
      update = updates.recv() => {
        match update {
          Some(Update::Player(update)) => {
            if !report_player_update(update, &mut duration) {
              break;
            }
          }
          Some(_) => {}
          None => break,
        }
      }
      line = stdin_lines.next_line(), if interactive => {
        let Ok(Some(line)) = line else { continue };
        match parse_control_line(&line) {
          Some(ControlLine::Quit) => {
            orchestrator.send(Intent::Playback(PlayerCommand::Stop)).await;
          }
          Some(ControlLine::Command(cmd)) => {
            orchestrator.send(Intent::Playback(cmd)).await;
          }
          None => println!("Unrecognised command: {}", line.trim()),
        }
      }
      _ = tokio::signal::ctrl_c() => {
        println!();
        break;
      }
    }
  }

  orchestrator.shutdown().await;
  Ok(())
}

/// Print one player update. Returns `false` once the session is over.
fn report_player_update(update: PlayerUpdate, duration: &mut Option<f64>) -> bool {
  match update {
    PlayerUpdate::State(PlaybackState::Launching) => println!("Launching player..."),
    PlayerUpdate::State(PlaybackState::Playing) => println!("Playing."),
    PlayerUpdate::State(PlaybackState::Paused) => println!("Paused."),
    PlayerUpdate::State(PlaybackState::Stopped) => {
      println!("Stopped.");
      return false;
    }
    PlayerUpdate::State(PlaybackState::Errored) => {
      return false;
    }
    PlayerUpdate::State(_) => {}
    PlayerUpdate::Position(position) => {
      let total = duration.map(fmt_clock).unwrap_or_else(|| "?".to_string());
      print!("\r  {} / {} ", fmt_clock(position), total);
      let _ = std::io::stdout().flush();
    }
    PlayerUpdate::Duration(secs) => *duration = Some(secs),
    PlayerUpdate::Volume(vol) => println!("Volume: {}", vol),
    PlayerUpdate::EndOfFile => println!("\nEnd of file."),
    PlayerUpdate::SessionError(message) => eprintln!("\nPlayer error: {}", message),
  }
  true
}

enum ControlLine {
  Command(PlayerCommand),
  Quit,
}

fn parse_control_line(line: &str) -> Option<ControlLine> {
  let mut parts = line.trim().split_whitespace();
  let head = parts.next()?;
  let arg = parts.next();
  let cmd = match (head, arg) {
    ("p", None) => PlayerCommand::TogglePause,
    ("q", None) => return Some(ControlLine::Quit),
    ("s", Some(secs)) => PlayerCommand::Seek(SeekTarget::Relative(secs.parse().ok()?)),
    ("g", Some(secs)) => PlayerCommand::Seek(SeekTarget::Absolute(secs.parse().ok()?)),
    ("v", Some(vol)) => PlayerCommand::SetVolume(vol.parse().ok()?),
    _ => return None,
  };
  Some(ControlLine::Command(cmd))
}

async fn run_download(
  config: Config,
  urls: Vec<String>,
  format: Option<String>,
  dir: Option<PathBuf>,
  audio: bool,
) -> Result<()> {
  if urls.is_empty() {
    anyhow::bail!("nothing to download");
  }
  let dest_dir = dir.unwrap_or_else(|| config.download_dir());
  let extractor_bin = config.extractor_bin().to_string();
  let (orchestrator, mut updates) = Orchestrator::spawn(config);

  let mut expected = 0usize;
  for url in &urls {
    let mut target = if audio { MediaTarget::audio(url) } else { MediaTarget::video(url) };
    if let Some(format) = &format {
      target = target.with_format(format.clone());
    }
    match extractor::resolve_filename(&extractor_bin, &target).await {
      Ok(filename) => {
        println!("Queued: {}", filename);
        orchestrator.send(Intent::Download { target, dest: dest_dir.join(filename) }).await;
        expected += 1;
      }
      Err(e) => eprintln!("Skipping {}: {:#}", url, e),
    }
  }
  if expected == 0 {
    orchestrator.shutdown().await;
    anyhow::bail!("no downloads could be queued");
  }
  println!("Controls: p pause all | r resume all | c cancel all | s status | Ctrl-C stop");

  let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
  let mut jobs: Vec<job::JobId> = Vec::new();
  let mut finished = 0usize;
  while finished < expected {
    tokio::select! {
      update = updates.recv() => {
        let Some(update) = update else { break };
        if let Update::Download { id, .. } = &update
          && !jobs.contains(id)
        {
          jobs.push(id.clone());
        }
        match update {
          Update::Download { update: DownloadUpdate::Progress(progress), .. } => {
            let speed = progress.speed_bps.map(fmt_speed).unwrap_or_else(|| "?".to_string());
            let eta = progress.eta_secs.map(|secs| fmt_clock(secs as f64)).unwrap_or_else(|| "?".to_string());
            let bytes = match (progress.downloaded_bytes, progress.total_bytes) {
              (Some(done), Some(total)) => format!("{} / {}", fmt_size(done), fmt_size(total)),
              (Some(done), None) => fmt_size(done),
              _ => "?".to_string(),
            };
            print!("\r  {:5.1}% ({}) at {} ETA {}   ", progress.percent, bytes, speed, eta);
            let _ = std::io::stdout().flush();
          }
          Update::Download { update: DownloadUpdate::Completed { path }, .. } => {
            println!("\nDone: {}", path.display());
            finished += 1;
          }
          Update::Download { update: DownloadUpdate::Failed { error, diagnostic }, .. } => {
            eprintln!("\nFailed: {}", error);
            if let Some(line) = diagnostic {
              eprintln!("  last output: {}", line);
            }
            finished += 1;
          }
          Update::Download { id, update: DownloadUpdate::State(state) } => {
            if state == JobState::Cancelled {
              finished += 1;
            }
            info!(id = %id, ?state, "download state change");
          }
          Update::DownloadRefused { reason } => {
            eprintln!("Refused: {}", reason);
            finished += 1;
          }
          _ => {}
        }
      }
      line = stdin_lines.next_line() => {
        let Ok(Some(line)) = line else { continue };
        let cmd = match line.trim() {
          "p" => Some(DownloadCommand::Pause),
          "r" => Some(DownloadCommand::Resume),
          "c" => Some(DownloadCommand::Cancel),
          "s" => {
            let snapshot = orchestrator.snapshot().await;
            println!(
              "\n  active {} | queued {} | paused {} | done {} | failed {} | cancelled {} | {} total",
              snapshot.active, snapshot.queued, snapshot.paused, snapshot.completed, snapshot.failed,
              snapshot.cancelled, fmt_speed(snapshot.total_speed_bps),
            );
            let ids: Vec<&str> = jobs.iter().map(|id| &id.as_str()[..8]).collect();
            println!("  jobs: {}", ids.join(", "));
            None
          }
          _ => None,
        };
        if let Some(cmd) = cmd {
          for id in &jobs {
            orchestrator.send(Intent::DownloadControl { id: id.clone(), cmd }).await;
          }
        }
      }
      _ = tokio::signal::ctrl_c() => {
        println!("\nInterrupted. Pausing downloads; partial files are kept for resume.");
        break;
      }
    }
  }

  orchestrator.shutdown().await;
  Ok(())
}

async fn run_cleanup(config: Config, dir: Option<PathBuf>) -> Result<()> {
  let dir = dir.unwrap_or_else(|| config.download_dir());
  let (orchestrator, mut updates) = Orchestrator::spawn(config);
  orchestrator.send(Intent::CleanupGarbage { dir: dir.clone() }).await;

  loop {
    match updates.recv().await.context("update stream ended unexpectedly")? {
      Update::GarbageCleaned { removed } => {
        println!("Removed {} orphaned partial file(s) from {}", removed, dir.display());
        break;
      }
      _ => {}
    }
  }

  orchestrator.shutdown().await;
  Ok(())
}

// --- Formatting helpers ---

fn fmt_clock(secs: f64) -> String {
  let secs = secs.max(0.0) as u64;
  let h = secs / 3600;
  let m = (secs % 3600) / 60;
  let s = secs % 60;
  if h > 0 { format!("{}:{:02}:{:02}", h, m, s) } else { format!("{}:{:02}", m, s) }
}

fn fmt_size(bytes: u64) -> String {
  let mb = bytes as f64 / 1024.0 / 1024.0;
  if mb >= 1024.0 { format!("{:.1} GiB", mb / 1024.0) } else { format!("{:.1} MiB", mb) }
}

fn fmt_speed(bps: f64) -> String {
  format!("{}/s", fmt_size(bps as u64))
}
