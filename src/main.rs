//! Chunkloader - parallel chunked file downloader
//!
//! Downloads each target in byte-range chunks, merges them into the
//! destination directory, and pauses cleanly on Ctrl-C so the next run picks
//! up the partial chunks left on disk.

use anyhow::{anyhow, bail, Context, Result};
use chunkloader::backend::{BackendActor, BackendCommand, BackendEvent};
use chunkloader::downloader::{Backends, ChunkStore, DownloadEngine, FileTarget, ProgressSnapshot};
use chunkloader::utils::{platform, AppSettings};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::Level;

#[derive(Parser)]
#[command(name = "chunkloader", version, about = "Parallel chunked downloader")]
struct Args {
    /// Targets as NAME=URL[@SIZE] or a bare URL
    #[arg(required = true)]
    targets: Vec<String>,

    /// Destination directory
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Directory for chunk temp files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simultaneous chunk fetches per file
    #[arg(short, long)]
    workers: Option<usize>,

    /// More logging (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match (args.quiet, args.verbose) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let settings_path = args.config.clone().unwrap_or_else(platform::settings_path);
    let mut settings = AppSettings::load_or_default(&settings_path)?;
    if let Some(dest) = args.dest {
        settings.download_location = dest;
    }
    if let Some(temp_dir) = args.temp_dir {
        settings.temp_dir = temp_dir;
    }
    if let Some(workers) = args.workers {
        settings.max_concurrent_chunks = workers;
    }
    let settings = settings.sanitized();

    let files = args
        .targets
        .iter()
        .map(|t| parse_target(t))
        .collect::<Result<Vec<_>>>()?;

    let config = settings.to_download_config();
    let backends = Backends::http(&config).context("Failed to build HTTP client")?;
    let engine = DownloadEngine::with_backends(config, ChunkStore::new(&settings.temp_dir), backends);

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let actor = tokio::spawn(BackendActor::new(engine, cmd_rx, event_tx).run());

    cmd_tx
        .send(BackendCommand::Start {
            files,
            destination: settings.download_location.clone(),
        })
        .await?;

    let mut last_percent = -1i64;
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nPausing; run the same command again to resume.");
                cmd_tx.send(BackendCommand::Pause).await?;
                break Ok(());
            }
            event = event_rx.recv() => match event {
                Some(BackendEvent::Progress(snapshot)) => {
                    let percent = snapshot.percentage().floor() as i64;
                    if percent != last_percent {
                        last_percent = percent;
                        print_progress(&snapshot);
                    }
                }
                Some(BackendEvent::Completed) => {
                    println!("Download completed: {}", settings.download_location.display());
                    break Ok(());
                }
                Some(BackendEvent::Failed { message, can_resume }) => {
                    if can_resume {
                        break Err(anyhow!("{} (run again to resume)", message));
                    }
                    break Err(anyhow!(message));
                }
                Some(BackendEvent::Error { message, .. }) => break Err(anyhow!(message)),
                None => bail!("Backend stopped unexpectedly"),
            }
        }
    };

    let _ = cmd_tx.send(BackendCommand::Shutdown).await;
    let _ = actor.await;
    outcome
}

fn print_progress(snapshot: &ProgressSnapshot) {
    let eta = snapshot
        .eta
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "--".to_string());
    println!(
        "Progress: {:.1}% ({} / {} bytes), Speed: {:.2} MB/s, ETA: {}",
        snapshot.percentage(),
        snapshot.downloaded_bytes,
        snapshot.total_bytes,
        snapshot.speed_bytes_per_sec / 1024.0 / 1024.0,
        eta
    );
}

/// `NAME=URL[@SIZE]`, or a bare URL named after its last path segment
fn parse_target(spec: &str) -> Result<FileTarget> {
    let (name, rest) = match spec.split_once('=') {
        Some((name, rest)) if rest.starts_with("http://") || rest.starts_with("https://") => {
            (Some(name.to_string()), rest)
        }
        _ => (None, spec),
    };

    let (url, size) = match rest.rsplit_once('@') {
        Some((url, size)) if !size.is_empty() && size.bytes().all(|b| b.is_ascii_digit()) => {
            (url, Some(size.parse::<u64>()?))
        }
        _ => (rest, None),
    };

    let name = match name {
        Some(name) if !name.is_empty() => name,
        Some(_) => bail!("Empty file name in {}", spec),
        None => {
            let parsed = Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .unwrap_or("download")
                .to_string()
        }
    };

    let target = FileTarget::new(url, name);
    Ok(match size {
        Some(size) => target.with_size(size),
        None => target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_target_with_size() {
        let target = parse_target("data.bin=https://example.com/a?x=1@1024").unwrap();
        assert_eq!(target.file_name, "data.bin");
        assert_eq!(target.url, "https://example.com/a?x=1");
        assert_eq!(target.total_size, Some(1024));
    }

    #[test]
    fn test_parse_bare_url() {
        let target = parse_target("https://example.com/files/archive.zip?token=abc").unwrap();
        assert_eq!(target.file_name, "archive.zip");
        assert_eq!(target.total_size, None);

        let target = parse_target("https://example.com/").unwrap();
        assert_eq!(target.file_name, "download");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_target("not a url").is_err());
        assert!(parse_target("=https://example.com/x").is_err());
    }
}
