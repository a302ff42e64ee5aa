//! Chunked download orchestration
//!
//! `DownloadEngine` owns the session and every `FileChunkSet`. Files are
//! processed one at a time; within a file all pending chunks are fetched
//! concurrently up to `max_concurrent_chunks`. Fetch futures only report
//! outcomes, and every chunk or session mutation happens while holding the
//! session lock.

use crate::downloader::fetcher::{ChunkFetcher, ChunkRequest, HttpChunkFetcher};
use crate::downloader::merger::{destination_path, merge_file, DEFAULT_COPY_BUFFER};
use crate::downloader::progress::{FileProgress, ProgressSnapshot, SessionState, SpeedSampler};
use crate::downloader::retry::{RetryConfig, RetryPolicy, RetryReason, RetryState};
use crate::downloader::segment::{
    chunk_id, plan_chunks, ChunkSpec, ChunkState, ChunkTiers, FileChunkSet, FileTarget,
};
use crate::downloader::size::{resolve_all, SizeProbe, SizeResolver};
use crate::downloader::store::ChunkStore;
use crate::utils::error::DownloadError;
use crate::utils::network::{NetworkMonitor, ReachabilityMonitor};
use crate::utils::platform::{self, DiskSpace, StorageProbe};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use reqwest::{Client, Url};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Download configuration
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub tiers: ChunkTiers,
    pub max_concurrent_chunks: usize, // Simultaneous chunk fetches per file (default: 4)
    pub retry: RetryConfig,           // Bulk chunk transfer
    pub metadata_retry: RetryConfig,  // Size probes
    pub probe_timeout: Duration,
    pub chunk_timeout: Duration, // Per network await while fetching a chunk
    pub progress_interval: Duration,
    pub temp_retention: Duration,
    pub storage_safety_factor: f64,
    pub min_artifact_bytes: u64,
    pub copy_buffer: usize,
    pub short_body_ratio: f64,
    pub max_concurrent_probes: usize,
    pub connectivity_probe: Option<String>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tiers: ChunkTiers::default(),
            max_concurrent_chunks: 4,
            retry: RetryConfig::bulk(),
            metadata_retry: RetryConfig::metadata(),
            probe_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(120),
            progress_interval: Duration::from_millis(250),
            temp_retention: Duration::from_secs(24 * 3600),
            storage_safety_factor: 2.0,
            min_artifact_bytes: 1024,
            copy_buffer: DEFAULT_COPY_BUFFER,
            short_body_ratio: 0.9,
            max_concurrent_probes: 8,
            connectivity_probe: None,
            user_agent: concat!("chunkloader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// External collaborators the engine talks to
#[derive(Clone)]
pub struct Backends {
    pub fetcher: Arc<dyn ChunkFetcher>,
    pub sizes: Arc<dyn SizeProbe>,
    pub network: Arc<dyn NetworkMonitor>,
    pub storage: Arc<dyn StorageProbe>,
}

impl Backends {
    /// HTTP transport, TCP connectivity probe and real disk space
    pub fn http(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.probe_timeout)
            .build()?;

        let fetcher = HttpChunkFetcher::new(client.clone(), config.chunk_timeout)
            .with_short_body_ratio(config.short_body_ratio);
        let sizes = SizeResolver::new(
            client,
            config.probe_timeout,
            RetryPolicy::new(config.metadata_retry.clone()),
        );

        Ok(Self {
            fetcher: Arc::new(fetcher),
            sizes: Arc::new(sizes),
            network: Arc::new(ReachabilityMonitor::new(
                config.connectivity_probe.clone(),
                Duration::from_secs(5),
            )),
            storage: Arc::new(DiskSpace),
        })
    }
}

/// Everything the engine tracks for one logical download
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: Uuid,
    pub files: Vec<FileChunkSet>,
    pub destination: PathBuf,
    pub state: SessionState,
    pub is_downloading: bool,
    pub is_paused: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    sampler: SpeedSampler,
}

impl DownloadSession {
    pub fn downloaded_bytes(&self) -> u64 {
        self.files.iter().map(FileChunkSet::downloaded_bytes).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.total_size).sum()
    }

    pub fn file(&self, file_name: &str) -> Option<&FileChunkSet> {
        self.files.iter().find(|f| f.target.file_name == file_name)
    }

    fn snapshot(&mut self, now: Instant) -> ProgressSnapshot {
        let downloaded = self.downloaded_bytes();
        let total = self.total_bytes();
        let speed = if self.is_downloading {
            self.sampler.sample(now, downloaded)
        } else {
            0.0
        };
        let eta = if self.state == SessionState::Completed {
            Some(Duration::ZERO)
        } else if speed > 0.0 {
            ProgressSnapshot::estimate_eta(downloaded, total, speed)
        } else {
            None
        };

        ProgressSnapshot {
            session_id: Some(self.id),
            state: self.state,
            overall_progress: if self.state == SessionState::Completed {
                1.0
            } else {
                ProgressSnapshot::fraction(downloaded, total)
            },
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta,
            is_downloading: self.is_downloading,
            error_message: self.error_message.clone(),
            can_resume: self.state.can_resume(),
            started_at: Some(self.started_at),
            files: self
                .files
                .iter()
                .map(|f| FileProgress {
                    file_name: f.target.file_name.clone(),
                    completed_chunks: f.completed_chunks(),
                    total_chunks: f.chunks.len(),
                    downloaded_bytes: f.downloaded_bytes(),
                    total_bytes: f.total_size,
                    merged: f.merged,
                })
                .collect(),
        }
    }
}

struct ActiveRun {
    token: CancellationToken,
    done: Shared<BoxFuture<'static, ()>>,
}

struct EngineInner {
    config: DownloadConfig,
    store: ChunkStore,
    backends: Backends,
    retry: RetryPolicy,
    session: std::sync::Mutex<Option<DownloadSession>>,
    run: Mutex<Option<ActiveRun>>,
    control: Mutex<()>,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl EngineInner {
    /// Never held across an await
    fn lock_session(&self) -> MutexGuard<'_, Option<DownloadSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, session: &mut DownloadSession) {
        self.progress_tx
            .send_replace(session.snapshot(Instant::now()));
    }
}

/// How one fetch future ended
#[derive(Debug)]
enum ChunkOutcome {
    Completed,
    FullFile(u64),
    /// Origin ignored `Range` and this chunk may not take the body
    Deferred { on_disk: u64 },
    Aborted { on_disk: u64 },
    Exhausted { error: String, on_disk: u64 },
}

enum FileOutcome {
    Completed,
    Incomplete,
    Aborted,
}

enum Step {
    Done,
    FullFile(u64),
    Deferred,
}

/// Chunked parallel download engine
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    /// Create an engine with HTTP backends and the platform temp directory
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        let backends = Backends::http(&config)?;
        Ok(Self::with_backends(
            config,
            ChunkStore::new(platform::chunk_temp_dir()),
            backends,
        ))
    }

    pub fn with_backends(config: DownloadConfig, store: ChunkStore, backends: Backends) -> Self {
        let (progress_tx, _) = watch::channel(ProgressSnapshot::idle());
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                backends,
                retry,
                session: std::sync::Mutex::new(None),
                run: Mutex::new(None),
                control: Mutex::new(()),
                progress_tx,
            }),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }

    /// Receive every published progress snapshot
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.progress_tx.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.progress_tx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.progress_tx.borrow().state
    }

    /// Copy of the current session, for diagnostics
    pub async fn session(&self) -> Option<DownloadSession> {
        self.inner.lock_session().clone()
    }

    /// Wait for the running session loop (if any) to stop
    pub async fn wait(&self) -> ProgressSnapshot {
        let done = self.inner.run.lock().await.as_ref().map(|r| r.done.clone());
        if let Some(done) = done {
            done.await;
        }
        self.snapshot()
    }

    /// Start downloading `files` into `destination`, replacing any previous session
    pub async fn start(
        &self,
        files: Vec<FileTarget>,
        destination: impl Into<PathBuf>,
    ) -> Result<(), DownloadError> {
        let _control = self.inner.control.lock().await;
        let destination = destination.into();

        self.stop_run().await;
        let previous = self.inner.lock_session().take();
        if let Some(previous) = previous {
            self.discard_dropped_targets(&previous, &files).await;
        }

        match self.prepare(files, &destination).await {
            Ok(mut session) => {
                info!(
                    "Starting session {} ({} files, {} bytes)",
                    session.id,
                    session.files.len(),
                    session.total_bytes()
                );
                self.inner.publish(&mut session);
                *self.inner.lock_session() = Some(session);
                self.spawn_run().await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to start download: {}", e);
                let mut snapshot = ProgressSnapshot::idle();
                snapshot.state = SessionState::Failed { resumable: false };
                snapshot.error_message = Some(e.to_string());
                self.inner.progress_tx.send_replace(snapshot);
                Err(e)
            }
        }
    }

    /// Remove chunk files of `previous` targets that `next` no longer names.
    /// Chunks of targets that stay are kept for recovery.
    async fn discard_dropped_targets(&self, previous: &DownloadSession, next: &[FileTarget]) {
        let store = &self.inner.store;
        let dropped = previous
            .files
            .iter()
            .filter(|f| !next.iter().any(|t| t.file_name == f.target.file_name));
        for file in dropped {
            for chunk in &file.chunks {
                if let Err(e) = store.remove(&chunk.id).await {
                    warn!("Failed to remove chunk {}: {}", chunk.id, e);
                }
            }
            debug!("Discarded chunks of {} from session {}", file.target.file_name, previous.id);
        }
    }

    async fn prepare(
        &self,
        files: Vec<FileTarget>,
        destination: &Path,
    ) -> Result<DownloadSession, DownloadError> {
        let inner = &self.inner;

        for file in &files {
            let url = Url::parse(&file.url)
                .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", file.url, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DownloadError::InvalidUrl(file.url.clone()));
            }
            if !file.has_safe_name() {
                return Err(DownloadError::InvalidFileName(file.file_name.clone()));
            }
        }
        let mut names = HashSet::with_capacity(files.len());
        if let Some(dup) = files.iter().find(|f| !names.insert(f.file_name.as_str())) {
            return Err(DownloadError::InvalidFileName(format!(
                "{} (listed twice)",
                dup.file_name
            )));
        }

        if !inner.backends.network.is_available().await {
            return Err(DownloadError::NetworkUnavailable);
        }

        fs::create_dir_all(destination).await.map_err(|e| {
            DownloadError::DestinationUnavailable(format!("{}: {}", destination.display(), e))
        })?;
        inner.store.ensure_root().await?;

        match inner.store.sweep_stale(inner.config.temp_retention).await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale chunk files", n),
            Err(e) => warn!("Failed to sweep stale chunk files: {}", e),
        }

        let unresolved: Vec<String> = files
            .iter()
            .filter(|f| f.total_size.is_none())
            .map(|f| f.url.clone())
            .collect();
        let sizes = self.resolve_sizes(&unresolved).await;

        let mut sets = Vec::with_capacity(files.len());
        for target in files {
            let total_size = match target.total_size.or_else(|| sizes.get(&target.url).copied()) {
                Some(size) => size,
                None => return Err(DownloadError::SizeUnavailable(target.file_name.clone())),
            };
            let mut set = FileChunkSet::new(target, total_size, &inner.config.tiers);
            self.recover(&mut set, destination).await?;
            sets.push(set);
        }

        let unmerged: u64 = sets.iter().filter(|s| !s.merged).map(|s| s.total_size).sum();
        let on_disk: u64 = sets
            .iter()
            .filter(|s| !s.merged)
            .map(FileChunkSet::downloaded_bytes)
            .sum();
        let required = ((unmerged as f64 * inner.config.storage_safety_factor) as u64)
            .saturating_sub(on_disk);
        if let Some(available) = inner.backends.storage.available_space(destination) {
            if available < required {
                return Err(DownloadError::InsufficientStorage {
                    required,
                    available,
                });
            }
        }

        let downloaded: u64 = sets.iter().map(FileChunkSet::downloaded_bytes).sum();
        Ok(DownloadSession {
            id: Uuid::new_v4(),
            files: sets,
            destination: destination.to_path_buf(),
            state: SessionState::Downloading,
            is_downloading: true,
            is_paused: false,
            error_message: None,
            started_at: Utc::now(),
            sampler: SpeedSampler::starting_at(
                Instant::now(),
                downloaded,
                inner.config.progress_interval,
            ),
        })
    }

    async fn resolve_sizes(&self, urls: &[String]) -> HashMap<String, u64> {
        let probe = self.inner.backends.sizes.as_ref();
        match resolve_all(probe, urls, self.inner.config.max_concurrent_probes).await {
            Ok(sizes) => sizes,
            Err(e) => {
                warn!("No file sizes could be resolved: {}", e);
                HashMap::new()
            }
        }
    }

    /// Pick up chunk bytes left on disk by an earlier run
    async fn recover(&self, set: &mut FileChunkSet, destination: &Path) -> Result<(), DownloadError> {
        let store = &self.inner.store;

        let dest = destination_path(destination, &set.target.file_name);
        if let Ok(meta) = fs::metadata(&dest).await {
            if meta.is_file() && meta.len() == set.total_size {
                info!("{} already present, skipping", dest.display());
                set.merged = true;
                for chunk in set.chunks.iter_mut() {
                    chunk.downloaded_bytes = chunk.expected_size();
                    chunk.state = ChunkState::Completed;
                }
                return Ok(());
            }
        }

        for chunk in set.chunks.iter_mut() {
            let on_disk = store.existing_len(&chunk.id).await?;
            let expected = chunk.expected_size();
            if on_disk > expected {
                store.remove(&chunk.id).await?;
            } else if on_disk == expected {
                chunk.downloaded_bytes = on_disk;
                chunk.state = ChunkState::Completed;
            } else if on_disk > 0 {
                chunk.downloaded_bytes = on_disk;
            }
        }

        let recovered = set.completed_chunks();
        if recovered > 0 {
            debug!(
                "Recovered {} of {} chunks for {}",
                recovered,
                set.chunks.len(),
                set.target.file_name
            );
        }
        Ok(())
    }

    async fn spawn_run(&self) {
        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { run_session(inner, run_token).await });
        let done = async move {
            if let Err(e) = handle.await {
                error!("Download task ended abnormally: {}", e);
            }
        }
        .boxed()
        .shared();

        *self.inner.run.lock().await = Some(ActiveRun { token, done });
    }

    async fn stop_run(&self) {
        let run = self.inner.run.lock().await.take();
        if let Some(run) = run {
            run.token.cancel();
            run.done.await;
        }
    }

    /// Stop in-flight fetches, keeping every partial byte on disk
    pub async fn pause(&self) -> Result<(), DownloadError> {
        let _control = self.inner.control.lock().await;
        {
            let mut guard = self.inner.lock_session();
            match guard.as_mut() {
                Some(session) if session.state == SessionState::Downloading => {
                    session.is_paused = true;
                    session.state = SessionState::Paused;
                }
                _ => return Ok(()),
            }
        }

        self.stop_run().await;

        let mut guard = self.inner.lock_session();
        if let Some(session) = guard.as_mut() {
            for file in session.files.iter_mut() {
                for chunk in file.chunks.iter_mut() {
                    if chunk.state == ChunkState::InProgress {
                        chunk.state = ChunkState::Paused;
                    }
                }
            }
            session.is_downloading = false;
            info!(
                "Paused session {} at {} of {} bytes",
                session.id,
                session.downloaded_bytes(),
                session.total_bytes()
            );
            self.inner.publish(session);
        }
        Ok(())
    }

    /// Continue a paused or failed session from the bytes already on disk
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let _control = self.inner.control.lock().await;
        let store = &self.inner.store;

        // (file index, chunk ids, completed chunk ids) of every unmerged file
        let files: Vec<(usize, Vec<String>, Vec<String>)> = {
            let guard = self.inner.lock_session();
            let Some(session) = guard.as_ref() else {
                return Ok(());
            };
            if !session.state.can_resume() {
                return Ok(());
            }
            session
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.merged)
                .map(|(i, f)| {
                    let all = f.chunks.iter().map(|c| c.id.clone()).collect();
                    let done = f
                        .chunks
                        .iter()
                        .filter(|c| c.is_completed())
                        .map(|c| c.id.clone())
                        .collect();
                    (i, all, done)
                })
                .collect()
        };

        let mut restart = Vec::new();
        for (index, all, done) in &files {
            let mut chunk_files_present = true;
            for id in done {
                if !store.exists(id).await {
                    chunk_files_present = false;
                    break;
                }
            }
            if !chunk_files_present || all.is_empty() {
                restart.push((*index, all.clone(), chunk_files_present));
            }
        }

        let tiers = self.inner.config.tiers;
        let mut wiped = Vec::new();
        {
            let mut guard = self.inner.lock_session();
            let Some(session) = guard.as_mut() else {
                return Ok(());
            };

            for (index, ids, chunk_files_present) in restart {
                let file = &mut session.files[index];
                let needs_restart = (file.chunks.is_empty() && file.total_size > 0)
                    || (!file.has_incomplete_chunks() && !chunk_files_present);
                if needs_restart {
                    info!("Restarting {} from scratch", file.target.file_name);
                    file.chunks = plan_chunks(&file.target.file_name, file.total_size, &tiers);
                    wiped.extend(ids);
                }
            }

            for file in session.files.iter_mut().filter(|f| !f.merged) {
                for chunk in file.chunks.iter_mut() {
                    if matches!(chunk.state, ChunkState::Paused | ChunkState::InProgress) {
                        chunk.state = ChunkState::Pending;
                    }
                }
            }
        }

        for id in &wiped {
            if let Err(e) = store.remove(id).await {
                warn!("Failed to remove chunk file {}: {}", id, e);
            }
        }

        {
            let mut guard = self.inner.lock_session();
            let Some(session) = guard.as_mut() else {
                return Ok(());
            };
            session.is_paused = false;
            session.is_downloading = true;
            session.state = SessionState::Downloading;
            session.error_message = None;
            let downloaded = session.downloaded_bytes();
            session.sampler.restart(Instant::now(), downloaded);
            info!("Resuming session {} from {} bytes", session.id, downloaded);
            self.inner.publish(session);
        }

        self.spawn_run().await;
        Ok(())
    }

    /// Stop everything and discard all partial progress
    pub async fn cancel(&self) -> Result<(), DownloadError> {
        let _control = self.inner.control.lock().await;
        {
            let mut guard = self.inner.lock_session();
            if let Some(session) = guard.as_mut() {
                session.is_paused = true;
            }
        }

        self.stop_run().await;

        let session = self.inner.lock_session().take();
        match self.inner.store.purge().await {
            Ok(n) => debug!("Removed {} chunk files", n),
            Err(e) => warn!("Failed to purge chunk files: {}", e),
        }

        if let Some(session) = session {
            for file in &session.files {
                let dest = destination_path(&session.destination, &file.target.file_name);
                let Ok(meta) = fs::metadata(&dest).await else {
                    continue;
                };
                // Only implausibly small leftovers; complete or foreign files stay
                if !file.merged && meta.len() < self.inner.config.min_artifact_bytes {
                    match fs::remove_file(&dest).await {
                        Ok(()) => debug!("Removed partial artifact {}", dest.display()),
                        Err(e) => warn!("Failed to remove {}: {}", dest.display(), e),
                    }
                }
            }
            info!("Cancelled session {}", session.id);
        }

        self.inner.progress_tx.send_replace(ProgressSnapshot::idle());
        Ok(())
    }
}

async fn run_session(inner: Arc<EngineInner>, token: CancellationToken) {
    let file_count = match inner.lock_session().as_ref() {
        Some(session) => session.files.len(),
        None => return,
    };

    let mut incomplete = 0usize;
    for file_index in 0..file_count {
        if token.is_cancelled() {
            return;
        }
        let merged = match inner.lock_session().as_ref() {
            Some(session) => session.files[file_index].merged,
            None => return,
        };
        if merged {
            continue;
        }

        match run_file(&inner, file_index, &token).await {
            FileOutcome::Completed => {}
            FileOutcome::Incomplete => incomplete += 1,
            FileOutcome::Aborted => return,
        }
    }

    let mut guard = inner.lock_session();
    let Some(session) = guard.as_mut() else {
        return;
    };
    if session.is_paused || token.is_cancelled() {
        return;
    }

    session.is_downloading = false;
    if incomplete == 0 && session.files.iter().all(|f| f.merged) {
        session.state = SessionState::Completed;
        session.error_message = None;
        info!("Session {} completed", session.id);
    } else {
        session.state = SessionState::Failed { resumable: true };
        if session.error_message.is_none() {
            session.error_message = Some(format!("{} file(s) incomplete", incomplete));
        }
        warn!(
            "Session {} stopped with {} incomplete file(s); resumable",
            session.id, incomplete
        );
    }
    inner.publish(session);
}

async fn run_file(inner: &Arc<EngineInner>, file_index: usize, token: &CancellationToken) -> FileOutcome {
    let (pending, url, file_name) = {
        let mut guard = inner.lock_session();
        let Some(session) = guard.as_mut() else {
            return FileOutcome::Aborted;
        };
        let file = &mut session.files[file_index];
        let pending: Vec<usize> = file
            .chunks
            .iter()
            .filter(|c| !c.is_completed())
            .map(|c| c.index)
            .collect();
        for &index in &pending {
            file.chunks[index].state = ChunkState::Pending;
        }
        (pending, file.target.url.clone(), file.target.file_name.clone())
    };

    info!(
        "Downloading {} ({} chunks pending)",
        file_name,
        pending.len()
    );

    // Only the first pending chunk may keep a full-file body
    let keeper = pending.first().copied();
    let file_token = token.child_token();
    let mut full_file: Option<(usize, u64)> = None;
    let mut exhausted = 0usize;
    let mut deferred = 0usize;

    {
        let mut results = stream::iter(pending)
            .map(|index| {
                let inner = Arc::clone(inner);
                let url = url.clone();
                let token = file_token.clone();
                let accept_full_file = keeper == Some(index);
                async move {
                    fetch_chunk(&inner, file_index, index, &url, accept_full_file, &token).await
                }
            })
            .buffer_unordered(inner.config.max_concurrent_chunks.max(1));

        while let Some((index, outcome)) = results.next().await {
            let mut guard = inner.lock_session();
            let Some(session) = guard.as_mut() else {
                return FileOutcome::Aborted;
            };
            let file = &mut session.files[file_index];
            let chunk = &mut file.chunks[index];

            match outcome {
                ChunkOutcome::Completed => {
                    chunk.downloaded_bytes = chunk.expected_size();
                    chunk.state = ChunkState::Completed;
                    debug!("Chunk {} completed", chunk.id);
                }
                ChunkOutcome::FullFile(bytes) => {
                    if full_file.is_none() {
                        info!("Origin sent all of {} in one response", file_name);
                        full_file = Some((index, bytes));
                        file_token.cancel();
                    }
                }
                ChunkOutcome::Deferred { on_disk } => {
                    chunk.downloaded_bytes = on_disk.min(chunk.expected_size());
                    chunk.state = ChunkState::Paused;
                    deferred += 1;
                }
                ChunkOutcome::Aborted { on_disk } => {
                    chunk.downloaded_bytes = on_disk.min(chunk.expected_size());
                    chunk.state = ChunkState::Paused;
                }
                ChunkOutcome::Exhausted { error, on_disk } => {
                    chunk.downloaded_bytes = on_disk.min(chunk.expected_size());
                    chunk.state = ChunkState::Paused;
                    exhausted += 1;
                    error!("Chunk {} gave up: {}", chunk.id, error);
                    session.error_message =
                        Some(format!("{} chunk {}: {}", file_name, index, error));
                }
            }

            inner.publish(session);
        }
    }

    if let Some((index, bytes)) = full_file {
        if let Err(e) = collapse_full_file(inner, file_index, index, bytes).await {
            error!("Failed to adopt full-file response for {}: {}", file_name, e);
            set_error(inner, format!("{}: {}", file_name, e));
            return FileOutcome::Incomplete;
        }
    }

    if token.is_cancelled() {
        return FileOutcome::Aborted;
    }
    if exhausted > 0 {
        return FileOutcome::Incomplete;
    }
    if deferred > 0 && full_file.is_none() {
        warn!("{}: origin ignored Range for {} chunk(s)", file_name, deferred);
        set_error(inner, format!("{}: origin ignored Range", file_name));
        return FileOutcome::Incomplete;
    }

    // Merge a copy so the session stays readable during long disk copies.
    let (mut set, destination) = {
        let guard = inner.lock_session();
        let Some(session) = guard.as_ref() else {
            return FileOutcome::Aborted;
        };
        (session.files[file_index].clone(), session.destination.clone())
    };

    if !set.is_completed() {
        set_error(inner, format!("{}: chunks still pending", file_name));
        return FileOutcome::Incomplete;
    }

    let result = merge_file(&mut set, &inner.store, &destination, inner.config.copy_buffer).await;

    let mut guard = inner.lock_session();
    let Some(session) = guard.as_mut() else {
        return FileOutcome::Aborted;
    };
    session.files[file_index] = set;
    let outcome = match result {
        Ok(path) => {
            info!("Wrote {}", path.display());
            FileOutcome::Completed
        }
        Err(e) => {
            session.error_message = Some(format!("{}: {}", file_name, e));
            FileOutcome::Incomplete
        }
    };
    inner.publish(session);
    outcome
}

fn set_error(inner: &EngineInner, message: String) {
    if let Some(session) = inner.lock_session().as_mut() {
        session.error_message = Some(message);
    }
}

/// Replace a file's chunks with the single full-body chunk at `index`
async fn collapse_full_file(
    inner: &EngineInner,
    file_index: usize,
    index: usize,
    bytes: u64,
) -> Result<(), DownloadError> {
    let (ids, keep, file_name, expected_total) = {
        let guard = inner.lock_session();
        let session = guard.as_ref().ok_or(DownloadError::Cancelled)?;
        let file = &session.files[file_index];
        (
            file.chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            file.chunks[index].id.clone(),
            file.target.file_name.clone(),
            file.total_size,
        )
    };

    for id in ids.iter().filter(|id| **id != keep) {
        inner.store.remove(id).await?;
    }
    let target_id = chunk_id(&file_name, 0);
    if keep != target_id {
        inner.store.rename(&keep, &target_id).await?;
    }

    if bytes != expected_total {
        warn!(
            "{}: full response was {} bytes, expected {}",
            file_name, bytes, expected_total
        );
    }

    let mut guard = inner.lock_session();
    let session = guard.as_mut().ok_or(DownloadError::Cancelled)?;
    let file = &mut session.files[file_index];
    file.total_size = bytes;
    file.chunks = if bytes == 0 {
        Vec::new()
    } else {
        vec![ChunkSpec {
            id: target_id,
            index: 0,
            start_byte: 0,
            end_byte: bytes - 1,
            downloaded_bytes: bytes,
            state: ChunkState::Completed,
        }]
    };
    inner.publish(session);
    Ok(())
}

/// Fetch one chunk under the retry policy
async fn fetch_chunk(
    inner: &EngineInner,
    file_index: usize,
    index: usize,
    url: &str,
    accept_full_file: bool,
    token: &CancellationToken,
) -> (usize, ChunkOutcome) {
    let store = &inner.store;
    let mut retry = RetryState::default();

    loop {
        let claimed = {
            let mut guard = inner.lock_session();
            guard.as_mut().map(|session| {
                let chunk = &mut session.files[file_index].chunks[index];
                chunk.state = ChunkState::InProgress;
                (chunk.id.clone(), chunk.start_byte, chunk.end_byte)
            })
        };
        let Some((id, start, end)) = claimed else {
            return (index, ChunkOutcome::Aborted { on_disk: 0 });
        };
        let expected = end - start + 1;

        if token.is_cancelled() {
            let on_disk = store.existing_len(&id).await.unwrap_or(0);
            return (index, ChunkOutcome::Aborted { on_disk });
        }

        let attempt: Result<Step, DownloadError> = async {
            let mut on_disk = store.existing_len(&id).await?;
            if on_disk > expected {
                warn!("Chunk {} has {} bytes on disk, expected {}; refetching", id, on_disk, expected);
                store.remove(&id).await?;
                on_disk = 0;
            }
            if on_disk == expected {
                return Ok(Step::Done);
            }

            let request = ChunkRequest {
                url: url.to_string(),
                chunk_id: id.clone(),
                start_byte: start + on_disk,
                end_byte: end,
                path: store.path_for(&id),
                accept_full_file,
            };
            let outcome = inner.backends.fetcher.fetch(&request, token).await?;
            if outcome.is_full_file {
                return Ok(if accept_full_file {
                    Step::FullFile(outcome.bytes_written)
                } else {
                    Step::Deferred
                });
            }

            let received = on_disk + outcome.bytes_written;
            if received >= expected {
                Ok(Step::Done)
            } else {
                Err(DownloadError::IncompleteBody { expected, received })
            }
        }
        .await;

        let error = match attempt {
            Ok(Step::Done) => return (index, ChunkOutcome::Completed),
            Ok(Step::FullFile(bytes)) => return (index, ChunkOutcome::FullFile(bytes)),
            Ok(Step::Deferred) => {
                let on_disk = store.existing_len(&id).await.unwrap_or(0);
                return (index, ChunkOutcome::Deferred { on_disk });
            }
            Err(DownloadError::Cancelled) => {
                let on_disk = store.existing_len(&id).await.unwrap_or(0);
                return (index, ChunkOutcome::Aborted { on_disk });
            }
            Err(e) => e,
        };

        let reason = inner.retry.classify(&error);
        let attempts = retry.record(reason);
        let online = if reason == RetryReason::NetworkError {
            inner.backends.network.is_available().await
        } else {
            true
        };

        let on_disk = store.existing_len(&id).await.unwrap_or(0);
        if let Some(session) = inner.lock_session().as_mut() {
            let chunk = &mut session.files[file_index].chunks[index];
            chunk.downloaded_bytes = on_disk.min(expected);
        }

        if !inner.retry.should_retry(reason, attempts, online) {
            return (
                index,
                ChunkOutcome::Exhausted {
                    error: format!("{} after {} attempt(s) ({:?})", error, attempts, reason),
                    on_disk,
                },
            );
        }

        let delay = inner.retry.backoff(attempts);
        warn!(
            "Chunk {} failed (attempt {}, {:?}): {}; retrying in {:?}",
            id, attempts, reason, error, delay
        );

        tokio::select! {
            _ = token.cancelled() => return (index, ChunkOutcome::Aborted { on_disk }),
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DownloadConfig::default();
        assert_eq!(config.max_concurrent_chunks, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.metadata_retry.max_attempts < config.retry.max_attempts);
        assert!(config.storage_safety_factor >= 2.0);
        assert!(config.user_agent.starts_with("chunkloader/"));
    }

    #[tokio::test]
    async fn test_fresh_engine_is_idle() {
        let engine = DownloadEngine::new(DownloadConfig::default()).unwrap();
        assert_eq!(engine.state(), SessionState::Idle);
        assert!(engine.session().await.is_none());
        // Control operations without a session are no-ops
        engine.pause().await.unwrap();
        engine.resume().await.unwrap();
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_url_is_fatal() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = DownloadEngine::with_backends(
            DownloadConfig::default(),
            ChunkStore::new(temp.path().join("tmp")),
            Backends::http(&DownloadConfig::default()).unwrap(),
        );
        let err = engine
            .start(
                vec![FileTarget::new("not a url", "x.bin").with_size(10)],
                temp.path().join("out"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::InvalidUrl(_)));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, SessionState::Failed { resumable: false });
        assert!(!snapshot.can_resume);
        assert!(snapshot.error_message.is_some());
    }
}
