//! Session orchestration.
//!
//! The engine drives one download from probe to publish:
//!
//! 1. Probe the URL for length, range support, and naming hints.
//! 2. Resolve the destination path and apply the write mode.
//! 3. Partition the effective range and reconcile any crash leftovers.
//! 4. Run the chunk fetchers and merge completed parts in order.
//! 5. Atomically rename the final-temp file into place.
//!
//! `start` is idempotent, `pause`/`resume` are cooperative, `cancel` is
//! terminal, and `wait` blocks until a terminal state. Terminal callbacks
//! fire exactly once.

use crate::chunk::{Chunk, ChunkEvent, ChunkFetcher, ChunkRange, ChunkState};
use crate::coordinator::{self, ChunkCoordinator};
use crate::error::DownloadError;
use crate::filename;
use crate::options::{DownloadOptions, WriteMode, DEFAULT_USER_AGENT};
use crate::probe::{self, ContentInfo};
use crate::progress::{AggregateProgress, AggregateSpeed};
use crate::range::{self, ByteRange, ResolvedRange};
use crate::reporter::Reporter;
use crate::throttle::RateLimiter;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Session lifecycle. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Serializable snapshot of a running session, for host persistence or UI
/// emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: Uuid,
    /// Bytes currently merged into the final-temp file.
    pub bytes_written: u64,
    /// Expected payload size, when known.
    pub total: Option<u64>,
    /// Normalized `[0, 1]` progress.
    pub progress: f64,
    /// Aggregate bytes/s.
    pub speed_bps: u64,
    pub state: SessionState,
}

struct EngineShared {
    id: Uuid,
    options: DownloadOptions,
    url: url::Url,
    client: reqwest::Client,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    state: watch::Sender<SessionState>,
    info: OnceLock<ContentInfo>,
    limiter: Arc<RateLimiter>,
    /// Bytes merged into the final-temp file (invariant I2).
    merged_bytes: Arc<AtomicU64>,
    expected_total: Mutex<Option<u64>>,
    progress_value: Mutex<f64>,
    speed_bps: AtomicU64,
    outcome: Mutex<Option<Result<PathBuf, DownloadError>>>,
    started: AtomicBool,
    terminal_fired: AtomicBool,
    /// Scratch artifacts for failure cleanup.
    part_paths: Mutex<Vec<PathBuf>>,
    final_temp: Mutex<Option<PathBuf>>,
}

impl EngineShared {
    fn set_state(&self, state: SessionState) {
        let changed = {
            let current = *self.state.borrow();
            current != state
        };
        if changed {
            self.state.send_replace(state);
            if let Some(cb) = &self.options.observers.state_changed {
                cb(state);
            }
        }
    }
}

/// One download session. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct DownloadEngine {
    shared: Arc<EngineShared>,
}

impl DownloadEngine {
    /// Validates the options and prepares the session. Input errors are
    /// reported here, synchronously; the session never starts running.
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        options.validate()?;
        let url = url::Url::parse(&options.url)
            .map_err(|e| DownloadError::InvalidPath(format!("invalid url: {}", e)))?;

        let mut default_headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DownloadError::InvalidPath(format!("bad header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DownloadError::InvalidPath(format!("bad header value: {}", e)))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .user_agent(
                options
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            )
            .default_headers(default_headers)
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let limiter = Arc::new(RateLimiter::new(options.max_bps));
        let (pause, _) = watch::channel(false);
        let (state, _) = watch::channel(SessionState::Idle);

        Ok(Self {
            shared: Arc::new(EngineShared {
                id: Uuid::new_v4(),
                options,
                url,
                client,
                cancel: CancellationToken::new(),
                pause,
                state,
                info: OnceLock::new(),
                limiter,
                merged_bytes: Arc::new(AtomicU64::new(0)),
                expected_total: Mutex::new(None),
                progress_value: Mutex::new(0.0),
                speed_bps: AtomicU64::new(0),
                outcome: Mutex::new(None),
                started: AtomicBool::new(false),
                terminal_fired: AtomicBool::new(false),
                part_paths: Mutex::new(Vec::new()),
                final_temp: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Content metadata, once the probe (or the first response) supplied
    /// it.
    pub fn info(&self) -> Option<ContentInfo> {
        self.shared.info.get().cloned()
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            id: self.shared.id,
            bytes_written: self.shared.merged_bytes.load(Ordering::Acquire),
            total: *self.shared.expected_total.lock().unwrap(),
            progress: *self.shared.progress_value.lock().unwrap(),
            speed_bps: self.shared.speed_bps.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Spawns the session onto the current tokio runtime. Idempotent:
    /// subsequent calls are no-ops.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run(shared));
    }

    /// Cooperative suspension: chunks finish their current buffer write and
    /// park. Resumable via `resume`.
    pub fn pause(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.pause.send_replace(true);
        if self.state() == SessionState::Running {
            self.shared.set_state(SessionState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.pause.send_replace(false);
        if self.state() == SessionState::Paused {
            self.shared.set_state(SessionState::Running);
        }
    }

    /// Non-resumable termination. Chunks flush and close their part files
    /// before acknowledging.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        // A paused session has no live await points to notice the token.
        self.shared.pause.send_replace(false);
    }

    /// Changes the session rate cap live; 0 removes the cap.
    pub fn set_speed_limit(&self, max_bps: u64) {
        self.shared.limiter.set_limit(max_bps);
    }

    /// Blocks until the session reaches a terminal state and returns the
    /// published path.
    pub async fn wait(&self) -> Result<PathBuf, DownloadError> {
        let mut rx = self.shared.state.subscribe();
        loop {
            if rx.borrow().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.shared
            .outcome
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Err(DownloadError::Cancelled))
    }
}

/// Top-level task: drive the session, then settle the terminal state and
/// fire the matching callback exactly once.
async fn run(shared: Arc<EngineShared>) {
    shared.set_state(SessionState::Running);
    if let Some(cb) = &shared.options.observers.started {
        cb();
    }

    let result = drive(&shared).await;

    if shared.terminal_fired.swap(true, Ordering::SeqCst) {
        return;
    }

    match &result {
        Ok(path) => {
            *shared.outcome.lock().unwrap() = Some(Ok(path.clone()));
            shared.set_state(SessionState::Completed);
            if let Some(cb) = &shared.options.observers.completed {
                cb(path);
            }
        }
        Err(error) => {
            // Stop any fetchers still in flight before touching their
            // part files.
            shared.cancel.cancel();
            cleanup_after_failure(&shared).await;
            *shared.outcome.lock().unwrap() = Some(Err(error.clone()));
            shared.set_state(if error.is_cancellation() {
                SessionState::Cancelled
            } else {
                SessionState::Failed
            });
            if let Some(cb) = &shared.options.observers.failed {
                cb(error);
            }
        }
    }
}

/// The whole probe → partition → fetch → merge → publish pipeline.
async fn drive(shared: &Arc<EngineShared>) -> Result<PathBuf, DownloadError> {
    let opts = &shared.options;

    // PROBE. Failures are recorded but never fatal: the session degrades
    // to a single, non-resumable stream.
    let info = match probe::probe(
        &shared.client,
        &shared.url,
        opts.timeout,
        opts.supports_head_request,
        &shared.cancel,
    )
    .await
    {
        Ok(info) => info,
        Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
        Err(error) => {
            tracing::warn!(error = %error, "probe failed, proceeding without range support");
            ContentInfo::default()
        }
    };
    let info = shared.info.get_or_init(|| info).clone();
    if let Some(cb) = &opts.observers.info_fetched {
        cb(&info);
    }

    // FILENAME AND PATH RESOLUTION.
    let content_ext = match (&info.content_type, &opts.observers.mime_lookup) {
        (Some(ct), Some(lookup)) => lookup(ct),
        _ => None,
    };
    let name = filename::resolve_name(
        opts.url.as_str(),
        info.filename_hint.as_deref(),
        content_ext.as_deref(),
        opts.filename.as_deref(),
    );

    if let Some(ext) = filename::extension_of(&name) {
        let excluded = opts
            .excluded_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext));
        if excluded {
            return Err(DownloadError::DisallowedExtension(ext));
        }
    }

    let dst_dir = opts.effective_dst_dir();
    let temp_dir = opts.effective_temp_dir();
    tokio::fs::create_dir_all(&dst_dir).await?;
    if temp_dir != dst_dir {
        tokio::fs::create_dir_all(&temp_dir).await?;
    }

    let mut destination = dst_dir.join(&name);
    match opts.write_mode {
        WriteMode::CreateNew => destination = filename::unique_path(&destination),
        WriteMode::AppendStrict => {
            let occupied = tokio::fs::metadata(&destination)
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if occupied {
                return Err(DownloadError::DestinationExists(
                    destination.display().to_string(),
                ));
            }
        }
        WriteMode::Overwrite | WriteMode::AppendOrTruncate => {}
    }

    let final_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DownloadError::InvalidPath("destination has no file name".into()))?;
    let final_temp = dst_dir.join(format!("{}.part", final_name));
    *shared.final_temp.lock().unwrap() = Some(final_temp.clone());

    // ZERO-LENGTH SHORT-CIRCUIT: no chunks, immediate success.
    if info.full_length == Some(0) {
        tokio::fs::File::create(&destination).await?;
        if let Some(cb) = &opts.observers.progress {
            cb(1.0);
        }
        return Ok(destination);
    }

    // RANGE PLANNING.
    let (chunk_ranges, expected_total) = plan_ranges(opts, &info)?;
    *shared.expected_total.lock().unwrap() = expected_total;
    let single = chunk_ranges.len() == 1;

    // Only AppendOrTruncate trusts leftover final-temp data; every other
    // mode starts from a clean slate.
    let mut existing = tokio::fs::metadata(&final_temp)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let keep_leftovers = opts.write_mode == WriteMode::AppendOrTruncate
        && existing > 0
        && expected_total.map(|t| existing <= t).unwrap_or(false)
        && existing >= opts.min_reload_size;
    if existing > 0 && !keep_leftovers {
        tracing::debug!(bytes = existing, "discarding stale final-temp data");
        tokio::fs::remove_file(&final_temp).await?;
        existing = 0;
    }

    // CHUNK CONSTRUCTION, including crash-recovery reconciliation.
    let chunks = build_chunks(
        shared,
        &chunk_ranges,
        &temp_dir,
        &final_name,
        &final_temp,
        single,
        existing,
    )
    .await?;

    shared.merged_bytes.store(
        if single { 0 } else { existing },
        Ordering::Release,
    );

    // PROGRESS AND SPEED WIRING.
    let progress = {
        let observers = opts.observers.clone();
        let shared = Arc::clone(shared);
        Arc::new(AggregateProgress::new(Reporter::new(
            opts.report_interval,
            move |value: f64| {
                *shared.progress_value.lock().unwrap() = value;
                if let Some(cb) = &observers.progress {
                    cb(value);
                }
            },
        )))
    };
    let speed = {
        let observers = opts.observers.clone();
        let shared = Arc::clone(shared);
        Arc::new(AggregateSpeed::new(Reporter::new(
            opts.report_interval,
            move |value: u64| {
                shared.speed_bps.store(value, Ordering::Relaxed);
                if let Some(cb) = &observers.speed {
                    cb(value);
                }
            },
        )))
    };

    let coordinator = ChunkCoordinator::new(
        chunks.clone(),
        final_temp.clone(),
        Arc::clone(&shared.merged_bytes),
    );

    // FETCHER SPAWN. Recovered chunks skip straight past this.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut pending = 0usize;
    for chunk in &chunks {
        if chunk.state() == ChunkState::Merged {
            continue;
        }
        let fetcher = ChunkFetcher {
            chunk: Arc::clone(chunk),
            client: shared.client.clone(),
            url: shared.url.clone(),
            opts: opts.chunk_options(),
            limiter: Some(Arc::clone(&shared.limiter)),
            cancel: shared.cancel.clone(),
            pause: shared.pause.subscribe(),
            progress: Arc::clone(&progress),
            progress_slot: progress.attach(),
            speed: Arc::clone(&speed),
            speed_slot: speed.attach(),
            events: events_tx.clone(),
        };
        tokio::spawn(fetcher.run());
        pending += 1;
    }
    drop(events_tx);

    if pending == 0 {
        // Everything was recovered from disk.
        coordinator.try_merge().await?;
        return publish(shared, &destination, &final_temp, &progress).await;
    }

    // SUPERVISION: collect chunk outcomes, merge as they complete.
    let mut session_error: Option<DownloadError> = None;
    let mut deferred_range_error: Option<DownloadError> = None;
    let mut full_body: Option<(usize, u64)> = None;

    while pending > 0 {
        let Some(event) = events_rx.recv().await else {
            break;
        };
        pending -= 1;
        match event {
            ChunkEvent::Completed { .. } => {
                if opts.merge_while_progress && session_error.is_none() {
                    coordinator.try_merge().await?;
                }
            }
            ChunkEvent::FullBody { index, bytes } => {
                // The server ignored partitioning; this part file holds the
                // entire body and sibling failures are moot. Reap the
                // siblings so the session does not wait out their retries.
                tracing::info!(bytes, "server returned the full body, abandoning partitioning");
                full_body = Some((index, bytes));
                deferred_range_error = None;
                shared.cancel.cancel();
            }
            ChunkEvent::Failed { index, error } => {
                if full_body.is_some() {
                    continue;
                }
                if matches!(error, DownloadError::Integrity(_)) && single_may_rescue(&chunks, index)
                {
                    // A sibling saw a 200 where 206 was required. Chunk 0
                    // may still come back with the full body, so hold off.
                    deferred_range_error.get_or_insert(error);
                    continue;
                }
                if session_error.is_none() {
                    tracing::error!(chunk = index, error = %error, "chunk failed, aborting session");
                    session_error = Some(error);
                    shared.cancel.cancel();
                }
            }
            ChunkEvent::Cancelled { .. } => {}
        }
    }

    if let Some(error) = session_error {
        return Err(error);
    }
    if let Some((index, bytes)) = full_body {
        adopt_full_body(shared, &chunks, index, bytes, &final_temp).await?;
        return publish(shared, &destination, &final_temp, &progress).await;
    }
    if shared.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }
    if let Some(error) = deferred_range_error {
        return Err(error);
    }

    let merged = coordinator.try_merge().await?;
    if !merged {
        return Err(DownloadError::Integrity(
            "chunks finished but the merge cursor did not reach the end".into(),
        ));
    }
    publish(shared, &destination, &final_temp, &progress).await
}

/// Resolves the effective range and splits it into per-chunk spans.
fn plan_ranges(
    opts: &DownloadOptions,
    info: &ContentInfo,
) -> Result<(Vec<ChunkRange>, Option<u64>), DownloadError> {
    match info.full_length {
        Some(total) if total > 0 => {
            let (mut resolved, _) = opts.range.to_absolute(total)?;
            if opts.min_byte.is_some() || opts.max_byte.is_some() {
                let bound = ResolvedRange::new(
                    opts.min_byte.unwrap_or(0),
                    opts.max_byte.map(|m| m.min(total - 1)).unwrap_or(total - 1),
                );
                resolved = resolved.intersect(&bound)?;
            }
            let expected = resolved.len();

            let multi = opts.chunks > 1 && info.accepts_ranges && info.reliable_length;
            if multi {
                let parts = range::partition(resolved, opts.chunks)
                    .into_iter()
                    .map(ChunkRange::Bounded)
                    .collect();
                Ok((parts, Some(expected)))
            } else {
                Ok((vec![ChunkRange::Bounded(resolved)], Some(expected)))
            }
        }
        _ => {
            // Unknown length: a single open-ended stream. An explicit
            // absolute range is still attempted; the server's answer
            // settles whether it holds.
            let plan = match opts.range {
                ByteRange::Absolute {
                    start,
                    end: Some(end),
                } => ChunkRange::Bounded(ResolvedRange::new(start.unwrap_or(0), end)),
                ByteRange::Absolute {
                    start: Some(start),
                    end: None,
                } => ChunkRange::ToEnd { start },
                _ => ChunkRange::ToEnd { start: 0 },
            };
            Ok((vec![plan], None))
        }
    }
}

/// Materializes the chunk records, applying the crash-recovery fast path
/// when leftover final-temp bytes were kept.
async fn build_chunks(
    shared: &Arc<EngineShared>,
    chunk_ranges: &[ChunkRange],
    temp_dir: &Path,
    basename: &str,
    final_temp: &Path,
    single: bool,
    recovered_bytes: u64,
) -> Result<Vec<Arc<Chunk>>, DownloadError> {
    let recovery = if !single && recovered_bytes > 0 {
        let expected: Vec<u64> = chunk_ranges
            .iter()
            .map(|r| r.expected_len().unwrap_or(0))
            .collect();
        let plan = coordinator::reconcile(&expected, recovered_bytes);
        tracing::info!(
            bytes = recovered_bytes,
            merged_chunks = plan.fully_merged,
            partial = plan.partial_bytes,
            "crash recovery: resuming from the final-temp file"
        );
        Some(plan)
    } else {
        None
    };

    let mut chunks = Vec::with_capacity(chunk_ranges.len());
    for (index, chunk_range) in chunk_ranges.iter().enumerate() {
        let part_path = if single {
            // Single-stream mode writes the final-temp file directly.
            final_temp.to_path_buf()
        } else {
            Chunk::part_path_for(temp_dir, basename, index)
        };
        shared.part_paths.lock().unwrap().push(part_path.clone());

        let mut chunk = Chunk::new(index, *chunk_range, part_path);
        if let Some(plan) = recovery {
            if index < plan.fully_merged {
                chunk.set_state(ChunkState::Merged);
                chunk
                    .bytes_written
                    .store(chunk_range.expected_len().unwrap_or(0), Ordering::Relaxed);
                // Its payload already lives in the final-temp file.
                tokio::fs::remove_file(&chunk.part_path).await.ok();
            } else if index == plan.fully_merged && plan.partial_bytes > 0 {
                chunk.merged_prefix = plan.partial_bytes;
                chunk.bytes_written.store(plan.partial_bytes, Ordering::Relaxed);
                // A stale part file starts at the original chunk offset,
                // which no longer lines up with the merged prefix.
                tokio::fs::remove_file(&chunk.part_path).await.ok();
            }
        }
        chunks.push(Arc::new(chunk));
    }
    Ok(chunks)
}

/// True when chunk 0 might still resolve a range-ignoring server by
/// delivering the full body.
fn single_may_rescue(chunks: &[Arc<Chunk>], failed_index: usize) -> bool {
    failed_index != 0
        && chunks
            .first()
            .map(|c| !matches!(c.state(), ChunkState::Failed))
            .unwrap_or(false)
}

/// Promotes a full-body part file to the final-temp artifact.
async fn adopt_full_body(
    shared: &Arc<EngineShared>,
    chunks: &[Arc<Chunk>],
    index: usize,
    bytes: u64,
    final_temp: &Path,
) -> Result<(), DownloadError> {
    for (i, chunk) in chunks.iter().enumerate() {
        if i != index && chunk.part_path != *final_temp {
            tokio::fs::remove_file(&chunk.part_path).await.ok();
        }
    }
    let part = &chunks[index].part_path;
    if part != final_temp {
        if tokio::fs::metadata(final_temp).await.is_ok() {
            tokio::fs::remove_file(final_temp).await?;
        }
        tokio::fs::rename(part, final_temp).await?;
    }
    shared.merged_bytes.store(bytes, Ordering::Release);
    *shared.expected_total.lock().unwrap() = Some(bytes);
    Ok(())
}

/// Terminal success: atomic rename, forced 1.0 progress.
async fn publish(
    shared: &Arc<EngineShared>,
    destination: &Path,
    final_temp: &Path,
    progress: &AggregateProgress,
) -> Result<PathBuf, DownloadError> {
    if tokio::fs::metadata(destination).await.is_ok() {
        tokio::fs::remove_file(destination).await?;
    }
    tokio::fs::rename(final_temp, destination).await?;
    progress.complete();
    tracing::info!(path = %destination.display(), "download published");
    Ok(destination.to_path_buf())
}

/// Failure cleanup per `delete_on_failure`: part files go, and the
/// final-temp file goes only when it holds nothing worth resuming.
async fn cleanup_after_failure(shared: &Arc<EngineShared>) {
    if !shared.options.delete_on_failure {
        return;
    }
    let final_temp = shared.final_temp.lock().unwrap().clone();
    let parts = shared.part_paths.lock().unwrap().clone();
    for part in parts {
        if Some(&part) != final_temp.as_ref() {
            tokio::fs::remove_file(&part).await.ok();
        }
    }
    if let Some(final_temp) = final_temp {
        let empty = tokio::fs::metadata(&final_temp)
            .await
            .map(|m| m.len() == 0)
            .unwrap_or(false);
        if empty {
            tokio::fs::remove_file(&final_temp).await.ok();
        }
    }
}
