//! Single-range fetching.
//!
//! A `ChunkFetcher` owns one byte range of the resource and one part file.
//! It issues ranged GETs, streams the body through the session's rate
//! limiter into the part file, and retries transient failures with capped
//! exponential backoff. Nothing else ever writes its part file; the
//! coordinator only flips `Completed` chunks to `Merged`.

use crate::error::DownloadError;
use crate::options::ChunkOptions;
use crate::probe;
use crate::progress::{AggregateProgress, AggregateSpeed};
use crate::range::ResolvedRange;
use crate::throttle::{RateLimiter, SpeedWindow};
use futures::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Longest backoff between retries of one chunk.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Lifecycle of one chunk.
///
/// `Idle → Running → (Completed | Paused | Failed)`, `Paused → Running`,
/// and the coordinator performs `Completed → Merged`. `Failed` and
/// `Merged` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Merged,
}

/// The span one fetcher is responsible for.
#[derive(Debug, Clone, Copy)]
pub enum ChunkRange {
    /// A known absolute interval, fetched with `Range: bytes=a-b`.
    Bounded(ResolvedRange),
    /// The whole resource when its length is unknown: fetched from `start`
    /// to end-of-stream, with a half-open range header only when resuming.
    ToEnd { start: u64 },
}

impl ChunkRange {
    /// Expected payload bytes, when knowable up front.
    pub fn expected_len(&self) -> Option<u64> {
        match self {
            ChunkRange::Bounded(range) => Some(range.len()),
            ChunkRange::ToEnd { .. } => None,
        }
    }

    pub fn start(&self) -> u64 {
        match self {
            ChunkRange::Bounded(range) => range.start,
            ChunkRange::ToEnd { start } => *start,
        }
    }
}

/// Shared per-chunk record. The owning fetcher drives every field except
/// the `Completed → Merged` transition, which belongs to the coordinator.
pub struct Chunk {
    pub index: usize,
    pub range: ChunkRange,
    /// Bytes of this chunk already sitting in the final-temp file from a
    /// previous session (crash recovery reconciliation).
    pub merged_prefix: u64,
    pub part_path: PathBuf,
    /// Payload bytes accounted for, including the merged prefix.
    pub bytes_written: AtomicU64,
    /// Executed attempts; observable by the host.
    pub attempts: AtomicU32,
    state: Mutex<ChunkState>,
    pub failure: Mutex<Option<DownloadError>>,
}

impl Chunk {
    pub fn new(index: usize, range: ChunkRange, part_path: PathBuf) -> Self {
        Self {
            index,
            range,
            merged_prefix: 0,
            part_path,
            bytes_written: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            state: Mutex::new(ChunkState::Idle),
            failure: Mutex::new(None),
        }
    }

    /// Part-file naming scheme: `<temp>/<basename>.<index+1>_chunk`.
    pub fn part_path_for(temp_dir: &Path, basename: &str, index: usize) -> PathBuf {
        temp_dir.join(format!("{}.{}_chunk", basename, index + 1))
    }

    pub fn state(&self) -> ChunkState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ChunkState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Notifications from fetchers to the engine's supervision loop.
#[derive(Debug)]
pub enum ChunkEvent {
    Completed {
        index: usize,
    },
    /// The server answered a ranged request from offset zero with a 200:
    /// the part file now holds the entire body and partitioning is
    /// abandoned.
    FullBody {
        index: usize,
        bytes: u64,
    },
    Failed {
        index: usize,
        error: DownloadError,
    },
    Cancelled {
        index: usize,
    },
}

enum AttemptOutcome {
    /// The assigned span is fully on disk.
    RangeComplete,
    /// 200 fallback: the entire body landed in the part file.
    FullBody(u64),
    /// Pause or cancel interrupted the stream; the outer loop decides.
    Interrupted,
}

/// Fetches one chunk into its part file.
pub struct ChunkFetcher {
    pub chunk: Arc<Chunk>,
    pub client: reqwest::Client,
    pub url: url::Url,
    pub opts: ChunkOptions,
    pub limiter: Option<Arc<RateLimiter>>,
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
    pub progress: Arc<AggregateProgress>,
    pub progress_slot: u64,
    pub speed: Arc<AggregateSpeed>,
    pub speed_slot: u64,
    pub events: mpsc::UnboundedSender<ChunkEvent>,
}

impl ChunkFetcher {
    /// Drives the chunk to a terminal state, honoring pause, cancel, and
    /// the retry budget.
    pub async fn run(mut self) {
        let budget = self.opts.attempts.max(1);
        let index = self.chunk.index;

        loop {
            if self.cancel.is_cancelled() {
                self.chunk.set_state(ChunkState::Paused);
                let _ = self.events.send(ChunkEvent::Cancelled { index });
                return;
            }
            if *self.pause.borrow() {
                self.chunk.set_state(ChunkState::Paused);
                let mut pause = self.pause.clone();
                tokio::select! {
                    _ = self.cancel.cancelled() => continue,
                    changed = pause.changed() => {
                        if changed.is_err() {
                            return; // session dropped
                        }
                        continue;
                    }
                }
            }

            self.chunk.set_state(ChunkState::Running);
            match self.attempt().await {
                Ok(AttemptOutcome::RangeComplete) => {
                    self.chunk.set_state(ChunkState::Completed);
                    self.progress.set(self.progress_slot, 1.0);
                    self.speed.set(self.speed_slot, 0);
                    let _ = self.events.send(ChunkEvent::Completed { index });
                    return;
                }
                Ok(AttemptOutcome::FullBody(bytes)) => {
                    self.chunk.set_state(ChunkState::Completed);
                    self.progress.set(self.progress_slot, 1.0);
                    self.speed.set(self.speed_slot, 0);
                    let _ = self.events.send(ChunkEvent::FullBody { index, bytes });
                    return;
                }
                Ok(AttemptOutcome::Interrupted) => continue,
                Err(error) if error.is_cancellation() => {
                    self.chunk.set_state(ChunkState::Paused);
                    let _ = self.events.send(ChunkEvent::Cancelled { index });
                    return;
                }
                Err(error) => {
                    let attempts = self.chunk.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    if error.is_transient() && attempts < budget {
                        tracing::warn!(
                            chunk = index,
                            attempt = attempts,
                            error = %error,
                            "transient chunk failure, backing off"
                        );
                        self.chunk.set_state(ChunkState::Idle);
                        self.backoff(attempts).await;
                        continue;
                    }
                    tracing::error!(chunk = index, error = %error, "chunk failed");
                    self.chunk.set_state(ChunkState::Failed);
                    *self.chunk.failure.lock().unwrap() = Some(error.clone());
                    let _ = self.events.send(ChunkEvent::Failed { index, error });
                    return;
                }
            }
        }
    }

    /// One HTTP attempt: resume from whatever the part file already holds,
    /// issue the ranged GET, stream the body.
    async fn attempt(&mut self) -> Result<AttemptOutcome, DownloadError> {
        // The deadline cancels this attempt even if the session token
        // never fires.
        let attempt_cancel = self.cancel.child_token();
        let _deadline = self.opts.timeout.map(|t| Deadline::arm(attempt_cancel.clone(), t));

        let mut cleared_once = false;
        loop {
            let mut on_disk = tokio::fs::metadata(&self.chunk.part_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            // A sliver of partial data is not worth a ranged round-trip.
            if on_disk > 0 && on_disk < self.opts.min_reload_size {
                tracing::debug!(
                    chunk = self.chunk.index,
                    bytes = on_disk,
                    "partial data below the reload threshold, restarting clean"
                );
                tokio::fs::remove_file(&self.chunk.part_path).await.ok();
                on_disk = 0;
            }

            let expected_on_part = self
                .chunk
                .range
                .expected_len()
                .map(|len| len - self.chunk.merged_prefix);
            if let Some(expected) = expected_on_part {
                if on_disk > expected {
                    // The leftover does not belong to this partitioning
                    // (e.g. a crash under a different chunk count).
                    tracing::warn!(
                        chunk = self.chunk.index,
                        bytes = on_disk,
                        expected,
                        "oversized part file, restarting clean"
                    );
                    tokio::fs::remove_file(&self.chunk.part_path).await.ok();
                    on_disk = 0;
                } else if on_disk == expected {
                    // Leftover from a crashed session; nothing to fetch.
                    self.account(on_disk, expected_on_part);
                    return Ok(AttemptOutcome::RangeComplete);
                }
            }

            let effective_start = self.chunk.range.start() + self.chunk.merged_prefix + on_disk;
            self.account(on_disk, expected_on_part);

            let mut request = self.client.get(self.url.clone());
            let range_requested = match self.chunk.range {
                ChunkRange::Bounded(range) => {
                    request = request.header(
                        header::RANGE,
                        format!("bytes={}-{}", effective_start, range.end),
                    );
                    true
                }
                ChunkRange::ToEnd { .. } if effective_start > 0 => {
                    request = request.header(header::RANGE, format!("bytes={}-", effective_start));
                    true
                }
                ChunkRange::ToEnd { .. } => false,
            };

            let response = tokio::select! {
                _ = attempt_cancel.cancelled() => return Err(self.interrupt_error()),
                res = request.send() => res.map_err(DownloadError::from)?,
            };

            let status = response.status();
            if status == StatusCode::PARTIAL_CONTENT {
                if let Some(value) = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                {
                    match probe::parse_content_range(value) {
                        None => {
                            return Err(DownloadError::Integrity(format!(
                                "unreadable Content-Range {:?}",
                                value
                            )))
                        }
                        Some((start, _, _)) if start != effective_start => {
                            return Err(DownloadError::Integrity(format!(
                                "asked for offset {} but got {}",
                                effective_start, start
                            )))
                        }
                        Some((_, _, total)) => {
                            // An open-ended resume learns the payload size
                            // from the 206 total.
                            if expected_on_part.is_none() {
                                if let Some(total) = total {
                                    let expected = total - self.chunk.range.start();
                                    return self
                                        .stream_body(response, on_disk, Some(expected), false, &attempt_cancel)
                                        .await;
                                }
                            }
                        }
                    }
                }
                return self
                    .stream_body(response, on_disk, expected_on_part, false, &attempt_cancel)
                    .await;
            }

            if status.is_success() {
                if range_requested && on_disk > 0 && !cleared_once {
                    // CheckClearFile: the server restarted from zero, so the
                    // partial data on disk no longer lines up. Clear it and
                    // retry once.
                    tracing::warn!(
                        chunk = self.chunk.index,
                        "server ignored the resume range, clearing partial data"
                    );
                    cleared_once = true;
                    tokio::fs::remove_file(&self.chunk.part_path).await.ok();
                    continue;
                }
                if effective_start == 0 {
                    // Full fetch accepted; the caller abandons partitioning.
                    let expected = response
                        .headers()
                        .get(header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    return self
                        .stream_body(response, 0, expected, true, &attempt_cancel)
                        .await;
                }
                return Err(DownloadError::Integrity(
                    "server ignored the range request".into(),
                ));
            }

            return Err(DownloadError::Http(status.as_u16()));
        }
    }

    /// Appends the response body to the part file, pacing through the
    /// shared limiter and feeding the progress/speed slots.
    async fn stream_body(
        &mut self,
        response: reqwest::Response,
        on_disk: u64,
        expected: Option<u64>,
        full_body: bool,
        attempt_cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, DownloadError> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.chunk.part_path)
            .await?;
        let mut writer = BufWriter::with_capacity(self.opts.buffer_size, file);

        let mut written = on_disk;
        let mut window = SpeedWindow::new();
        let mut stream = response.bytes_stream();
        let mut interrupted = false;

        loop {
            if *self.pause.borrow() {
                interrupted = true;
                break;
            }

            let item = tokio::select! {
                _ = attempt_cancel.cancelled() => {
                    // Flush what we have; the interrupt kind is resolved
                    // below.
                    writer.flush().await?;
                    return Err(self.interrupt_error());
                }
                item = stream.next() => item,
            };

            let bytes = match item {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    writer.flush().await.ok();
                    return Err(DownloadError::from(err));
                }
            };

            writer.write_all(&bytes).await?;
            let len = bytes.len() as u64;

            if let Some(limiter) = &self.limiter {
                limiter.acquire(len, &self.cancel).await;
            }

            written += len;
            self.account(written, expected);
            let bps = window.record(len);
            self.speed.set(self.speed_slot, bps);
        }

        writer.flush().await?;

        if interrupted {
            return Ok(AttemptOutcome::Interrupted);
        }

        if let Some(expected) = expected {
            if written < expected {
                // The connection closed early; the next attempt resumes
                // from the flushed size.
                return Err(DownloadError::Network(format!(
                    "connection closed at {} of {} bytes",
                    written, expected
                )));
            }
        }

        if full_body {
            Ok(AttemptOutcome::FullBody(written))
        } else {
            Ok(AttemptOutcome::RangeComplete)
        }
    }

    /// Updates the shared byte counter and the progress slot.
    fn account(&self, part_bytes: u64, expected_on_part: Option<u64>) {
        let total = self.chunk.merged_prefix + part_bytes;
        self.chunk.bytes_written.store(total, Ordering::Relaxed);

        if let Some(expected) = expected_on_part {
            let denominator = (self.chunk.merged_prefix + expected) as f64;
            if denominator > 0.0 {
                // 1.0 is reserved for the completion signal.
                let fraction = (total as f64 / denominator).min(0.999);
                self.progress.set(self.progress_slot, fraction);
            }
        }
    }

    /// A fired attempt token means either the session cancelled or the
    /// attempt deadline passed.
    fn interrupt_error(&self) -> DownloadError {
        if self.cancel.is_cancelled() {
            DownloadError::Cancelled
        } else {
            DownloadError::Timeout
        }
    }

    /// Capped exponential backoff, responsive to cancellation.
    async fn backoff(&self, attempt: u32) {
        let exp = attempt.saturating_sub(1).min(5);
        let delay = Duration::from_millis(2u64.pow(exp) * 1000).min(MAX_BACKOFF);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Aborts an attempt when its absolute deadline passes, independent of the
/// parent token. Dropping the guard disarms it.
struct Deadline {
    watchdog: tokio::task::JoinHandle<()>,
}

impl Deadline {
    fn arm(token: CancellationToken, after: Duration) -> Self {
        Self {
            watchdog: tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel();
            }),
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_uses_one_based_suffixes() {
        let path = Chunk::part_path_for(Path::new("/tmp/scratch"), "video.mp4", 0);
        assert_eq!(path, PathBuf::from("/tmp/scratch/video.mp4.1_chunk"));
        let path = Chunk::part_path_for(Path::new("/tmp/scratch"), "video.mp4", 2);
        assert_eq!(path, PathBuf::from("/tmp/scratch/video.mp4.3_chunk"));
    }

    #[test]
    fn chunk_starts_idle_with_zero_accounting() {
        let chunk = Chunk::new(
            0,
            ChunkRange::Bounded(ResolvedRange::new(0, 99)),
            PathBuf::from("/tmp/x.1_chunk"),
        );
        assert_eq!(chunk.state(), ChunkState::Idle);
        assert_eq!(chunk.bytes_written.load(Ordering::Relaxed), 0);
        assert_eq!(chunk.attempts.load(Ordering::Relaxed), 0);
        assert_eq!(chunk.range.expected_len(), Some(100));
    }

    #[test]
    fn open_ended_range_has_no_expected_length() {
        let range = ChunkRange::ToEnd { start: 0 };
        assert_eq!(range.expected_len(), None);
        assert_eq!(range.start(), 0);
    }
}
