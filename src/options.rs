//! Session configuration.
//!
//! `DownloadOptions` is a plain record covering every knob the engine
//! understands, with builder-style `with_*` methods for the common ones.
//! Observer callbacks ride along in a non-serializable `Observers` bundle.

use crate::engine::SessionState;
use crate::error::DownloadError;
use crate::probe::ContentInfo;
use crate::range::ByteRange;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default User-Agent, a browser-like string servers accept readily.
/// Hosting applications with their own builder override it via
/// `user_agent`.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Policy governing destination-file initialization when a file is already
/// present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Truncate any existing file and start over.
    Overwrite,
    /// Never touch an existing file; append `(1)`, `(2)`, ... to the stem
    /// until a free name is found.
    CreateNew,
    /// Resume a partial file when its size fits the expected total,
    /// truncate and restart otherwise.
    AppendOrTruncate,
    /// Fail with `DestinationExists` when any data is already present.
    AppendStrict,
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::AppendOrTruncate
    }
}

/// Immutable configuration for one download session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Source web URL.
    pub url: String,
    /// Target directory. Defaults to the OS Downloads folder, then the
    /// system temp directory.
    pub dst_dir: Option<PathBuf>,
    /// Scratch directory for part files. Defaults to `dst_dir`.
    pub temp_dir: Option<PathBuf>,
    /// Filename template. `*` expands to the derived name, `*.ext` keeps a
    /// literal extension, `stem.*` keeps a literal stem; empty derives
    /// fully.
    pub filename: Option<String>,
    /// Destination-file policy.
    pub write_mode: WriteMode,
    /// Per-read buffer size in bytes.
    pub buffer_size: usize,
    /// Rate cap in bytes/s; 0 means unlimited.
    pub max_bps: u64,
    /// Secondary absolute lower bound, intersected with `range`.
    pub min_byte: Option<u64>,
    /// Secondary absolute upper bound, intersected with `range`.
    pub max_byte: Option<u64>,
    /// Primary range specification.
    pub range: ByteRange,
    /// Number of parallel connections. Values above 1 enable multi-chunk
    /// mode when the server supports ranges.
    pub chunks: u32,
    /// Merge completed chunks into the destination as they finish rather
    /// than after the last one.
    pub merge_while_progress: bool,
    /// Disable HEAD probing for servers known to reject it.
    pub supports_head_request: bool,
    /// Partial data below this size is discarded instead of resumed.
    pub min_reload_size: u64,
    /// Derived extensions that fail the session.
    pub excluded_extensions: Vec<String>,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    /// Remove part files and an empty final-temp when the session fails.
    pub delete_on_failure: bool,
    /// Retry budget per chunk.
    pub attempts: u32,
    /// Extra request headers, passed through verbatim.
    pub headers: Vec<(String, String)>,
    /// User-Agent override.
    pub user_agent: Option<String>,
    /// Minimum interval between progress/speed notifications.
    pub report_interval: Duration,
    /// Observer callbacks. Not part of the serialized form.
    #[serde(skip)]
    pub observers: Observers,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            dst_dir: None,
            temp_dir: None,
            filename: None,
            write_mode: WriteMode::default(),
            buffer_size: 1024,
            max_bps: 0,
            min_byte: None,
            max_byte: None,
            range: ByteRange::Full,
            chunks: 1,
            merge_while_progress: true,
            supports_head_request: true,
            min_reload_size: 0,
            excluded_extensions: Vec::new(),
            timeout: None,
            delete_on_failure: false,
            attempts: 10,
            headers: Vec::new(),
            user_agent: None,
            report_interval: Duration::ZERO,
            observers: Observers::default(),
        }
    }
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_dst_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dst_dir = Some(dir.into());
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_filename(mut self, template: impl Into<String>) -> Self {
        self.filename = Some(template.into());
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_chunks(mut self, chunks: u32) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_max_bps(mut self, max_bps: u64) -> Self {
        self.max_bps = max_bps;
        self
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Resolves the effective destination directory: the configured one,
    /// else the OS Downloads folder, else the system temp directory.
    pub fn effective_dst_dir(&self) -> PathBuf {
        self.dst_dir.clone().unwrap_or_else(default_download_dir)
    }

    /// Scratch directory for part files, defaulting to the destination.
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.effective_dst_dir())
    }

    /// Validates everything that can be rejected synchronously, before the
    /// session ever transitions to Running.
    pub fn validate(&self) -> Result<(), DownloadError> {
        url::Url::parse(&self.url)
            .map_err(|e| DownloadError::InvalidPath(format!("invalid url {}: {}", self.url, e)))?;
        if self.chunks == 0 {
            return Err(DownloadError::InvalidRange(
                "chunk count must be at least 1".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(DownloadError::InvalidPath(
                "buffer size must be non-zero".into(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_byte, self.max_byte) {
            if min >= max {
                return Err(DownloadError::InvalidRange(format!(
                    "min_byte {} must be below max_byte {}",
                    min, max
                )));
            }
        }
        // Re-run the constructor checks in case the record was built
        // directly rather than through the validated constructors.
        match self.range {
            ByteRange::Absolute { start, end } => {
                ByteRange::absolute(start, end)?;
            }
            ByteRange::Partition { index, total } => {
                ByteRange::partition(index, total)?;
            }
            ByteRange::Fractional { start, end } => {
                ByteRange::fractional(start, end)?;
            }
            ByteRange::Full => {}
        }
        Ok(())
    }

    /// The subset handed to each chunk fetcher. Pass-through headers are
    /// not repeated here; they ride on the shared HTTP client.
    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            buffer_size: self.buffer_size,
            timeout: self.timeout,
            attempts: self.attempts,
            min_reload_size: self.min_reload_size,
        }
    }
}

/// Per-fetcher slice of the session configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub buffer_size: usize,
    pub timeout: Option<Duration>,
    pub attempts: u32,
    pub min_reload_size: u64,
}

/// Observer callbacks and external collaborators. All of them are optional;
/// dispatch is synchronous on the engine's runtime.
#[derive(Clone, Default)]
pub struct Observers {
    pub started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub info_fetched: Option<Arc<dyn Fn(&ContentInfo) + Send + Sync>>,
    pub state_changed: Option<Arc<dyn Fn(SessionState) + Send + Sync>>,
    pub completed: Option<Arc<dyn Fn(&Path) + Send + Sync>>,
    pub failed: Option<Arc<dyn Fn(&DownloadError) + Send + Sync>>,
    /// Normalized `[0, 1]` progress subscriber.
    pub progress: Option<Arc<dyn Fn(f64) + Send + Sync>>,
    /// Aggregate bytes/s subscriber.
    pub speed: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    /// External MIME-to-extension lookup.
    pub mime_lookup: Option<Arc<dyn Fn(&str) -> Option<String> + Send + Sync>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("started", &self.started.is_some())
            .field("info_fetched", &self.info_fetched.is_some())
            .field("state_changed", &self.state_changed.is_some())
            .field("completed", &self.completed.is_some())
            .field("failed", &self.failed.is_some())
            .field("progress", &self.progress.is_some())
            .field("speed", &self.speed.is_some())
            .field("mime_lookup", &self.mime_lookup.is_some())
            .finish()
    }
}

/// The OS Downloads folder when it exists, the system temp directory
/// otherwise.
pub fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let opts = DownloadOptions::default();
        assert_eq!(opts.buffer_size, 1024);
        assert_eq!(opts.chunks, 1);
        assert_eq!(opts.max_bps, 0);
        assert_eq!(opts.write_mode, WriteMode::AppendOrTruncate);
        assert!(opts.supports_head_request);
        assert!(opts.merge_while_progress);
    }

    #[test]
    fn validate_rejects_bad_input() {
        let mut opts = DownloadOptions::new("http://example.com/a.bin");
        opts.chunks = 0;
        assert!(opts.validate().is_err());

        let mut opts = DownloadOptions::new("not a url");
        opts.chunks = 4;
        assert!(opts.validate().is_err());

        let mut opts = DownloadOptions::new("http://example.com/a.bin");
        opts.min_byte = Some(100);
        opts.max_byte = Some(50);
        assert!(opts.validate().is_err());

        let mut opts = DownloadOptions::new("http://example.com/a.bin");
        opts.range = ByteRange::Fractional {
            start: 0.8,
            end: 0.2,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_plain_session() {
        let opts = DownloadOptions::new("https://example.com/file.tar.gz")
            .with_chunks(4)
            .with_max_bps(1024);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn temp_dir_defaults_to_dst_dir() {
        let opts = DownloadOptions::new("http://example.com/a").with_dst_dir("/data/downloads");
        assert_eq!(opts.effective_temp_dir(), PathBuf::from("/data/downloads"));
    }
}
