use serde::Serialize;
use thiserror::Error;

/// Errors produced by the download engine.
///
/// Variants are cloneable and serializable so hosting applications can
/// persist or forward them; network and IO causes are carried as strings.
#[derive(Error, Debug, Clone, Serialize)]
pub enum DownloadError {
    /// A range specification that cannot be constructed or resolved.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A destination or temp path that cannot be used.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The destination file already holds data and the write mode is strict.
    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    /// The derived extension is in the session's exclusion set.
    #[error("Disallowed extension: {0}")]
    DisallowedExtension(String),

    /// Two resolved ranges share no bytes.
    #[error("Ranges do not intersect")]
    DisjointRanges,

    /// The metadata probe failed. Non-fatal: the session proceeds
    /// single-stream without range partitioning.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// The metadata probe exceeded its deadline. Non-fatal, like `Probe`.
    #[error("Probe timed out")]
    ProbeTimeout,

    /// Failure during the network request or response streaming.
    #[error("Network error: {0}")]
    Network(String),

    /// A non-success HTTP status.
    #[error("HTTP {0}")]
    Http(u16),

    /// The response disagrees with probed metadata (length mismatch,
    /// unreadable `Content-Range`, a range request answered out of place).
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Failure while writing data to the local disk.
    #[error("IO error: {0}")]
    Io(String),

    /// A single attempt exceeded its deadline.
    #[error("Attempt timed out")]
    Timeout,

    /// The transfer was stopped by the caller.
    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// True when the error consumes a retry attempt instead of failing the
    /// chunk outright. 408 and 429 are the only retriable 4xx statuses.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::Timeout => true,
            DownloadError::Http(status) => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// True when the session should terminate as `Cancelled` rather than
    /// `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout
        } else if let Some(status) = err.status() {
            DownloadError::Http(status.as_u16())
        } else {
            DownloadError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}
