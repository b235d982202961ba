//! Metadata probing.
//!
//! A probe is a metadata-only HTTP exchange: HEAD when the server allows
//! it, otherwise a GET whose body is never read. The result feeds range
//! partitioning, resume decisions, and filename derivation. Probe failures
//! are never fatal to a session; the engine degrades to a single,
//! non-resumable stream.

use crate::error::DownloadError;
use crate::filename;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Content metadata gathered by the probe. Immutable after the first
/// successful probe of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentInfo {
    /// Total resource length, when the server reported one.
    pub full_length: Option<u64>,
    /// True iff the server advertises byte-range support.
    pub accepts_ranges: bool,
    /// False when `full_length` cannot be trusted: chunked transfer,
    /// compressed content, or a value obtained from a non-HEAD exchange.
    pub reliable_length: bool,
    pub content_type: Option<String>,
    /// Filename suggested via `Content-Disposition`.
    pub filename_hint: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Issues the metadata probe.
///
/// With `supports_head` the probe is a HEAD request; a 405 answer falls
/// back to a headers-only GET exactly once. Without it the GET path is
/// taken directly.
pub async fn probe(
    client: &reqwest::Client,
    url: &url::Url,
    timeout: Option<Duration>,
    supports_head: bool,
    cancel: &CancellationToken,
) -> Result<ContentInfo, DownloadError> {
    if !supports_head {
        return headers_only_get(client, url, timeout, cancel).await;
    }

    let mut request = client.head(url.clone());
    if let Some(t) = timeout {
        request = request.timeout(t);
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        res = request.send() => res.map_err(probe_error)?,
    };

    if response.status() == StatusCode::METHOD_NOT_ALLOWED {
        tracing::warn!(url = %url, "server rejects HEAD, retrying probe with a headers-only GET");
        return headers_only_get(client, url, timeout, cancel).await;
    }
    if !response.status().is_success() {
        return Err(DownloadError::Probe(format!("HTTP {}", response.status())));
    }

    Ok(content_info_from_headers(response.headers(), true))
}

/// GET variant of the probe: the headers are read and the body is dropped
/// without being consumed.
async fn headers_only_get(
    client: &reqwest::Client,
    url: &url::Url,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ContentInfo, DownloadError> {
    let mut request = client.get(url.clone());
    if let Some(t) = timeout {
        request = request.timeout(t);
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        res = request.send() => res.map_err(probe_error)?,
    };

    if !response.status().is_success() {
        return Err(DownloadError::Probe(format!("HTTP {}", response.status())));
    }

    // Dropping the response abandons the body stream.
    Ok(content_info_from_headers(response.headers(), false))
}

fn probe_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::ProbeTimeout
    } else {
        DownloadError::Probe(err.to_string())
    }
}

/// Builds a `ContentInfo` from response headers. `from_head` marks whether
/// the headers came from a real HEAD exchange; lengths observed on any
/// other path are flagged unreliable.
pub fn content_info_from_headers(headers: &HeaderMap, from_head: bool) -> ContentInfo {
    let full_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let accepts_ranges = headers
        .get(header::ACCEPT_RANGES)
        .map(|v| v.to_str().unwrap_or("") == "bytes")
        .unwrap_or(false)
        || headers.contains_key(header::CONTENT_RANGE);

    let chunked = headers.contains_key(header::TRANSFER_ENCODING);
    let compressed = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.eq_ignore_ascii_case("identity"))
        .unwrap_or(false);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let filename_hint = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename::from_content_disposition);

    let etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let last_modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));

    ContentInfo {
        full_length,
        accepts_ranges,
        reliable_length: from_head && !chunked && !compressed,
        content_type,
        filename_hint,
        etag,
        last_modified,
    }
}

/// Parses `Content-Range: bytes a-b/total`. The total may be `*`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    Some((start, end, total))
}
