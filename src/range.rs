//! Byte-range algebra for partial transfers.
//!
//! Ranges come in three specification flavors (raw offsets, index-of-N
//! partitions, fractional endpoints) plus a "full content" sentinel. All of
//! them resolve to a closed `[start, end]` interval once the total length of
//! the resource is known.

use crate::error::DownloadError;
use serde::{Deserialize, Serialize};

/// Which part of a resource to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ByteRange {
    /// The full content.
    Full,
    /// Raw byte offsets, both inclusive when present. A missing start means
    /// 0; a missing end means the last byte of the resource.
    Absolute {
        start: Option<u64>,
        end: Option<u64>,
    },
    /// The `index`-th of `total` equal slices.
    Partition { index: u32, total: u32 },
    /// Fractional endpoints in `[0, 1]`, resolved at per-mille (1/1000)
    /// granularity.
    Fractional { start: f64, end: f64 },
}

impl Default for ByteRange {
    fn default() -> Self {
        ByteRange::Full
    }
}

impl ByteRange {
    /// Validated constructor for `Absolute`. Requires `start < end` when
    /// both are given.
    pub fn absolute(start: Option<u64>, end: Option<u64>) -> Result<Self, DownloadError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(DownloadError::InvalidRange(format!(
                    "start {} must be below end {}",
                    s, e
                )));
            }
        }
        Ok(ByteRange::Absolute { start, end })
    }

    /// Validated constructor for `Partition`. Requires `index < total`.
    pub fn partition(index: u32, total: u32) -> Result<Self, DownloadError> {
        if total == 0 || index >= total {
            return Err(DownloadError::InvalidRange(format!(
                "partition index {} out of {} slices",
                index, total
            )));
        }
        Ok(ByteRange::Partition { index, total })
    }

    /// Validated constructor for `Fractional`. Requires both endpoints in
    /// `[0, 1]` with `start < end`.
    pub fn fractional(start: f64, end: f64) -> Result<Self, DownloadError> {
        if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&end) || start >= end {
            return Err(DownloadError::InvalidRange(format!(
                "fractional range {}..{} outside [0,1] or inverted",
                start, end
            )));
        }
        Ok(ByteRange::Fractional { start, end })
    }

    /// True when the range means "everything".
    pub fn is_full(&self) -> bool {
        matches!(
            self,
            ByteRange::Full
                | ByteRange::Absolute {
                    start: None,
                    end: None
                }
        )
    }

    /// Resolves the specification against a known total length, yielding the
    /// absolute interval and its byte count.
    pub fn to_absolute(&self, total: u64) -> Result<(ResolvedRange, u64), DownloadError> {
        if total == 0 {
            return Err(DownloadError::InvalidRange(
                "cannot resolve a range against a zero-length resource".into(),
            ));
        }
        let resolved = match *self {
            ByteRange::Full => ResolvedRange::new(0, total - 1),
            ByteRange::Absolute { start, end } => {
                let start = start.unwrap_or(0);
                let end = end.map(|e| e.min(total - 1)).unwrap_or(total - 1);
                if start > end {
                    return Err(DownloadError::InvalidRange(format!(
                        "start {} beyond resource end {}",
                        start, end
                    )));
                }
                ResolvedRange::new(start, end)
            }
            ByteRange::Partition { index, total: n } => {
                let n = n as u64;
                let index = index as u64;
                let slice = total / n;
                if slice == 0 {
                    return Err(DownloadError::InvalidRange(format!(
                        "cannot split {} bytes into {} slices",
                        total, n
                    )));
                }
                let start = index * slice;
                let end = if index == n - 1 {
                    total - 1
                } else {
                    (index + 1) * slice - 1
                };
                ResolvedRange::new(start, end)
            }
            ByteRange::Fractional { start, end } => {
                let unit = total / 1000;
                if unit == 0 {
                    // Sub-millesimal totals degenerate to direct proportion.
                    let s = (start * total as f64).floor() as u64;
                    let e = ((end * total as f64).ceil() as u64).min(total) - 1;
                    if s > e {
                        return Err(DownloadError::InvalidRange(format!(
                            "fractional range {}..{} collapses on {} bytes",
                            start, end, total
                        )));
                    }
                    ResolvedRange::new(s, e)
                } else {
                    let s = (start * 1000.0).round() as u64 * unit;
                    let e = (end * 1000.0).round() as u64 * unit;
                    ResolvedRange::new(s, e.min(total) - 1)
                }
            }
        };
        let length = resolved.len();
        Ok((resolved, length))
    }
}

/// A resolved, closed byte interval. Both bounds are inclusive, so the
/// length is `end - start + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the interval. A closed interval always
    /// covers at least one byte.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Intersection of two resolved ranges. Fails when they are disjoint.
    pub fn intersect(&self, other: &ResolvedRange) -> Result<ResolvedRange, DownloadError> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start > end {
            return Err(DownloadError::DisjointRanges);
        }
        Ok(ResolvedRange::new(start, end))
    }
}

/// Splits a resolved range into `n` contiguous partitions. The last slice
/// absorbs the remainder so the pieces always sum to the whole.
pub fn partition(range: ResolvedRange, n: u32) -> Vec<ResolvedRange> {
    let total = range.len();
    let n = (n as u64).clamp(1, total);
    let slice = total / n;

    let mut parts = Vec::with_capacity(n as usize);
    for i in 0..n {
        let start = range.start + i * slice;
        let end = if i == n - 1 {
            range.end
        } else {
            range.start + (i + 1) * slice - 1
        };
        parts.push(ResolvedRange::new(start, end));
    }
    parts
}
