//! Downpour - Resumable HTTP Download Engine
//!
//! Downpour turns a URL and a destination directory into a file on disk,
//! with the machinery real download managers carry:
//!
//! - **Probing (`probe`)**: HEAD (or headers-only GET) discovery of length,
//!   range support, and naming hints.
//! - **Range algebra (`range`)**: absolute, index-of-N, and fractional
//!   range specifications resolved to closed byte intervals.
//! - **Parallel fetching (`chunk`)**: N ranged connections, each streaming
//!   into its own part file with retries and backoff.
//! - **Merging (`coordinator`)**: strictly ordered concatenation into a
//!   final-temp file, with crash-recovery reconciliation.
//! - **Throttling (`throttle`)**: a shared token bucket capping aggregate
//!   throughput, live-adjustable.
//! - **Reporting (`progress`, `reporter`)**: coalesced, monotonic progress
//!   and aggregate speed signals.
//! - **Orchestration (`engine`)**: write modes, filename derivation,
//!   pause/cancel, atomic publish.
//! - **Hosting (`registry`)**: an executor surface for running many
//!   sessions under a parallelism bound.
//!
//! ```no_run
//! use downpour::{DownloadEngine, DownloadOptions};
//!
//! # async fn demo() -> Result<(), downpour::DownloadError> {
//! let engine = DownloadEngine::new(
//!     DownloadOptions::new("https://example.com/big.iso")
//!         .with_dst_dir("/tmp/downloads")
//!         .with_chunks(4),
//! )?;
//! engine.start();
//! let path = engine.wait().await?;
//! println!("saved to {}", path.display());
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod filename;
pub mod options;
pub mod probe;
pub mod progress;
pub mod range;
pub mod registry;
pub mod reporter;
pub mod throttle;

pub use engine::{DownloadEngine, ProgressSnapshot, SessionState};
pub use error::DownloadError;
pub use options::{DownloadOptions, Observers, WriteMode};
pub use probe::ContentInfo;
pub use range::{ByteRange, ResolvedRange};
pub use registry::{EngineRegistry, Executor};
