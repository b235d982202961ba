//! Chunk merging.
//!
//! The coordinator owns the ordered chunk set and the single append handle
//! to the final-temp file. A chunk is merged only when it is `Completed`
//! and every lower-indexed chunk is already `Merged`, so the destination is
//! always a clean prefix of the resource. At most one merge pass runs at a
//! time; the guard is a try-flag rather than a blocking mutex because the
//! notification path makes contention a non-event.

use crate::chunk::{Chunk, ChunkState};
use crate::error::DownloadError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct ChunkCoordinator {
    chunks: Vec<Arc<Chunk>>,
    final_temp: PathBuf,
    /// Index of the next unmerged chunk.
    cursor: AtomicUsize,
    /// Merge-in-flight flag (invariant: at most one merge per session).
    merging: AtomicBool,
    /// Session byte counter: concatenated payload currently in the
    /// final-temp file.
    merged_bytes: Arc<AtomicU64>,
}

impl ChunkCoordinator {
    /// `chunks` may arrive with a leading run already `Merged` by crash
    /// recovery; the cursor starts past it.
    pub fn new(chunks: Vec<Arc<Chunk>>, final_temp: PathBuf, merged_bytes: Arc<AtomicU64>) -> Self {
        let cursor = chunks
            .iter()
            .position(|c| c.state() != ChunkState::Merged)
            .unwrap_or(chunks.len());
        Self {
            chunks,
            final_temp,
            cursor: AtomicUsize::new(cursor),
            merging: AtomicBool::new(false),
            merged_bytes,
        }
    }

    pub fn all_merged(&self) -> bool {
        self.chunks.iter().all(|c| c.state() == ChunkState::Merged)
    }

    /// Appends every ready chunk to the final-temp file, in index order.
    ///
    /// Non-blocking with respect to other merge callers: when a pass is
    /// already in flight this returns immediately (the in-flight pass will
    /// pick up newly completed chunks on its next notification). Returns
    /// whether every chunk is merged.
    pub async fn try_merge(&self) -> Result<bool, DownloadError> {
        if self
            .merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(self.all_merged());
        }

        let result = self.merge_ready().await;
        self.merging.store(false, Ordering::Release);
        result?;
        Ok(self.all_merged())
    }

    async fn merge_ready(&self) -> Result<(), DownloadError> {
        loop {
            let cursor = self.cursor.load(Ordering::Acquire);
            if cursor >= self.chunks.len() {
                return Ok(());
            }
            let chunk = &self.chunks[cursor];
            match chunk.state() {
                ChunkState::Merged => {
                    self.cursor.store(cursor + 1, Ordering::Release);
                    continue;
                }
                ChunkState::Completed => {}
                _ => return Ok(()),
            }

            if chunk.part_path == self.final_temp {
                // Single-stream mode: the fetcher wrote the final-temp file
                // directly, so the merge is pure accounting.
                let size = tokio::fs::metadata(&self.final_temp)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                self.merged_bytes.store(size, Ordering::Release);
            } else {
                let copied = self.append_part(chunk).await?;
                self.merged_bytes.fetch_add(copied, Ordering::AcqRel);
                tokio::fs::remove_file(&chunk.part_path).await.ok();
                tracing::debug!(
                    chunk = chunk.index,
                    bytes = copied,
                    "merged part into the final-temp file"
                );
            }

            chunk.set_state(ChunkState::Merged);
            self.cursor.store(cursor + 1, Ordering::Release);
        }
    }

    /// Stream-copies one part file onto the end of the final-temp file.
    async fn append_part(&self, chunk: &Chunk) -> Result<u64, DownloadError> {
        let mut part = tokio::fs::File::open(&chunk.part_path).await?;
        let mut dest = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.final_temp)
            .await?;
        let copied = tokio::io::copy(&mut part, &mut dest).await?;
        dest.flush().await?;
        Ok(copied)
    }
}

/// Outcome of reconciling expected chunk lengths against a pre-existing
/// final-temp file of length `on_disk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Leading chunks whose payload already resides in the final-temp file.
    pub fully_merged: usize,
    /// Bytes of the first unmerged chunk already present.
    pub partial_bytes: u64,
}

/// The crash-recovery fast path: walk the expected chunk lengths until the
/// cumulative sum passes the bytes found on disk.
///
/// Callers gate this on `WriteMode::AppendOrTruncate` and
/// `on_disk <= total`; lengths must be known for every chunk.
pub fn reconcile(expected: &[u64], on_disk: u64) -> RecoveryPlan {
    let mut covered = 0u64;
    let mut fully_merged = 0usize;

    for len in expected {
        if covered + len <= on_disk {
            covered += len;
            fully_merged += 1;
        } else {
            break;
        }
    }

    RecoveryPlan {
        fully_merged,
        partial_bytes: on_disk - covered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkRange;
    use crate::range::ResolvedRange;

    #[test]
    fn reconcile_splits_on_chunk_boundaries() {
        // 300 bytes in 3 chunks, 150 on disk: chunk 0 merged, chunk 1 half
        // done, chunk 2 untouched.
        let plan = reconcile(&[100, 100, 100], 150);
        assert_eq!(
            plan,
            RecoveryPlan {
                fully_merged: 1,
                partial_bytes: 50
            }
        );
    }

    #[test]
    fn reconcile_exact_boundary_has_no_partial() {
        let plan = reconcile(&[100, 100, 100], 200);
        assert_eq!(
            plan,
            RecoveryPlan {
                fully_merged: 2,
                partial_bytes: 0
            }
        );
    }

    #[test]
    fn reconcile_complete_file_merges_everything() {
        let plan = reconcile(&[100, 100, 100], 300);
        assert_eq!(
            plan,
            RecoveryPlan {
                fully_merged: 3,
                partial_bytes: 0
            }
        );
    }

    #[test]
    fn reconcile_empty_file_merges_nothing() {
        let plan = reconcile(&[100, 100], 0);
        assert_eq!(
            plan,
            RecoveryPlan {
                fully_merged: 0,
                partial_bytes: 0
            }
        );
    }

    fn completed_chunk(index: usize, range: (u64, u64), dir: &std::path::Path, body: &[u8]) -> Arc<Chunk> {
        let part = Chunk::part_path_for(dir, "out.bin", index);
        std::fs::write(&part, body).unwrap();
        let chunk = Chunk::new(
            index,
            ChunkRange::Bounded(ResolvedRange::new(range.0, range.1)),
            part,
        );
        chunk.set_state(ChunkState::Completed);
        Arc::new(chunk)
    }

    #[tokio::test]
    async fn merge_appends_in_index_order_and_removes_parts() {
        let dir = tempfile::tempdir().unwrap();
        let final_temp = dir.path().join("out.bin.part");

        let chunks = vec![
            completed_chunk(0, (0, 4), dir.path(), b"AAAAA"),
            completed_chunk(1, (5, 9), dir.path(), b"BBBBB"),
            completed_chunk(2, (10, 14), dir.path(), b"CCCCC"),
        ];
        let parts: Vec<_> = chunks.iter().map(|c| c.part_path.clone()).collect();

        let merged_bytes = Arc::new(AtomicU64::new(0));
        let coordinator =
            ChunkCoordinator::new(chunks, final_temp.clone(), Arc::clone(&merged_bytes));

        assert!(coordinator.try_merge().await.unwrap());
        assert_eq!(std::fs::read(&final_temp).unwrap(), b"AAAAABBBBBCCCCC");
        assert_eq!(merged_bytes.load(Ordering::Relaxed), 15);
        for part in parts {
            assert!(!part.exists());
        }
    }

    #[tokio::test]
    async fn merge_stops_at_the_first_unready_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let final_temp = dir.path().join("out.bin.part");

        let first = completed_chunk(0, (0, 4), dir.path(), b"AAAAA");
        let second = completed_chunk(1, (5, 9), dir.path(), b"BBBBB");
        second.set_state(ChunkState::Running);
        let third = completed_chunk(2, (10, 14), dir.path(), b"CCCCC");

        let merged_bytes = Arc::new(AtomicU64::new(0));
        let coordinator = ChunkCoordinator::new(
            vec![Arc::clone(&first), Arc::clone(&second), Arc::clone(&third)],
            final_temp.clone(),
            Arc::clone(&merged_bytes),
        );

        // Chunk 2 is ready but blocked behind chunk 1.
        assert!(!coordinator.try_merge().await.unwrap());
        assert_eq!(std::fs::read(&final_temp).unwrap(), b"AAAAA");
        assert_eq!(first.state(), ChunkState::Merged);
        assert_eq!(third.state(), ChunkState::Completed);

        // Once chunk 1 completes, the rest flows through.
        second.set_state(ChunkState::Completed);
        assert!(coordinator.try_merge().await.unwrap());
        assert_eq!(std::fs::read(&final_temp).unwrap(), b"AAAAABBBBBCCCCC");
    }

    #[tokio::test]
    async fn recovered_prefix_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let final_temp = dir.path().join("out.bin.part");
        std::fs::write(&final_temp, b"AAAAA").unwrap();

        let recovered = completed_chunk(0, (0, 4), dir.path(), b"stale");
        recovered.set_state(ChunkState::Merged);
        let next = completed_chunk(1, (5, 9), dir.path(), b"BBBBB");

        let merged_bytes = Arc::new(AtomicU64::new(5));
        let coordinator = ChunkCoordinator::new(
            vec![recovered, next],
            final_temp.clone(),
            Arc::clone(&merged_bytes),
        );

        assert!(coordinator.try_merge().await.unwrap());
        assert_eq!(std::fs::read(&final_temp).unwrap(), b"AAAAABBBBB");
        assert_eq!(merged_bytes.load(Ordering::Relaxed), 10);
    }
}
