//! Unfinished upload chunks and their health metric.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::traits::FileEntry;

/// Unique id of a file in the file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub Uuid);

impl FileId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Unique id of one chunk: the owning file plus the chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub file: FileId,
    pub index: u64,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.index)
    }
}

/// Health of a chunk with `completed` of `needed` pieces stored, `min`
/// required for reconstruction.
///
/// 0 means fully redundant, 1 means at minimum redundancy, above 1 means the
/// chunk has fallen below minimum and can no longer be rebuilt from remote
/// pieces alone. Lower is better.
#[must_use]
pub fn chunk_health(completed: u32, needed: u32, min: u32) -> f64 {
    let span = needed.saturating_sub(min).max(1);
    1.0 - (f64::from(completed) - f64::from(min)) / f64::from(span)
}

/// A chunk that needs upload or repair work.
///
/// Chunks are transient: built from file metadata, pushed on the upload
/// heap, popped into repair, and closed on completion or abort.
pub struct UnfinishedChunk {
    pub id: ChunkId,
    /// High-priority chunks outrank everything else in the heap.
    pub priority: bool,
    /// Stuck status at build time.
    pub stuck: bool,
    /// Set when this chunk was injected by the stuck-chunk loop.
    pub stuck_repair: bool,
    pub health: f64,
    pub pieces_completed: u32,
    pub pieces_needed: u32,
    pub min_pieces: u32,
    /// Bytes to reserve from the memory manager before dispatch.
    pub memory_needed: u64,
    /// The logical file handle backing this chunk.
    pub file: Arc<dyn FileEntry>,
}

impl UnfinishedChunk {
    /// Release the chunk's file handle.
    pub fn close(&self) {
        self.file.close();
    }
}

impl fmt::Debug for UnfinishedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnfinishedChunk")
            .field("id", &self.id.to_string())
            .field("priority", &self.priority)
            .field("stuck", &self.stuck)
            .field("health", &self.health)
            .field("pieces_completed", &self.pieces_completed)
            .field("pieces_needed", &self.pieces_needed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_redundancy_is_zero() {
        assert!((chunk_health(30, 30, 10) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn minimum_redundancy_is_one() {
        assert!((chunk_health(10, 30, 10) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn below_minimum_exceeds_one() {
        assert!(chunk_health(5, 30, 10) > 1.0);
        assert!(chunk_health(0, 30, 10) > chunk_health(5, 30, 10));
    }

    #[test]
    fn health_is_monotone_in_completed_pieces() {
        let mut last = f64::INFINITY;
        for completed in 0..=30 {
            let health = chunk_health(completed, 30, 10);
            assert!(health < last);
            last = health;
        }
    }

    #[test]
    fn degenerate_erasure_coding_does_not_divide_by_zero() {
        // needed == min: at capacity counts as minimum redundancy.
        assert!(chunk_health(10, 10, 10).is_finite());
        assert!((chunk_health(10, 10, 10) - 1.0).abs() < f64::EPSILON);
        assert!(chunk_health(9, 10, 10) > 1.0);
    }
}
