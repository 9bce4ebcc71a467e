//! The upload heap: priority-ordered chunks with exclusive membership sets.
//!
//! A chunk id lives in at most one of three sets: the unstuck heap set, the
//! stuck heap set, or the repairing set. Push and pop maintain the sets
//! atomically under one mutex, and the number of queued stuck chunks is
//! capped so stuck retries never crowd out regular repairs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::chunk::{ChunkId, UnfinishedChunk};

/// Heap ordering wrapper. Greater entries pop first: priority chunks beat
/// everything, then the higher (worse) health wins, and stuckness breaks
/// health ties in favor of the stuck chunk.
///
/// Also used by the scheduler's transient per-directory staging heap.
pub(crate) struct ChunkEntry(pub(crate) UnfinishedChunk);

impl Ord for ChunkEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.priority, other.0.priority) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        if let Some(order) = self.0.health.partial_cmp(&other.0.health) {
            if order != Ordering::Equal {
                return order;
            }
        }
        match (self.0.stuck, other.0.stuck) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        // Deterministic tie break so ordering stays total.
        self.0.id.cmp(&other.0.id)
    }
}

impl PartialOrd for ChunkEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ChunkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChunkEntry {}

struct HeapInner {
    heap: BinaryHeap<ChunkEntry>,
    repairing: HashSet<ChunkId>,
    stuck_set: HashSet<ChunkId>,
    unstuck_set: HashSet<ChunkId>,
}

/// Priority heap of chunks to upload or repair, plus its control signals.
pub struct UploadHeap {
    inner: Mutex<HeapInner>,
    max_stuck: usize,
    /// Signaled when a new upload lands directly in the heap.
    pub new_uploads: Notify,
    /// Signaled when the stuck loop injects a chunk that needs repair.
    pub repair_needed: Notify,
}

impl UploadHeap {
    /// Create a heap that queues at most `max_stuck` stuck chunks.
    #[must_use]
    pub fn new(max_stuck: usize) -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                heap: BinaryHeap::new(),
                repairing: HashSet::new(),
                stuck_set: HashSet::new(),
                unstuck_set: HashSet::new(),
            }),
            max_stuck,
            new_uploads: Notify::new(),
            repair_needed: Notify::new(),
        }
    }

    /// Whether `id` is tracked anywhere: queued or being repaired.
    pub fn exists(&self, id: ChunkId) -> bool {
        let inner = self.inner.lock();
        inner.unstuck_set.contains(&id)
            || inner.stuck_set.contains(&id)
            || inner.repairing.contains(&id)
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued stuck chunks.
    pub fn stuck_len(&self) -> usize {
        self.inner.lock().stuck_set.len()
    }

    /// Try to queue a chunk.
    ///
    /// Rejected if the id is already tracked anywhere, or if the chunk is
    /// stuck and the stuck cap is reached. The caller keeps ownership of a
    /// rejected chunk and must close it.
    pub fn push(&self, chunk: UnfinishedChunk) -> Result<(), UnfinishedChunk> {
        let mut inner = self.inner.lock();
        let id = chunk.id;
        let tracked = inner.unstuck_set.contains(&id)
            || inner.stuck_set.contains(&id)
            || inner.repairing.contains(&id);
        if tracked {
            return Err(chunk);
        }
        if chunk.stuck {
            if inner.stuck_set.len() >= self.max_stuck {
                return Err(chunk);
            }
            inner.stuck_set.insert(id);
        } else {
            inner.unstuck_set.insert(id);
        }
        inner.heap.push(ChunkEntry(chunk));
        Ok(())
    }

    /// Pop the worst chunk, transferring its id to the repairing set.
    pub fn pop(&self) -> Option<UnfinishedChunk> {
        let mut inner = self.inner.lock();
        let ChunkEntry(chunk) = inner.heap.pop()?;
        inner.unstuck_set.remove(&chunk.id);
        inner.stuck_set.remove(&chunk.id);
        let fresh = inner.repairing.insert(chunk.id);
        if !fresh {
            tracing::error!(chunk = %chunk.id, "popped chunk was already being repaired");
            debug_assert!(fresh, "popped chunk already in the repairing set");
        }
        Some(chunk)
    }

    /// Mark a popped chunk's repair finished.
    ///
    /// Calling this for a chunk that is not in the repairing set is a
    /// programmer bug, not a runtime condition.
    pub fn mark_repair_done(&self, id: ChunkId) {
        let removed = self.inner.lock().repairing.remove(&id);
        if !removed {
            tracing::error!(chunk = %id, "chunk was not in the repairing set");
            debug_assert!(removed, "mark_repair_done for an untracked chunk");
        }
    }

    /// Drop every queued chunk, closing their file handles. Chunks already
    /// out for repair are unaffected.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for ChunkEntry(chunk) in inner.heap.drain() {
            chunk.close();
        }
        inner.stuck_set.clear();
        inner.unstuck_set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{FileId, UnfinishedChunk};
    use crate::traits::FileEntry;
    use crate::RepairError;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingEntry {
        closes: AtomicU64,
    }

    impl FileEntry for CountingEntry {
        fn id(&self) -> FileId {
            FileId(uuid::Uuid::nil())
        }
        fn num_chunks(&self) -> u64 {
            1
        }
        fn stuck(&self, _index: u64) -> bool {
            false
        }
        fn num_stuck_chunks(&self) -> u64 {
            0
        }
        fn set_stuck(&self, _index: u64, _stuck: bool) -> Result<(), RepairError> {
            Ok(())
        }
        fn set_all_stuck(&self, _stuck: bool) -> Result<(), RepairError> {
            Ok(())
        }
        fn cached_health(&self) -> f64 {
            0.0
        }
        fn min_pieces(&self) -> u32 {
            1
        }
        fn num_pieces(&self) -> u32 {
            2
        }
        fn piece_size(&self) -> u64 {
            0
        }
        fn pieces(&self, _index: u64) -> Result<Vec<Vec<crate::Piece>>, RepairError> {
            Ok(vec![Vec::new(), Vec::new()])
        }
        fn on_disk(&self) -> bool {
            true
        }
        fn close(&self) {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn chunk_on(
        entry: &Arc<CountingEntry>,
        name: u128,
        priority: bool,
        stuck: bool,
        health: f64,
    ) -> UnfinishedChunk {
        UnfinishedChunk {
            id: ChunkId {
                file: FileId(uuid::Uuid::from_u128(name)),
                index: 0,
            },
            priority,
            stuck,
            stuck_repair: false,
            health,
            pieces_completed: 0,
            pieces_needed: 2,
            min_pieces: 1,
            memory_needed: 0,
            file: Arc::clone(entry) as Arc<dyn FileEntry>,
        }
    }

    fn chunk(name: u128, priority: bool, stuck: bool, health: f64) -> UnfinishedChunk {
        chunk_on(&Arc::new(CountingEntry::default()), name, priority, stuck, health)
    }

    fn pop_names(heap: &UploadHeap, n: usize) -> Vec<u128> {
        (0..n)
            .map(|_| heap.pop().expect("heap entry").id.file.0.as_u128())
            .collect()
    }

    #[test]
    fn priority_outranks_health() {
        // A{0.8}, B{0.6}, C{priority, 0.1} pops as C, A, B.
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, false, 0.8)).unwrap();
        heap.push(chunk(2, false, false, 0.6)).unwrap();
        heap.push(chunk(3, true, false, 0.1)).unwrap();
        assert_eq!(pop_names(&heap, 3), vec![3, 1, 2]);
    }

    #[test]
    fn worse_health_outranks_stuckness() {
        // S1{stuck, 0.3}, U1{0.9}: stuckness only breaks health ties, so the
        // unstuck chunk with worse health pops first.
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, true, 0.3)).unwrap();
        heap.push(chunk(2, false, false, 0.9)).unwrap();
        assert_eq!(pop_names(&heap, 2), vec![2, 1]);
    }

    #[test]
    fn stuck_chunks_rank_among_themselves_by_health() {
        // S1{stuck, 0.5}, S2{stuck, 0.7}, U1{0.4} pops as S2, S1, U1.
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, true, 0.5)).unwrap();
        heap.push(chunk(2, false, true, 0.7)).unwrap();
        heap.push(chunk(3, false, false, 0.4)).unwrap();
        assert_eq!(pop_names(&heap, 3), vec![2, 1, 3]);
    }

    #[test]
    fn equal_health_prefers_the_stuck_chunk() {
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, false, 0.5)).unwrap();
        heap.push(chunk(2, false, true, 0.5)).unwrap();
        assert_eq!(pop_names(&heap, 2), vec![2, 1]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, false, 0.5)).unwrap();
        assert!(heap.push(chunk(1, false, false, 0.9)).is_err());
        // Also rejected while the id is out for repair.
        let popped = heap.pop().unwrap();
        assert!(heap.push(chunk(1, false, false, 0.9)).is_err());
        heap.mark_repair_done(popped.id);
        // And accepted again once repair is done.
        assert!(heap.push(chunk(1, false, false, 0.9)).is_ok());
    }

    #[test]
    fn a_stuck_id_cannot_also_enter_unstuck() {
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, true, 0.5)).unwrap();
        assert!(heap.push(chunk(1, false, false, 0.5)).is_err());
        assert_eq!(heap.stuck_len(), 1);
    }

    #[test]
    fn the_stuck_cap_is_enforced() {
        let heap = UploadHeap::new(2);
        heap.push(chunk(1, false, true, 0.5)).unwrap();
        heap.push(chunk(2, false, true, 0.5)).unwrap();
        assert!(heap.push(chunk(3, false, true, 0.5)).is_err());
        // Unstuck chunks are unaffected by the cap.
        heap.push(chunk(4, false, false, 0.5)).unwrap();
        assert_eq!(heap.len(), 3);
        assert_eq!(heap.stuck_len(), 2);
    }

    #[test]
    fn pop_transfers_membership_to_repairing() {
        let heap = UploadHeap::new(10);
        heap.push(chunk(1, false, true, 0.5)).unwrap();
        let popped = heap.pop().unwrap();
        assert_eq!(heap.stuck_len(), 0);
        assert!(heap.exists(popped.id));
        heap.mark_repair_done(popped.id);
        assert!(!heap.exists(popped.id));
    }

    #[test]
    fn reset_closes_queued_chunks() {
        let heap = UploadHeap::new(10);
        let entry = Arc::new(CountingEntry::default());
        heap.push(chunk_on(&entry, 1, false, false, 0.5)).unwrap();
        heap.push(chunk_on(&entry, 2, false, false, 0.6)).unwrap();

        heap.reset();
        assert!(heap.is_empty());
        assert!(!heap.exists(ChunkId {
            file: FileId(uuid::Uuid::from_u128(1)),
            index: 0
        }));
        assert_eq!(entry.closes.load(AtomicOrdering::SeqCst), 2);
    }
}
