//! Per-sector lock table with waiter-count garbage collection.
//!
//! Every operation touching a particular sector takes its per-sector lock
//! before consulting the location maps. Entries are created on first use and
//! removed when the last waiter releases, so the table only ever holds
//! actively contended sectors.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use silo_core::SectorId;

struct LockEntry {
    // Number of holders plus waiters. Incremented under the table mutex
    // before blocking on the per-sector mutex, which closes the race with
    // garbage collection.
    waiting: usize,
    mutex: Arc<Mutex<()>>,
}

/// Table of per-sector locks keyed on `SectorId`.
pub(crate) struct SectorLockTable {
    entries: Mutex<HashMap<SectorId, LockEntry>>,
}

impl SectorLockTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `id`, blocking until it is available.
    pub(crate) fn lock(&self, id: SectorId) -> SectorLockGuard<'_> {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(id).or_insert_with(|| LockEntry {
                waiting: 0,
                mutex: Arc::new(Mutex::new(())),
            });
            entry.waiting += 1;
            Arc::clone(&entry.mutex)
        };

        // Block until the sector is available.
        let guard = mutex.lock_arc();
        SectorLockGuard {
            table: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of live entries, for occupancy checks.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// RAII guard over one sector's lock.
pub(crate) struct SectorLockGuard<'a> {
    table: &'a SectorLockTable,
    id: SectorId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for SectorLockGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock();
        drop(self.guard.take());
        let collect = match entries.get_mut(&self.id) {
            Some(entry) => {
                entry.waiting -= 1;
                entry.waiting == 0
            }
            None => {
                tracing::error!(sector = %self.id, "unlock of sector that is not locked");
                false
            }
        };
        if collect {
            entries.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn id(b: u8) -> SectorId {
        SectorId::from_bytes([b; 12])
    }

    #[test]
    fn entry_is_collected_after_release() {
        let table = SectorLockTable::new();
        {
            let _guard = table.lock(id(1));
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn distinct_sectors_do_not_contend() {
        let table = SectorLockTable::new();
        let _a = table.lock(id(1));
        let _b = table.lock(id(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn same_sector_excludes_across_threads() {
        let table = Arc::new(SectorLockTable::new());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = table.lock(id(7));
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);
    }
}
