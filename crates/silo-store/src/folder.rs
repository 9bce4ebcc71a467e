//! Storage folders: paired sector and metadata files managed as a unit.
//!
//! A folder is a fixed-capacity array of sector slots. Slot `i`'s payload
//! lives at byte `i * SECTOR_SIZE` of the sector file; its metadata record
//! lives at byte `i * 14` of the metadata file (12-byte sector id followed
//! by a little-endian u16 refcount; a zero refcount marks the slot free).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use silo_core::{SectorId, SECTOR_SIZE};

/// On-disk size of one sector metadata record.
pub(crate) const SECTOR_META_SIZE: u64 = 14;

const SECTOR_FILE: &str = "sectors.dat";
const META_FILE: &str = "meta.dat";

/// A single storage folder.
///
/// Health counters and the unavailability flag are lock-free atomics; the
/// slot bitmap is guarded by its own mutex and only touched while the store
/// state lock is held.
pub(crate) struct StorageFolder {
    pub(crate) index: u16,
    pub(crate) path: PathBuf,
    pub(crate) capacity: u32,

    sector_file: File,
    metadata_file: File,
    slots: Mutex<SlotBitmap>,

    pub(crate) unavailable: AtomicBool,
    pub(crate) successful_reads: AtomicU64,
    pub(crate) failed_reads: AtomicU64,
    pub(crate) successful_writes: AtomicU64,
    pub(crate) failed_writes: AtomicU64,
}

/// Point-in-time snapshot of a folder's state, for operators and tests.
#[derive(Debug, Clone)]
pub struct FolderStats {
    pub index: u16,
    pub path: PathBuf,
    pub capacity: u32,
    pub used: u32,
    pub unavailable: bool,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
}

impl StorageFolder {
    /// Create a fresh folder on disk with `capacity` sector slots.
    pub(crate) fn create(index: u16, path: &Path, capacity: u32) -> io::Result<Self> {
        std::fs::create_dir_all(path)?;
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(SECTOR_FILE))?;
        sector_file.set_len(u64::from(capacity) * SECTOR_SIZE)?;
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(META_FILE))?;
        metadata_file.set_len(u64::from(capacity) * SECTOR_META_SIZE)?;
        Ok(Self::assemble(index, path, capacity, sector_file, metadata_file))
    }

    /// Open an existing folder.
    pub(crate) fn open(index: u16, path: &Path, capacity: u32) -> io::Result<Self> {
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join(SECTOR_FILE))?;
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join(META_FILE))?;
        Ok(Self::assemble(index, path, capacity, sector_file, metadata_file))
    }

    fn assemble(
        index: u16,
        path: &Path,
        capacity: u32,
        sector_file: File,
        metadata_file: File,
    ) -> Self {
        Self {
            index,
            path: path.to_path_buf(),
            capacity,
            sector_file,
            metadata_file,
            slots: Mutex::new(SlotBitmap::new(capacity)),
            unavailable: AtomicBool::new(false),
            successful_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            successful_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        }
    }

    /// Read the full metadata file and return every occupied slot.
    pub(crate) fn load_metadata(&self) -> io::Result<Vec<(u32, SectorId, u16)>> {
        let mut buf = vec![0_u8; (u64::from(self.capacity) * SECTOR_META_SIZE) as usize];
        self.metadata_file.read_exact_at(&mut buf, 0)?;
        let mut entries = Vec::new();
        for slot in 0..self.capacity {
            let rec = &buf[(slot as usize) * SECTOR_META_SIZE as usize..][..SECTOR_META_SIZE as usize];
            let count = u16::from_le_bytes([rec[12], rec[13]]);
            if count == 0 {
                continue;
            }
            let mut id = [0_u8; 12];
            id.copy_from_slice(&rec[..12]);
            entries.push((slot, SectorId::from_bytes(id), count));
        }
        Ok(entries)
    }

    /// Read `length` bytes at `offset` within the sector stored in `slot`.
    ///
    /// Bounds against the sector size are the caller's responsibility.
    pub(crate) fn read_partial(&self, slot: u32, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0_u8; length as usize];
        self.sector_file
            .read_exact_at(&mut buf, u64::from(slot) * SECTOR_SIZE + offset)?;
        Ok(buf)
    }

    /// Write a full sector payload into `slot`.
    pub(crate) fn write_sector(&self, slot: u32, data: &[u8]) -> io::Result<()> {
        self.sector_file
            .write_all_at(data, u64::from(slot) * SECTOR_SIZE)?;
        self.sector_file.sync_data()
    }

    /// Write the metadata record for `slot`.
    pub(crate) fn write_metadata(&self, slot: u32, id: SectorId, count: u16) -> io::Result<()> {
        let mut rec = [0_u8; SECTOR_META_SIZE as usize];
        rec[..12].copy_from_slice(id.as_bytes());
        rec[12..].copy_from_slice(&count.to_le_bytes());
        self.metadata_file
            .write_all_at(&rec, u64::from(slot) * SECTOR_META_SIZE)
    }

    /// Zero the metadata record for `slot`, marking it free.
    pub(crate) fn clear_metadata(&self, slot: u32) -> io::Result<()> {
        let rec = [0_u8; SECTOR_META_SIZE as usize];
        self.metadata_file
            .write_all_at(&rec, u64::from(slot) * SECTOR_META_SIZE)
    }

    /// Flush the metadata file to disk.
    pub(crate) fn sync_metadata(&self) -> io::Result<()> {
        self.metadata_file.sync_data()
    }

    pub(crate) fn free_slots(&self) -> u32 {
        self.slots.lock().free()
    }

    /// Reserve the lowest free slot, if any.
    pub(crate) fn reserve_slot(&self) -> Option<u32> {
        self.slots.lock().reserve_lowest()
    }

    pub(crate) fn release_slot(&self, slot: u32) {
        self.slots.lock().release(slot);
    }

    /// Mark a slot used during startup metadata loading.
    pub(crate) fn mark_slot_used(&self, slot: u32) {
        self.slots.lock().mark_used(slot);
    }

    pub(crate) fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> FolderStats {
        let used = self.capacity - self.free_slots();
        FolderStats {
            index: self.index,
            path: self.path.clone(),
            capacity: self.capacity,
            used,
            unavailable: self.unavailable.load(Ordering::Relaxed),
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }
}

/// Slot occupancy bitmap.
struct SlotBitmap {
    words: Vec<u64>,
    capacity: u32,
    used: u32,
}

impl SlotBitmap {
    fn new(capacity: u32) -> Self {
        Self {
            words: vec![0_u64; (capacity as usize).div_ceil(64)],
            capacity,
            used: 0,
        }
    }

    fn free(&self) -> u32 {
        self.capacity - self.used
    }

    fn reserve_lowest(&mut self) -> Option<u32> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let slot = (w as u32) * 64 + bit;
            if slot >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(slot);
        }
        None
    }

    fn mark_used(&mut self, slot: u32) {
        let word = &mut self.words[(slot / 64) as usize];
        let mask = 1 << (slot % 64);
        if *word & mask == 0 {
            *word |= mask;
            self.used += 1;
        }
    }

    fn release(&mut self, slot: u32) {
        let word = &mut self.words[(slot / 64) as usize];
        let mask = 1 << (slot % 64);
        if *word & mask != 0 {
            *word &= !mask;
            self.used -= 1;
        }
    }
}
