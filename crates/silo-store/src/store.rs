//! The sector store: content-addressed placement with virtual refcounting.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use silo_core::{sector_root, SectorId, SectorRoot, SectorSalt, StopListener, SECTOR_SIZE};

use crate::error::StoreError;
use crate::folder::{FolderStats, StorageFolder};
use crate::lock::SectorLockTable;
use crate::wal::{Wal, WalRecord};

/// Cap on the number of virtual sectors sharing one physical sector.
///
/// The on-disk refcount is a u16, so the last representable count is
/// `MAX_VIRTUAL_SECTORS - 1`; an add that would reach the cap fails with
/// [`StoreError::VirtualSectorLimit`]. Proper use by a renter should never
/// put more than a handful of virtual sectors on any physical one.
pub const MAX_VIRTUAL_SECTORS: u64 = 1 << 16;

const SETTINGS_FILE: &str = "silo-store.json";
const WAL_FILE: &str = "wal.log";

/// Tunables for the sector store.
#[derive(Debug, Clone)]
pub struct SectorStoreConfig {
    /// Journaled records applied between checkpoints. A checkpoint flushes
    /// every folder metadata file and truncates the journal.
    pub wal_checkpoint_records: usize,
}

impl Default for SectorStoreConfig {
    fn default() -> Self {
        Self {
            wal_checkpoint_records: 512,
        }
    }
}

/// Where a physical sector lives.
#[derive(Debug, Clone)]
struct SectorLocation {
    /// Index of the storage folder holding the sector.
    folder: u16,
    /// Slot within that folder.
    slot: u32,
    /// Number of virtual sectors represented by this physical sector.
    count: u64,
    /// Sub-sector views carved out of this sector.
    children: HashSet<SectorId>,
}

/// A byte-range view into a parent sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubSectorLocation {
    parent: SectorId,
    offset: u32,
    length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FolderSettings {
    index: u16,
    path: PathBuf,
    capacity: u32,
}

#[derive(Serialize, Deserialize)]
struct StoreSettings {
    salt: SectorSalt,
    folders: Vec<FolderSettings>,
}

/// Content-addressed store of fixed-size sectors across storage folders.
///
/// Concurrency model: every operation takes the per-sector lock for the id
/// it touches, then consults the location maps under the store state mutex,
/// releasing it before any disk I/O. Folder health counters are lock-free.
pub struct SectorStore {
    root: PathBuf,
    salt: SectorSalt,
    config: SectorStoreConfig,
    stop: StopListener,
    locks: SectorLockTable,
    state: Mutex<StoreState>,
}

struct StoreState {
    folders: HashMap<u16, Arc<StorageFolder>>,
    sectors: HashMap<SectorId, SectorLocation>,
    sub_sectors: HashMap<SectorId, Vec<SubSectorLocation>>,
    wal: Wal,
    records_since_checkpoint: usize,
}

impl SectorStore {
    /// Open (or initialize) a store rooted at `root`.
    pub fn open(root: &Path, stop: StopListener) -> Result<Self, StoreError> {
        Self::open_with_config(root, stop, SectorStoreConfig::default())
    }

    /// Open (or initialize) a store with explicit tunables.
    pub fn open_with_config(
        root: &Path,
        stop: StopListener,
        config: SectorStoreConfig,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|err| StoreError::Settings(err.to_string()))?;

        let settings_path = root.join(SETTINGS_FILE);
        let mut settings = if settings_path.exists() {
            let raw = std::fs::read(&settings_path)
                .map_err(|err| StoreError::Settings(err.to_string()))?;
            serde_json::from_slice(&raw).map_err(|err| StoreError::Settings(err.to_string()))?
        } else {
            let fresh = StoreSettings {
                salt: SectorSalt::generate(),
                folders: Vec::new(),
            };
            write_settings(&settings_path, &fresh)?;
            fresh
        };

        let mut folders = HashMap::new();
        for entry in &settings.folders {
            match StorageFolder::open(entry.index, &entry.path, entry.capacity) {
                Ok(folder) => {
                    folders.insert(entry.index, Arc::new(folder));
                }
                Err(err) => {
                    // Sectors on this folder will read as NotFound until an
                    // operator intervenes; other folders are unaffected.
                    tracing::error!(
                        folder = entry.index,
                        path = %entry.path.display(),
                        error = %err,
                        "unable to open storage folder"
                    );
                }
            }
        }

        let mut sectors: HashMap<SectorId, SectorLocation> = HashMap::new();
        for folder in folders.values() {
            match folder.load_metadata() {
                Ok(entries) => {
                    for (slot, id, count) in entries {
                        if sectors.contains_key(&id) {
                            tracing::error!(
                                sector = %id,
                                folder = folder.index,
                                "duplicate sector id across folders, keeping the first"
                            );
                            continue;
                        }
                        folder.mark_slot_used(slot);
                        sectors.insert(
                            id,
                            SectorLocation {
                                folder: folder.index,
                                slot,
                                count: u64::from(count),
                                children: HashSet::new(),
                            },
                        );
                    }
                }
                Err(err) => {
                    folder.unavailable.store(true, Ordering::Relaxed);
                    folder.failed_reads.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        folder = folder.index,
                        error = %err,
                        "unable to load folder metadata, marking folder unavailable"
                    );
                }
            }
        }

        let wal_path = root.join(WAL_FILE);
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut state = StoreState {
            folders,
            sectors,
            sub_sectors: HashMap::new(),
            wal,
            records_since_checkpoint: 0,
        };
        for record in records {
            state.apply_replayed(record, &mut settings);
        }
        state.checkpoint()?;
        write_settings(&settings_path, &settings)?;

        Ok(Self {
            root: root.to_path_buf(),
            salt: settings.salt,
            config,
            stop,
            locks: SectorLockTable::new(),
            state: Mutex::new(state),
        })
    }

    /// Register a new storage folder with `capacity` sector slots.
    pub fn add_storage_folder(&self, path: &Path, capacity: u32) -> Result<u16, StoreError> {
        self.check_stopped()?;
        if capacity == 0 {
            return Err(StoreError::Settings(
                "storage folder capacity must be at least one sector".into(),
            ));
        }

        let mut state = self.state.lock();
        let index = match state.folders.keys().max() {
            Some(&max) if max == u16::MAX => {
                return Err(StoreError::Settings("storage folder index space exhausted".into()))
            }
            Some(&max) => max + 1,
            None => 0,
        };
        state.journal(WalRecord::AddFolder {
            index,
            path: path.to_path_buf(),
            capacity,
        })?;
        let folder = StorageFolder::create(index, path, capacity)
            .map_err(|source| StoreError::DiskTrouble { folder: index, source })?;
        state.folders.insert(index, Arc::new(folder));

        let settings = StoreSettings {
            salt: self.salt,
            folders: state.folder_settings(),
        };
        write_settings(&self.root.join(SETTINGS_FILE), &settings)?;
        tracing::info!(folder = index, path = %path.display(), capacity, "registered storage folder");
        Ok(index)
    }

    /// Add a sector, or bump its virtual refcount if the content is already
    /// stored.
    pub fn add_sector(&self, root: &SectorRoot, data: &[u8]) -> Result<(), StoreError> {
        self.check_stopped()?;
        if data.len() as u64 != SECTOR_SIZE {
            return Err(StoreError::BadPayloadSize { len: data.len() });
        }
        let id = self.salt.sector_id(root);
        let _lock = self.locks.lock(id);

        // Virtual add: the physical sector already exists.
        {
            let mut state = self.state.lock();
            if state.sub_sectors.contains_key(&id) && !state.sectors.contains_key(&id) {
                tracing::error!(sector = %id, "sector id is already tracked as a sub-sector view");
                return Err(StoreError::Corruption {
                    reason: format!("sector id {id} is already a sub-sector view"),
                });
            }
            if let Some((folder, slot, count)) = state
                .sectors
                .get(&id)
                .map(|loc| (loc.folder, loc.slot, loc.count))
            {
                let new_count = count + 1;
                if new_count >= MAX_VIRTUAL_SECTORS {
                    return Err(StoreError::VirtualSectorLimit {
                        max: MAX_VIRTUAL_SECTORS,
                    });
                }
                state.journal_meta(
                    WalRecord::Set {
                        id,
                        folder,
                        slot,
                        count: new_count as u16,
                    },
                    WalRecord::Set {
                        id,
                        folder,
                        slot,
                        count: count as u16,
                    },
                )?;
                if let Some(loc) = state.sectors.get_mut(&id) {
                    loc.count = new_count;
                }
                state.maybe_checkpoint(self.config.wal_checkpoint_records);
                return Ok(());
            }
        }

        // Physical add: place the payload on a folder with free capacity.
        let mut excluded: HashSet<u16> = HashSet::new();
        let mut last_failure: Option<(u16, std::io::Error)> = None;
        loop {
            let picked = {
                let state = self.state.lock();
                state.pick_folder(&excluded)
            };
            let Some((folder, slot)) = picked else { break };

            match folder.write_sector(slot, data) {
                Ok(()) => {
                    folder.successful_writes.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.state.lock();
                    if let Err(err) = state.journal_meta(
                        WalRecord::Set {
                            id,
                            folder: folder.index,
                            slot,
                            count: 1,
                        },
                        WalRecord::Remove {
                            id,
                            folder: folder.index,
                            slot,
                        },
                    ) {
                        folder.release_slot(slot);
                        return Err(err);
                    }
                    state.sectors.insert(
                        id,
                        SectorLocation {
                            folder: folder.index,
                            slot,
                            count: 1,
                            children: HashSet::new(),
                        },
                    );
                    state.maybe_checkpoint(self.config.wal_checkpoint_records);
                    return Ok(());
                }
                Err(source) => {
                    folder.failed_writes.fetch_add(1, Ordering::Relaxed);
                    folder.release_slot(slot);
                    tracing::warn!(
                        folder = folder.index,
                        error = %source,
                        "sector write failed, trying next folder"
                    );
                    excluded.insert(folder.index);
                    last_failure = Some((folder.index, source));
                }
            }
        }

        // Free capacity existed but every candidate failed: that is disk
        // trouble, not an out-of-space condition.
        match last_failure {
            Some((folder, source)) => Err(StoreError::DiskTrouble { folder, source }),
            None => Err(StoreError::OutOfSpace),
        }
    }

    /// Drop one virtual reference to a sector, deleting the physical sector
    /// and purging its sub-sector views when the count reaches zero.
    pub fn delete_sector(&self, root: &SectorRoot) -> Result<(), StoreError> {
        self.check_stopped()?;
        let id = self.salt.sector_id(root);
        let _lock = self.locks.lock(id);

        let mut state = self.state.lock();
        let Some((folder_index, slot, count)) = state
            .sectors
            .get(&id)
            .map(|loc| (loc.folder, loc.slot, loc.count))
        else {
            return Err(StoreError::NotFound);
        };

        if count > 1 {
            let new_count = count - 1;
            state.journal_meta(
                WalRecord::Set {
                    id,
                    folder: folder_index,
                    slot,
                    count: new_count as u16,
                },
                WalRecord::Set {
                    id,
                    folder: folder_index,
                    slot,
                    count: count as u16,
                },
            )?;
            if let Some(loc) = state.sectors.get_mut(&id) {
                loc.count = new_count;
            }
        } else {
            state.journal_meta(
                WalRecord::Remove {
                    id,
                    folder: folder_index,
                    slot,
                },
                WalRecord::Set {
                    id,
                    folder: folder_index,
                    slot,
                    count: 1,
                },
            )?;
            state.remove_sector(id);
        }
        state.maybe_checkpoint(self.config.wal_checkpoint_records);
        Ok(())
    }

    /// Read a full sector, resolving sub-sector ids through their parent.
    pub fn read_sector(&self, root: &SectorRoot) -> Result<Bytes, StoreError> {
        self.check_stopped()?;
        let id = self.salt.sector_id(root);
        let _lock = self.locks.lock(id);

        let (folder, slot, offset, length) = self.resolve_read(id, 0, None)?;
        self.read_from_folder(&folder, slot, offset, length)
    }

    /// Read `length` bytes at `offset` of a sector.
    ///
    /// For a sub-sector id the offset is relative to the start of the view.
    pub fn read_partial_sector(
        &self,
        root: &SectorRoot,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError> {
        self.check_stopped()?;
        check_bounds(offset, length)?;
        let id = self.salt.sector_id(root);
        let _lock = self.locks.lock(id);

        let (folder, slot, offset, length) = self.resolve_read(id, offset, Some(length))?;
        check_bounds(offset, length)?;
        self.read_from_folder(&folder, slot, offset, length)
    }

    /// Track `[offset, offset + length)` of an existing sector as a
    /// downloadable view with its own root.
    ///
    /// The view is not a new physical sector; it is purged when the parent's
    /// last virtual reference is dropped. Views live in memory only and do
    /// not survive a restart.
    pub fn register_sub_sector(
        &self,
        parent_root: &SectorRoot,
        offset: u32,
        length: u32,
    ) -> Result<SectorRoot, StoreError> {
        self.check_stopped()?;
        check_bounds(u64::from(offset), u64::from(length))?;
        let id = self.salt.sector_id(parent_root);
        let _lock = self.locks.lock(id);

        let (folder, slot) = {
            let state = self.state.lock();
            let loc = state.sectors.get(&id).ok_or(StoreError::NotFound)?;
            (state.folder(loc.folder)?, loc.slot)
        };

        let data = self.read_from_folder(&folder, slot, u64::from(offset), u64::from(length))?;
        let child_root = sector_root(&data);
        let child_id = self.salt.sector_id(&child_root);

        let mut state = self.state.lock();
        if state.sectors.contains_key(&child_id) {
            tracing::error!(
                sector = %child_id,
                "derived sub-sector id already names a primary sector"
            );
            return Err(StoreError::Corruption {
                reason: format!("sub-sector id {child_id} already names a primary sector"),
            });
        }
        let views = state.sub_sectors.entry(child_id).or_default();
        let view = SubSectorLocation {
            parent: id,
            offset,
            length,
        };
        if !views.contains(&view) {
            views.push(view);
        }
        if let Some(parent) = state.sectors.get_mut(&id) {
            parent.children.insert(child_id);
        }
        Ok(child_root)
    }

    /// Whether the store holds a physical sector with this root.
    ///
    /// Sub-sector views do not count.
    pub fn has_sector(&self, root: &SectorRoot) -> bool {
        let id = self.salt.sector_id(root);
        self.state.lock().sectors.contains_key(&id)
    }

    /// Current virtual refcount of a sector, if stored.
    pub fn virtual_sector_count(&self, root: &SectorRoot) -> Option<u64> {
        let id = self.salt.sector_id(root);
        self.state.lock().sectors.get(&id).map(|loc| loc.count)
    }

    /// Snapshot of every registered folder's state, sorted by index.
    pub fn folder_stats(&self) -> Vec<FolderStats> {
        let state = self.state.lock();
        let mut stats: Vec<_> = state.folders.values().map(|f| f.stats()).collect();
        stats.sort_by_key(|s| s.index);
        stats
    }

    fn check_stopped(&self) -> Result<(), StoreError> {
        if self.stop.is_stopped() {
            return Err(StoreError::Stopped);
        }
        Ok(())
    }

    /// Resolve a read target under the state lock, returning the folder
    /// handle so the I/O happens with the lock released.
    ///
    /// `length` of `None` means "the whole addressable unit": the full
    /// sector for a primary id, the view's extent for a sub-sector id.
    fn resolve_read(
        &self,
        id: SectorId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(Arc<StorageFolder>, u32, u64, u64), StoreError> {
        let state = self.state.lock();
        let primary = state.sectors.get(&id);
        let views = state.sub_sectors.get(&id).and_then(|list| list.first());
        if primary.is_some() && views.is_some() {
            // Prevented at insert time; seeing it means the maps were
            // corrupted. Prefer the primary sector.
            tracing::error!(sector = %id, "sector id present in both primary and sub-sector maps");
        }

        if let Some(loc) = primary {
            let folder = state.folder(loc.folder)?;
            return Ok((folder, loc.slot, offset, length.unwrap_or(SECTOR_SIZE)));
        }
        if let Some(view) = views {
            let Some(parent) = state.sectors.get(&view.parent) else {
                tracing::error!(sector = %id, parent = %view.parent, "sub-sector view without parent");
                return Err(StoreError::NotFound);
            };
            let folder = state.folder(parent.folder)?;
            return Ok((
                folder,
                parent.slot,
                offset + u64::from(view.offset),
                length.unwrap_or(u64::from(view.length)),
            ));
        }
        Err(StoreError::NotFound)
    }

    fn read_from_folder(
        &self,
        folder: &Arc<StorageFolder>,
        slot: u32,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StoreError> {
        if !folder.is_available() {
            return Err(StoreError::NotFound);
        }
        match folder.read_partial(slot, offset, length) {
            Ok(data) => {
                folder.successful_reads.fetch_add(1, Ordering::Relaxed);
                Ok(Bytes::from(data))
            }
            Err(source) => {
                folder.failed_reads.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::DiskTrouble {
                    folder: folder.index,
                    source,
                })
            }
        }
    }
}

impl Drop for SectorStore {
    fn drop(&mut self) {
        // Flush folder metadata and truncate the journal so a clean close
        // reopens without replay work. A failure here leaves the journal
        // authoritative, which replay handles.
        let mut state = self.state.lock();
        if let Err(err) = state.checkpoint() {
            tracing::warn!(error = %err, "journal checkpoint on close failed");
        }
    }
}

impl StoreState {
    fn folder(&self, index: u16) -> Result<Arc<StorageFolder>, StoreError> {
        self.folders.get(&index).cloned().map_or_else(
            || {
                tracing::error!(folder = index, "storage folder missing despite sector metadata");
                Err(StoreError::NotFound)
            },
            Ok,
        )
    }

    fn folder_settings(&self) -> Vec<FolderSettings> {
        let mut entries: Vec<_> = self
            .folders
            .values()
            .map(|f| FolderSettings {
                index: f.index,
                path: f.path.clone(),
                capacity: f.capacity,
            })
            .collect();
        entries.sort_by_key(|f| f.index);
        entries
    }

    /// Deterministic placement: among available folders with a free slot,
    /// the one with the most free slots wins, ties breaking toward the
    /// lowest folder index; the slot is the lowest free slot.
    fn pick_folder(&self, excluded: &HashSet<u16>) -> Option<(Arc<StorageFolder>, u32)> {
        let mut best: Option<(u32, u16, &Arc<StorageFolder>)> = None;
        for (&index, folder) in &self.folders {
            if excluded.contains(&index) || !folder.is_available() {
                continue;
            }
            let free = folder.free_slots();
            if free == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_free, best_index, _)) => {
                    free > best_free || (free == best_free && index < best_index)
                }
            };
            if better {
                best = Some((free, index, folder));
            }
        }
        let (_, _, folder) = best?;
        let slot = folder.reserve_slot()?;
        Some((Arc::clone(folder), slot))
    }

    fn journal(&mut self, record: WalRecord) -> Result<(), StoreError> {
        self.wal.append(&record)?;
        self.records_since_checkpoint += 1;
        Ok(())
    }

    /// Journal a metadata mutation, then apply it to the folder metadata
    /// file. A failed apply journals the compensating record so replay
    /// restores the prior state, and surfaces `DiskTrouble`.
    fn journal_meta(&mut self, apply: WalRecord, revert: WalRecord) -> Result<(), StoreError> {
        self.journal(apply.clone())?;
        match self.apply_to_disk(&apply) {
            Ok(()) => Ok(()),
            Err((folder_index, source)) => {
                if let Err(err) = self.journal(revert) {
                    tracing::error!(
                        folder = folder_index,
                        error = %err,
                        "unable to journal compensation after failed metadata write"
                    );
                }
                Err(StoreError::DiskTrouble {
                    folder: folder_index,
                    source,
                })
            }
        }
    }

    fn apply_to_disk(&self, record: &WalRecord) -> Result<(), (u16, std::io::Error)> {
        match *record {
            WalRecord::Set {
                id,
                folder,
                slot,
                count,
            } => {
                let target = self.folders.get(&folder).ok_or_else(|| {
                    (folder, std::io::Error::other("storage folder not registered"))
                })?;
                target.write_metadata(slot, id, count).map_err(|err| {
                    target.failed_writes.fetch_add(1, Ordering::Relaxed);
                    (folder, err)
                })
            }
            WalRecord::Remove { folder, slot, .. } => {
                let target = self.folders.get(&folder).ok_or_else(|| {
                    (folder, std::io::Error::other("storage folder not registered"))
                })?;
                target.clear_metadata(slot).map_err(|err| {
                    target.failed_writes.fetch_add(1, Ordering::Relaxed);
                    (folder, err)
                })
            }
            WalRecord::AddFolder { .. } => Ok(()),
        }
    }

    /// Remove a sector entry and purge every sub-sector view that referenced
    /// it; views whose parent set becomes empty are dropped entirely.
    fn remove_sector(&mut self, id: SectorId) {
        let Some(loc) = self.sectors.remove(&id) else {
            return;
        };
        for child in &loc.children {
            if let Some(views) = self.sub_sectors.get_mut(child) {
                views.retain(|view| view.parent != id);
                if views.is_empty() {
                    self.sub_sectors.remove(child);
                }
            }
        }
        if let Some(folder) = self.folders.get(&loc.folder) {
            folder.release_slot(loc.slot);
        }
    }

    /// Apply a replayed journal record at startup. Replay is idempotent:
    /// records describe absolute states, not deltas.
    fn apply_replayed(&mut self, record: WalRecord, settings: &mut StoreSettings) {
        match record {
            WalRecord::AddFolder {
                index,
                path,
                capacity,
            } => {
                if self.folders.contains_key(&index) {
                    return;
                }
                match StorageFolder::create(index, &path, capacity) {
                    Ok(folder) => {
                        self.folders.insert(index, Arc::new(folder));
                        if !settings.folders.iter().any(|f| f.index == index) {
                            settings.folders.push(FolderSettings {
                                index,
                                path,
                                capacity,
                            });
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            folder = index,
                            error = %err,
                            "unable to recreate journaled storage folder"
                        );
                    }
                }
            }
            WalRecord::Set {
                id,
                folder,
                slot,
                count,
            } => {
                if let Err((folder, err)) = self.apply_to_disk(&WalRecord::Set {
                    id,
                    folder,
                    slot,
                    count,
                }) {
                    tracing::error!(folder, error = %err, "journal replay metadata write failed");
                }
                if let Some(target) = self.folders.get(&folder) {
                    target.mark_slot_used(slot);
                }
                // Replay runs before any sub-sector registration, so a
                // plain insert never clobbers a children set.
                self.sectors.insert(
                    id,
                    SectorLocation {
                        folder,
                        slot,
                        count: u64::from(count),
                        children: HashSet::new(),
                    },
                );
            }
            WalRecord::Remove { id, folder, slot } => {
                if let Err((folder, err)) =
                    self.apply_to_disk(&WalRecord::Remove { id, folder, slot })
                {
                    tracing::error!(folder, error = %err, "journal replay metadata clear failed");
                }
                self.remove_sector(id);
            }
        }
    }

    fn checkpoint(&mut self) -> Result<(), StoreError> {
        for folder in self.folders.values() {
            folder
                .sync_metadata()
                .map_err(|source| StoreError::DiskTrouble {
                    folder: folder.index,
                    source,
                })?;
        }
        self.wal.truncate()?;
        self.records_since_checkpoint = 0;
        Ok(())
    }

    fn maybe_checkpoint(&mut self, limit: usize) {
        if self.records_since_checkpoint < limit {
            return;
        }
        if let Err(err) = self.checkpoint() {
            // The journal stays authoritative until a later checkpoint lands.
            tracing::warn!(error = %err, "journal checkpoint failed");
        }
    }
}

fn check_bounds(offset: u64, length: u64) -> Result<(), StoreError> {
    let ok = offset
        .checked_add(length)
        .is_some_and(|end| end <= SECTOR_SIZE);
    if ok {
        Ok(())
    } else {
        Err(StoreError::OutOfBounds { offset, length })
    }
}

fn write_settings(path: &Path, settings: &StoreSettings) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(settings)
        .map_err(|err| StoreError::Settings(err.to_string()))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(|err| StoreError::Settings(err.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|err| StoreError::Settings(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::StopSignal;

    fn sector(byte: u8) -> (SectorRoot, Vec<u8>) {
        let data = vec![byte; SECTOR_SIZE as usize];
        (sector_root(&data), data)
    }

    fn new_store(dir: &Path) -> (StopSignal, SectorStore) {
        let signal = StopSignal::new();
        let store = SectorStore::open(&dir.join("store"), signal.listener()).unwrap();
        (signal, store)
    }

    #[test]
    fn add_without_folders_is_out_of_space() {
        let dir = tempfile::tempdir().unwrap();
        let (_signal, store) = new_store(dir.path());
        let (root, data) = sector(1);
        assert!(matches!(
            store.add_sector(&root, &data),
            Err(StoreError::OutOfSpace)
        ));
    }

    #[test]
    fn wrong_payload_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_signal, store) = new_store(dir.path());
        let root = sector_root(b"short");
        assert!(matches!(
            store.add_sector(&root, b"short"),
            Err(StoreError::BadPayloadSize { len: 5 })
        ));
    }

    #[test]
    fn placement_prefers_the_emptier_folder() {
        let dir = tempfile::tempdir().unwrap();
        let (_signal, store) = new_store(dir.path());
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();
        store.add_storage_folder(&dir.path().join("b"), 2).unwrap();

        let (root, data) = sector(1);
        store.add_sector(&root, &data).unwrap();

        let stats = store.folder_stats();
        assert_eq!(stats[0].used, 1, "folder 0 has more free slots");
        assert_eq!(stats[1].used, 0);
    }

    #[test]
    fn placement_ties_break_to_the_lowest_index() {
        let dir = tempfile::tempdir().unwrap();
        let (_signal, store) = new_store(dir.path());
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();
        store.add_storage_folder(&dir.path().join("b"), 2).unwrap();

        let (root, data) = sector(1);
        store.add_sector(&root, &data).unwrap();
        let stats = store.folder_stats();
        assert_eq!((stats[0].used, stats[1].used), (1, 0));

        // Folder 1 is now the emptier one.
        let (root2, data2) = sector(2);
        store.add_sector(&root2, &data2).unwrap();
        let stats = store.folder_stats();
        assert_eq!((stats[0].used, stats[1].used), (1, 1));
    }

    #[test]
    fn stopped_store_refuses_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (signal, store) = new_store(dir.path());
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();
        signal.stop();

        let (root, data) = sector(1);
        assert!(matches!(
            store.add_sector(&root, &data),
            Err(StoreError::Stopped)
        ));
    }

    #[test]
    fn out_of_bounds_reads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_signal, store) = new_store(dir.path());
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();
        let (root, data) = sector(3);
        store.add_sector(&root, &data).unwrap();

        assert!(matches!(
            store.read_partial_sector(&root, SECTOR_SIZE - 2, 4),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            store.read_partial_sector(&root, u64::MAX, 1),
            Err(StoreError::OutOfBounds { .. })
        ));
    }
}
