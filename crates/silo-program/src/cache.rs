//! Per-program scratch state: gained and removed sectors plus the contract's
//! current root list.

use std::collections::HashMap;

use bytes::Bytes;
use silo_core::{meta_root, sector_root, SectorRoot, SECTOR_SIZE};

use crate::error::ProgramError;
use crate::traits::Host;

/// The program cache.
///
/// Invariant: a root referenced by `roots` is either in `gained` or
/// physically on the host, never neither. `gained` and `removed` stay
/// disjoint, and no root appears twice in either.
pub(crate) struct ProgramCache {
    gained: HashMap<SectorRoot, Bytes>,
    removed: Vec<SectorRoot>,
    roots: Vec<SectorRoot>,
}

/// A completed write program's net effect, handed to the storage obligation.
pub(crate) struct CommitSet {
    pub(crate) removed: Vec<SectorRoot>,
    pub(crate) gained: Vec<SectorRoot>,
    pub(crate) gained_data: Vec<Bytes>,
}

impl ProgramCache {
    pub(crate) fn new(roots: Vec<SectorRoot>) -> Self {
        Self {
            gained: HashMap::new(),
            removed: Vec::new(),
            roots,
        }
    }

    /// Contract size implied by the current root list.
    pub(crate) fn contract_size(&self) -> u64 {
        self.roots.len() as u64 * SECTOR_SIZE
    }

    /// Merkle root over the current root list.
    pub(crate) fn merkle_root(&self) -> SectorRoot {
        meta_root(&self.roots)
    }

    /// Append a sector, returning the contract's new Merkle root.
    pub(crate) fn append_sector(&mut self, data: Bytes) -> SectorRoot {
        let new_root = sector_root(&data);
        self.gained.insert(new_root, data);
        self.roots.push(new_root);
        self.merkle_root()
    }

    /// Truncate the last `count` roots, returning the new Merkle root.
    ///
    /// A dropped root that was gained by this program nets to zero; anything
    /// else is recorded for deletion at commit.
    pub(crate) fn drop_sectors(&mut self, count: u64) -> Result<SectorRoot, ProgramError> {
        let held = self.roots.len() as u64;
        if count > held {
            return Err(ProgramError::DropTooLarge {
                requested: count,
                held,
            });
        }
        let keep = (held - count) as usize;
        for dropped in self.roots.split_off(keep) {
            if self.gained.remove(&dropped).is_none() && !self.removed.contains(&dropped) {
                self.removed.push(dropped);
            }
        }
        Ok(self.merkle_root())
    }

    /// Read a sector by root: the gained cache first, then the host.
    pub(crate) async fn read_sector(
        &self,
        host: &dyn Host,
        root: &SectorRoot,
    ) -> Result<Bytes, ProgramError> {
        if !self.roots.contains(root) {
            return Err(ProgramError::RootNotFound);
        }
        if let Some(data) = self.gained.get(root) {
            return Ok(data.clone());
        }
        host.read_sector(root).await
    }

    pub(crate) fn into_commit(self) -> CommitSet {
        let mut gained = Vec::with_capacity(self.gained.len());
        let mut gained_data = Vec::with_capacity(self.gained.len());
        for (root, data) in self.gained {
            gained.push(root);
            gained_data.push(data);
        }
        CommitSet {
            removed: self.removed,
            gained,
            gained_data,
        }
    }

    #[cfg(test)]
    pub(crate) fn gained_roots(&self) -> Vec<SectorRoot> {
        self.gained.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn removed_roots(&self) -> &[SectorRoot] {
        &self.removed
    }
}
