//! External collaborators consumed by the repair scheduler.
//!
//! Everything the scheduler needs from the rest of the renter lives behind
//! these traits: the durable file store, the host contractor, the global
//! memory manager, the network gateway, and the fetch-encode-distribute
//! pipeline that actually moves chunk data.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chunk::{FileId, UnfinishedChunk};
use crate::error::RepairError;

/// Public key of a remote host, as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(pub String);

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A path within the renter's logical file system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirPath(String);

impl DirPath {
    /// The file system root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Cached health summary of one directory.
#[derive(Debug, Clone, Copy)]
pub struct DirHealth {
    /// Worst health among the directory's own files.
    pub health: f64,
    /// Worst health across the whole subtree.
    pub aggregate_health: f64,
}

/// One stored piece of an erasure-coded chunk.
#[derive(Debug, Clone)]
pub struct Piece {
    /// The host holding this piece.
    pub host: HostKey,
}

/// An open handle onto one file's metadata.
///
/// Handles are logical references managed by the [`FileSet`]; every handle
/// obtained for a chunk must be released with [`FileEntry::close`] exactly
/// once, whether the chunk repairs, aborts, or is rejected from the heap.
pub trait FileEntry: Send + Sync {
    fn id(&self) -> FileId;
    fn num_chunks(&self) -> u64;
    /// Whether the chunk at `index` is marked stuck.
    fn stuck(&self, index: u64) -> bool;
    fn num_stuck_chunks(&self) -> u64;
    fn set_stuck(&self, index: u64, stuck: bool) -> Result<(), RepairError>;
    fn set_all_stuck(&self, stuck: bool) -> Result<(), RepairError>;
    /// Worst chunk health, from the last metadata bubble.
    fn cached_health(&self) -> f64;
    /// Minimum pieces needed to reconstruct a chunk.
    fn min_pieces(&self) -> u32;
    /// Total pieces per chunk.
    fn num_pieces(&self) -> u32;
    fn piece_size(&self) -> u64;
    /// Piece sets for the chunk at `index`, one set per piece slot.
    fn pieces(&self, index: u64) -> Result<Vec<Vec<Piece>>, RepairError>;
    /// Whether the source file is readable on the local file system.
    fn on_disk(&self) -> bool;
    /// Release this logical handle.
    fn close(&self);
}

/// The renter's durable file system.
#[async_trait]
pub trait FileSet: Send + Sync {
    /// Immediate subdirectories of `dir`.
    fn subdirs(&self, dir: &DirPath) -> Vec<DirPath>;

    /// Cached health summary of `dir`.
    fn dir_health(&self, dir: &DirPath) -> DirHealth;

    /// Open a handle for every file directly inside `dir`.
    fn open_files(&self, dir: &DirPath) -> Vec<Arc<dyn FileEntry>>;

    /// Open a handle for every file that has at least one stuck chunk.
    fn files_with_stuck_chunks(&self) -> Vec<Arc<dyn FileEntry>>;

    /// Recompute `dir`'s metadata and propagate it up through its parents.
    async fn bubble(&self, dir: &DirPath);
}

/// A contract with a remote host.
#[derive(Debug, Clone)]
pub struct Contract {
    pub host: HostKey,
}

/// The renter's allowance settings, reduced to what repair needs.
#[derive(Debug, Clone, Copy)]
pub struct Allowance {
    /// Number of hosts the allowance is configured for.
    pub hosts: u64,
}

/// Utility flags of one contract.
#[derive(Debug, Clone, Copy)]
pub struct ContractUtility {
    /// Whether the contract counts toward redundancy.
    pub good_for_renew: bool,
}

/// The host contractor: the renter's view of its active contracts.
pub trait HostContractor: Send + Sync {
    fn contracts(&self) -> Vec<Contract>;
    fn allowance(&self) -> Allowance;
    fn contract_utility(&self, host: &HostKey) -> Option<ContractUtility>;
    /// Consensus block height as the contractor last saw it.
    fn block_height(&self) -> u64;
}

/// Priority of a memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPriority {
    Low,
    High,
}

/// The renter-wide memory manager.
#[async_trait]
pub trait MemoryManager: Send + Sync {
    /// Reserve `bytes`, blocking until available. Returns `false` on
    /// shutdown.
    async fn request(&self, bytes: u64, priority: MemoryPriority) -> bool;

    /// Return a previous reservation.
    fn release(&self, bytes: u64);
}

/// The network gateway, reduced to its online flag.
pub trait Gateway: Send + Sync {
    fn online(&self) -> bool;
}

/// The fetch-encode-distribute pipeline a chunk is handed to.
///
/// Implementations fetch the chunk's logical data (from disk or from the
/// network), erasure-code it, and distribute the pieces to `hosts`.
#[async_trait]
pub trait ChunkRepairer: Send + Sync {
    async fn repair_chunk(
        &self,
        chunk: &UnfinishedChunk,
        hosts: &HashSet<HostKey>,
    ) -> Result<(), RepairError>;
}
