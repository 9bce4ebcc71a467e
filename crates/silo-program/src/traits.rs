//! External collaborators consumed by the program engine.

use async_trait::async_trait;
use bytes::Bytes;
use silo_core::SectorRoot;

use crate::error::ProgramError;

/// The host the engine resolves committed sectors through.
#[async_trait]
pub trait Host: Send + Sync {
    /// Read a full sector from the host's sector store.
    async fn read_sector(&self, root: &SectorRoot) -> Result<Bytes, ProgramError>;

    /// Current consensus block height.
    fn block_height(&self) -> u64;
}

/// The contract a write program commits against.
#[async_trait]
pub trait StorageObligation: Send + Sync {
    /// Whether the contract is currently held exclusively.
    fn locked(&self) -> bool;

    /// Apply a program's net effect: delete `removed` from the sector store,
    /// add each `gained` root with its payload, and persist the updated
    /// contract. Must be all-or-nothing at the contract-metadata level;
    /// partial sector-store changes are reclaimed by garbage collection.
    async fn update(
        &self,
        removed: &[SectorRoot],
        gained: &[SectorRoot],
        gained_data: &[Bytes],
    ) -> Result<(), ProgramError>;
}
