//! Error types for the sector store.

use silo_core::SECTOR_SIZE;
use thiserror::Error;

/// Errors for sector store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested sector is in neither the primary nor the sub-sector map.
    #[error("could not find the desired sector")]
    NotFound,

    /// A partial read extends past the sector boundary.
    #[error("read of {length} bytes at offset {offset} is out of bounds for a {SECTOR_SIZE} byte sector")]
    OutOfBounds { offset: u64, length: u64 },

    /// A sector payload with the wrong size was offered.
    #[error("sector payload must be exactly {SECTOR_SIZE} bytes, got {len}")]
    BadPayloadSize { len: usize },

    /// I/O failed on a folder that was deemed capable of the operation.
    #[error("disk trouble on storage folder {folder}: {source}")]
    DiskTrouble {
        folder: u16,
        #[source]
        source: std::io::Error,
    },

    /// No storage folder has a free slot.
    #[error("no storage folder has free capacity")]
    OutOfSpace,

    /// The virtual-sector refcount would exceed its cap.
    #[error("sector reached the virtual sector limit of {max}")]
    VirtualSectorLimit { max: u64 },

    /// An internal invariant was violated.
    #[error("store metadata corruption: {reason}")]
    Corruption { reason: String },

    /// The settings file could not be read or written.
    #[error("store settings error: {0}")]
    Settings(String),

    /// The write-ahead log could not be read or written.
    #[error("journal error: {source}")]
    Journal {
        #[source]
        source: std::io::Error,
    },

    /// The store observed the stop signal.
    #[error("sector store is stopped")]
    Stopped,
}
