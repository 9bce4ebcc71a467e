//! Error types for the repair scheduler.

use thiserror::Error;

/// Errors for repair scheduling and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    /// The stop signal was observed.
    #[error("repair scheduler is stopped")]
    Stopped,

    /// The renter is not connected to the network.
    #[error("renter is offline")]
    Offline,

    /// The file system collaborator failed.
    #[error("file system error: {0}")]
    File(String),

    /// A chunk's memory reservation was refused.
    #[error("memory reservation denied")]
    MemoryDenied,

    /// The fetch-encode-distribute pipeline failed for a chunk.
    #[error("upload failed: {0}")]
    Upload(String),
}
