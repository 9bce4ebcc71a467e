//! Silo repair scheduler.
//!
//! The renter side of the stack: continuously select the worst-health file
//! chunks in a changing file system and hand them to a bounded worker pool.
//!
//! # Overview
//!
//! - **Upload heap**: a priority heap of chunks needing upload or repair,
//!   keyed on (priority, stuck, health), with exclusive membership sets and
//!   a cap on queued stuck chunks
//! - **Directory heap**: a priority heap over directories keyed on worst
//!   aggregate health, so unhealthy subtrees surface first and healthy ones
//!   are never scanned
//! - **Worker cache**: a lock-free snapshot of contractor state refreshed
//!   each pass; readers never take a lock on the hot path
//! - **Repair loops**: the main background loop that fills the heap one
//!   directory at a time and dispatches chunks to workers, plus a
//!   lower-priority loop that retries random stuck chunks
//!
//! Erasure coding, host networking, and the durable file-handle store are
//! external collaborators behind the traits in [`traits`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

mod chunk;
mod dirheap;
mod error;
mod heap;
mod scheduler;
mod traits;
mod workercache;

pub use chunk::{chunk_health, ChunkId, FileId, UnfinishedChunk};
pub use dirheap::{DirEntry, DirectoryHeap};
pub use error::RepairError;
pub use heap::UploadHeap;
pub use scheduler::{Collaborators, RepairConfig, RepairScheduler, RepairTarget};
pub use traits::{
    Allowance, ChunkRepairer, Contract, ContractUtility, DirHealth, DirPath, FileEntry, FileSet,
    Gateway, HostContractor, HostKey, MemoryManager, MemoryPriority, Piece,
};
pub use workercache::WorkerCache;
