//! Silo Core - shared primitives for the Silo storage stack.
//!
//! This crate provides the foundational types used by both sides of the
//! protocol:
//!
//! - **Sector primitives**: `SectorRoot` (content root of a 4 MiB sector),
//!   `SectorId` (salted, truncated on-disk identifier) and `SectorSalt`.
//! - **Meta roots**: the deterministic Merkle root over a contract's ordered
//!   sector-root list.
//! - **Shutdown**: a `watch`-based broadcast stop signal shared by every
//!   background loop in the stack.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod merkle;
mod sector;
mod stop;

pub use merkle::meta_root;
pub use sector::{sector_root, SectorId, SectorRoot, SectorSalt, SECTOR_SIZE};
pub use stop::{StopListener, StopSignal};
