//! Silo sector store (placement, locking, refcounting).
//!
//! This crate implements the host-side storage layer:
//!
//! # Overview
//!
//! - **Storage folders**: paired sector/metadata files managed as a unit,
//!   with lock-free health counters
//! - **Sector store**: content-addressed placement of fixed 4 MiB sectors
//!   across folders, with virtual-sector refcounting and sub-sector views
//! - **Per-sector locking**: a garbage-collected lock table keyed on
//!   `SectorId`, bounding the table to actively contended sectors
//! - **Write-ahead log**: journaled metadata mutations replayed at startup
//!
//! # Design Principles
//!
//! 1. **Placement is deterministic**: given identical folder state the store
//!    always picks the same folder and slot, so behavior is testable.
//!
//! 2. **Failures stay local**: a failing folder increments its own counters
//!    and is skipped; it never cascades to other folders.
//!
//! 3. **Corruption is survivable**: invariant violations are logged and
//!    surfaced as `NotFound` for the affected key rather than poisoning the
//!    whole store.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod folder;
mod lock;
mod store;
mod wal;

pub use error::StoreError;
pub use folder::FolderStats;
pub use store::{SectorStore, SectorStoreConfig, MAX_VIRTUAL_SECTORS};
