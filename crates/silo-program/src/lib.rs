//! Silo Merkle program engine.
//!
//! A **program** is an ordered list of sector-level instructions executed
//! against a contract's state (its ordered sector-root list and the Merkle
//! root over it). This crate implements:
//!
//! # Overview
//!
//! - **Instruction decode**: `(specifier, args)` wire pairs for `ReadSector`,
//!   `AppendSector` and `DropSectors`; unknown specifiers are rejected
//!   before any budget is spent
//! - **Cost model**: a five-field resource vector with per-field saturating
//!   budget subtraction; any underflow aborts the program
//! - **Program cache**: gained sectors are served from a write-through cache
//!   until commit; dropped sectors net out against the cache
//! - **Execution**: outputs stream in strict program order through a bounded
//!   channel; cancellation is observed between instructions
//! - **Commit**: write programs finalize by applying the removed list and
//!   gained cache to the storage obligation under its exclusive hold

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod cache;
mod cost;
mod error;
mod instruction;
mod program;
mod traits;

pub use cost::{append_sector_cost, drop_sectors_cost, init_cost, read_sector_cost, Cost};
pub use error::ProgramError;
pub use instruction::{
    WireInstruction, SPECIFIER_APPEND_SECTOR, SPECIFIER_DROP_SECTORS, SPECIFIER_READ_SECTOR,
};
pub use program::{ProgramEngine, ProgramFinalizer, ProgramOutput};
pub use traits::{Host, StorageObligation};
