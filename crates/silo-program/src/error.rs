//! Error types for the program engine.

use thiserror::Error;

/// Errors for program decode, execution, and commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// The budget cannot cover the next deduction.
    #[error("program has insufficient budget to execute")]
    InsufficientBudget,

    /// The instruction specifier is not recognized.
    #[error("unknown instruction specifier: {0}")]
    UnknownInstruction(String),

    /// The instruction's arguments could not be decoded.
    #[error("malformed {specifier} instruction: {reason}")]
    MalformedInstruction {
        specifier: &'static str,
        reason: String,
    },

    /// A write program was submitted against an unlocked contract.
    #[error("contract must be locked for a program with one or more write instructions")]
    ContractNotLocked,

    /// The provided initial Merkle root does not match the sector roots.
    #[error("initial merkle root does not match the provided sector roots")]
    RootMismatch,

    /// A read referenced a root outside the program's current root list.
    #[error("sector root not found in the program's root list")]
    RootNotFound,

    /// A drop asked for more sectors than the contract holds.
    #[error("cannot drop {requested} sectors from a contract holding {held}")]
    DropTooLarge { requested: u64, held: u64 },

    /// Cancellation or shutdown was observed before commit.
    #[error("program was cancelled before it could commit")]
    Cancelled,

    /// The host failed to serve a sector read.
    #[error("host error: {0}")]
    Host(String),

    /// The storage obligation rejected the commit.
    #[error("commit failed: {0}")]
    Commit(String),
}
