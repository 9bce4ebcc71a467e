//! Read-mostly snapshot of contractor state.
//!
//! The scheduler consults worker availability on every chunk it dispatches.
//! Rather than hitting the contractor (and its locks) each time, a snapshot
//! is rebuilt once per pass and swapped in atomically; readers load the
//! current pointer without ever taking a lock.

use std::collections::HashSet;

use crate::traits::{Allowance, HostContractor, HostKey};

/// Snapshot of the contractor state one scheduler pass works against.
///
/// Every field is immutable because the cache is shared behind an atomic
/// pointer swap.
#[derive(Debug, Clone)]
pub struct WorkerCache {
    /// Hosts with an active contract, keyed by public key.
    pub hosts: HashSet<HostKey>,
    /// The allowance at snapshot time.
    pub allowance: Allowance,
    /// Consensus block height at snapshot time.
    pub block_height: u64,
}

impl WorkerCache {
    /// Build a fresh snapshot from the contractor.
    pub fn snapshot(contractor: &dyn HostContractor) -> Self {
        let hosts = contractor
            .contracts()
            .into_iter()
            .map(|contract| contract.host)
            .collect();
        Self {
            hosts,
            allowance: contractor.allowance(),
            block_height: contractor.block_height(),
        }
    }

    /// An empty cache for scheduler construction.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            hosts: HashSet::new(),
            allowance: Allowance { hosts: 0 },
            block_height: 0,
        }
    }

    /// Number of usable workers (one per contracted host).
    #[must_use]
    pub fn workers(&self) -> usize {
        self.hosts.len()
    }
}
