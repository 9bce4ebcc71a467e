//! Program execution: budget charging, ordered output streaming, and the
//! commit path for write programs.

use std::sync::Arc;

use bytes::Bytes;
use silo_core::{meta_root, SectorRoot, StopListener, SECTOR_SIZE};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cache::{CommitSet, ProgramCache};
use crate::cost::{init_cost, Cost};
use crate::error::ProgramError;
use crate::instruction::{Instruction, WireInstruction};
use crate::traits::{Host, StorageObligation};

/// One executed instruction's result record.
#[derive(Debug, Clone)]
pub struct ProgramOutput {
    /// The contract Merkle root after this instruction.
    pub new_merkle_root: SectorRoot,
    /// Merkle proof material for the instruction, when the caller asked the
    /// proof layer to attach one. The core engine emits no proofs itself.
    pub proof: Vec<SectorRoot>,
    /// Instruction output payload (sector data for reads, empty otherwise).
    pub output: Bytes,
    /// The error that aborted the program, on the final output only.
    pub error: Option<ProgramError>,
}

/// Executes instruction programs against contract state.
pub struct ProgramEngine {
    host: Arc<dyn Host>,
    stop: StopListener,
}

impl ProgramEngine {
    /// Create an engine resolving sector reads through `host`.
    #[must_use]
    pub fn new(host: Arc<dyn Host>, stop: StopListener) -> Self {
        Self { host, stop }
    }

    /// Decode and execute a program.
    ///
    /// Outputs stream through the returned channel in strict program order;
    /// the channel is bounded at the instruction count and closed when the
    /// program finishes or aborts. Write programs additionally return a
    /// [`ProgramFinalizer`]; a program whose contract is not locked is
    /// refused before execution.
    ///
    /// `cancel` is observed between instructions, never mid-instruction. A
    /// cancelled write program will not commit.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_program(
        &self,
        instructions: &[WireInstruction],
        program_data: Bytes,
        budget: Cost,
        obligation: Arc<dyn StorageObligation>,
        initial_merkle_root: SectorRoot,
        sector_roots: Vec<SectorRoot>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(mpsc::Receiver<ProgramOutput>, Option<ProgramFinalizer>), ProgramError> {
        // Decode everything up front; a malformed program costs nothing.
        let decoded = instructions
            .iter()
            .map(|wire| Instruction::decode(wire, &program_data))
            .collect::<Result<Vec<_>, _>>()?;

        if meta_root(&sector_roots) != initial_merkle_root {
            return Err(ProgramError::RootMismatch);
        }

        // A program with any write instruction requires the contract lock.
        let read_only = decoded.iter().all(Instruction::read_only);
        if !read_only && !obligation.locked() {
            return Err(ProgramError::ContractNotLocked);
        }

        // The init cost is charged before anything executes.
        let remaining = budget
            .checked_sub(init_cost(program_data.len() as u64))
            .ok_or(ProgramError::InsufficientBudget)?;

        let (output_tx, output_rx) = mpsc::channel(decoded.len().max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let executor = Executor {
            host: Arc::clone(&self.host),
            stop: self.stop.clone(),
            cancel,
            program_data,
            instructions: decoded,
            cache: ProgramCache::new(sector_roots),
            remaining,
            merkle_root: initial_merkle_root,
        };
        tokio::spawn(executor.run(output_tx, done_tx));

        let finalizer = if read_only {
            None
        } else {
            Some(ProgramFinalizer {
                obligation,
                done: done_rx,
            })
        };
        Ok((output_rx, finalizer))
    }
}

/// Commit handle for a write program.
///
/// Finalize only after the output channel has closed; the commit applies the
/// program's removed list and gained cache to the storage obligation under
/// its exclusive hold.
pub struct ProgramFinalizer {
    obligation: Arc<dyn StorageObligation>,
    done: oneshot::Receiver<Result<CommitSet, ProgramError>>,
}

impl ProgramFinalizer {
    /// Wait for the program to finish and commit its effects.
    ///
    /// A program that aborted (budget exhaustion, instruction error,
    /// cancellation, shutdown) surfaces that error here and commits nothing.
    pub async fn finalize(self) -> Result<(), ProgramError> {
        let commit = self
            .done
            .await
            .map_err(|_| ProgramError::Cancelled)?;
        let set = commit?;
        self.obligation
            .update(&set.removed, &set.gained, &set.gained_data)
            .await
    }
}

struct Executor {
    host: Arc<dyn Host>,
    stop: StopListener,
    cancel: watch::Receiver<bool>,
    program_data: Bytes,
    instructions: Vec<Instruction>,
    cache: ProgramCache,
    remaining: Cost,
    merkle_root: SectorRoot,
}

impl Executor {
    async fn run(
        mut self,
        outputs: mpsc::Sender<ProgramOutput>,
        done: oneshot::Sender<Result<CommitSet, ProgramError>>,
    ) {
        let mut failure: Option<ProgramError> = None;

        for instruction in std::mem::take(&mut self.instructions) {
            // Cancellation is observed between instructions only.
            if *self.cancel.borrow() || self.stop.is_stopped() {
                failure = Some(ProgramError::Cancelled);
                break;
            }

            // Charge the instruction before running it.
            let cost = instruction.cost(self.cache.contract_size());
            match self.remaining.checked_sub(cost) {
                Some(rest) => self.remaining = rest,
                None => {
                    let aborted = ProgramError::InsufficientBudget;
                    let _ = outputs
                        .send(self.output(Bytes::new(), Some(aborted.clone())))
                        .await;
                    failure = Some(aborted);
                    break;
                }
            }

            match self.step(instruction).await {
                Ok(output) => {
                    if outputs.send(self.output(output, None)).await.is_err() {
                        // The consumer went away; treat it as cancellation.
                        failure = Some(ProgramError::Cancelled);
                        break;
                    }
                }
                Err(err) => {
                    let _ = outputs
                        .send(self.output(Bytes::new(), Some(err.clone())))
                        .await;
                    failure = Some(err);
                    break;
                }
            }
        }

        let result = match failure {
            Some(err) => {
                tracing::debug!(error = %err, "program aborted before completion");
                Err(err)
            }
            None => Ok(self.cache.into_commit()),
        };
        // The finalizer may have been dropped already (read-only programs).
        let _ = done.send(result);
    }

    async fn step(&mut self, instruction: Instruction) -> Result<Bytes, ProgramError> {
        match instruction {
            Instruction::ReadSector { root } => {
                self.cache.read_sector(self.host.as_ref(), &root).await
            }
            Instruction::AppendSector { data_offset } => {
                let start = data_offset as usize;
                let data = self.program_data.slice(start..start + SECTOR_SIZE as usize);
                self.merkle_root = self.cache.append_sector(data);
                Ok(Bytes::new())
            }
            Instruction::DropSectors { count } => {
                self.merkle_root = self.cache.drop_sectors(count)?;
                Ok(Bytes::new())
            }
        }
    }

    fn output(&self, output: Bytes, error: Option<ProgramError>) -> ProgramOutput {
        ProgramOutput {
            new_merkle_root: self.merkle_root,
            proof: Vec::new(),
            output,
            error,
        }
    }
}
