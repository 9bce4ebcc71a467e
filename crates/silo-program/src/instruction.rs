//! Instruction wire format and decode.
//!
//! Each instruction arrives as a `(specifier, args)` pair. Arguments that
//! address bulk data (sector payloads) are offsets into the program's data
//! blob rather than inline bytes, so the instruction stream itself stays
//! small.

use bytes::Bytes;
use silo_core::{SectorRoot, SECTOR_SIZE};

use crate::cost::{append_sector_cost, drop_sectors_cost, read_sector_cost, Cost};
use crate::error::ProgramError;

/// Specifier for the `ReadSector` instruction.
pub const SPECIFIER_READ_SECTOR: &str = "ReadSector";
/// Specifier for the `AppendSector` instruction.
pub const SPECIFIER_APPEND_SECTOR: &str = "AppendSector";
/// Specifier for the `DropSectors` instruction.
pub const SPECIFIER_DROP_SECTORS: &str = "DropSectors";

/// One instruction as it arrives on the wire.
#[derive(Debug, Clone)]
pub struct WireInstruction {
    /// Instruction specifier.
    pub specifier: String,
    /// Specifier-dependent argument encoding.
    pub args: Bytes,
}

impl WireInstruction {
    /// Convenience constructor for a `ReadSector` instruction.
    #[must_use]
    pub fn read_sector(root: &SectorRoot) -> Self {
        Self {
            specifier: SPECIFIER_READ_SECTOR.into(),
            args: Bytes::copy_from_slice(root.as_bytes()),
        }
    }

    /// Convenience constructor for an `AppendSector` instruction addressing
    /// a sector payload at `data_offset` within the program data.
    #[must_use]
    pub fn append_sector(data_offset: u64) -> Self {
        Self {
            specifier: SPECIFIER_APPEND_SECTOR.into(),
            args: Bytes::copy_from_slice(&data_offset.to_le_bytes()),
        }
    }

    /// Convenience constructor for a `DropSectors` instruction.
    #[must_use]
    pub fn drop_sectors(count: u64) -> Self {
        Self {
            specifier: SPECIFIER_DROP_SECTORS.into(),
            args: Bytes::copy_from_slice(&count.to_le_bytes()),
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Instruction {
    ReadSector { root: SectorRoot },
    AppendSector { data_offset: u64 },
    DropSectors { count: u64 },
}

impl Instruction {
    /// Decode a wire instruction, validating its arguments against the
    /// program data.
    pub(crate) fn decode(
        wire: &WireInstruction,
        program_data: &Bytes,
    ) -> Result<Self, ProgramError> {
        match wire.specifier.as_str() {
            SPECIFIER_READ_SECTOR => {
                let args: [u8; 32] = wire.args.as_ref().try_into().map_err(|_| {
                    ProgramError::MalformedInstruction {
                        specifier: SPECIFIER_READ_SECTOR,
                        reason: format!("expected 32 byte root, got {} bytes", wire.args.len()),
                    }
                })?;
                Ok(Self::ReadSector {
                    root: SectorRoot::from_bytes(args),
                })
            }
            SPECIFIER_APPEND_SECTOR => {
                let data_offset = decode_u64(SPECIFIER_APPEND_SECTOR, &wire.args)?;
                let in_bounds = data_offset
                    .checked_add(SECTOR_SIZE)
                    .is_some_and(|end| end <= program_data.len() as u64);
                if !in_bounds {
                    return Err(ProgramError::MalformedInstruction {
                        specifier: SPECIFIER_APPEND_SECTOR,
                        reason: format!(
                            "sector payload at offset {data_offset} exceeds {} bytes of program data",
                            program_data.len()
                        ),
                    });
                }
                Ok(Self::AppendSector { data_offset })
            }
            SPECIFIER_DROP_SECTORS => {
                let count = decode_u64(SPECIFIER_DROP_SECTORS, &wire.args)?;
                Ok(Self::DropSectors { count })
            }
            other => Err(ProgramError::UnknownInstruction(other.to_string())),
        }
    }

    /// Whether this instruction leaves the contract untouched.
    pub(crate) const fn read_only(&self) -> bool {
        matches!(self, Self::ReadSector { .. })
    }

    /// The cost charged before this instruction runs.
    pub(crate) const fn cost(&self, contract_size: u64) -> Cost {
        match self {
            Self::ReadSector { .. } => read_sector_cost(),
            Self::AppendSector { .. } => append_sector_cost(contract_size),
            Self::DropSectors { .. } => drop_sectors_cost(contract_size),
        }
    }
}

fn decode_u64(specifier: &'static str, args: &Bytes) -> Result<u64, ProgramError> {
    let bytes: [u8; 8] =
        args.as_ref()
            .try_into()
            .map_err(|_| ProgramError::MalformedInstruction {
                specifier,
                reason: format!("expected 8 byte argument, got {} bytes", args.len()),
            })?;
    Ok(u64::from_le_bytes(bytes))
}
