//! Sector primitives: content roots, salted on-disk ids, and the sector salt.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a physical sector in bytes (4 MiB).
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Content root of a sector.
///
/// Opaque 32-byte cryptographic hash; unique per distinct payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorRoot([u8; 32]);

impl SectorRoot {
    /// Construct a `SectorRoot` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SectorRoot").field(&self.to_string()).finish()
    }
}

impl fmt::Display for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for SectorRoot {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compute the content root of a sector payload.
pub fn sector_root(data: &[u8]) -> SectorRoot {
    let mut h = blake3::Hasher::new();
    h.update(b"SILO-SECTOR-V1");
    h.update(data);
    SectorRoot(*h.finalize().as_bytes())
}

/// Truncated, salted derivation of a `SectorRoot` used for on-disk indexing.
///
/// There are lots of sectors, and to minimize their footprint a reduced-size
/// hash is used. An attacker gets one collision trial per sector upload and
/// has minimal means to learn whether a collision landed, so 12 bytes
/// (collision resistance ~2^48) is sufficient; a host storing 2^48 sectors
/// would hold an exabyte of data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorId([u8; 12]);

impl SectorId {
    /// Construct a `SectorId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SectorId").field(&self.to_string()).finish()
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Process-local salt mixed into sector-id derivation.
///
/// The salt makes cross-host id-collision attacks require online interaction
/// with this specific host. It is generated once at store initialization and
/// persisted so ids remain stable across restarts.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorSalt([u8; 32]);

impl SectorSalt {
    /// Generate a fresh random salt.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Construct a salt from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the on-disk id for a sector root under this salt.
    #[must_use]
    pub fn sector_id(&self, root: &SectorRoot) -> SectorId {
        let mut h = blake3::Hasher::new_keyed(&self.0);
        h.update(b"SILO-SECTOR-ID-V1");
        h.update(root.as_bytes());
        let digest = h.finalize();
        let mut id = [0_u8; 12];
        id.copy_from_slice(&digest.as_bytes()[..12]);
        SectorId(id)
    }
}

impl fmt::Debug for SectorSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SectorSalt")
            .field(&"[redacted; 32 bytes]")
            .finish()
    }
}
