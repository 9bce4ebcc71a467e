//! Meta Merkle roots over a contract's ordered sector-root list.

use crate::sector::SectorRoot;

const LEAF_TAG: &[u8] = b"SILO-META-LEAF-V1";
const NODE_TAG: &[u8] = b"SILO-META-NODE-V1";
const EMPTY_TAG: &[u8] = b"SILO-META-EMPTY-V1";

/// Compute the Merkle root of a contract's ordered sector-root list.
///
/// Position is significant: the root at index `i` is the contract's sector
/// `i`. Leaves and interior nodes are domain-separated; an odd node at any
/// level is carried up unchanged.
#[must_use]
pub fn meta_root(roots: &[SectorRoot]) -> SectorRoot {
    if roots.is_empty() {
        let mut h = blake3::Hasher::new();
        h.update(EMPTY_TAG);
        return SectorRoot::from_bytes(*h.finalize().as_bytes());
    }

    let mut level: Vec<SectorRoot> = roots.iter().map(leaf_hash).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(node_hash(left, right)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    level[0]
}

fn leaf_hash(root: &SectorRoot) -> SectorRoot {
    let mut h = blake3::Hasher::new();
    h.update(LEAF_TAG);
    h.update(root.as_bytes());
    SectorRoot::from_bytes(*h.finalize().as_bytes())
}

fn node_hash(left: &SectorRoot, right: &SectorRoot) -> SectorRoot {
    let mut h = blake3::Hasher::new();
    h.update(NODE_TAG);
    h.update(left.as_bytes());
    h.update(right.as_bytes());
    SectorRoot::from_bytes(*h.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::sector_root;

    fn roots(n: u8) -> Vec<SectorRoot> {
        (0..n).map(|i| sector_root(&[i])).collect()
    }

    #[test]
    fn empty_list_has_a_stable_root() {
        assert_eq!(meta_root(&[]), meta_root(&[]));
        assert_ne!(meta_root(&[]), meta_root(&roots(1)));
    }

    #[test]
    fn root_depends_on_order() {
        let mut rs = roots(4);
        let forward = meta_root(&rs);
        rs.reverse();
        assert_ne!(forward, meta_root(&rs));
    }

    #[test]
    fn root_depends_on_every_leaf() {
        for n in 1..9 {
            let rs = roots(n);
            let base = meta_root(&rs);
            for i in 0..rs.len() {
                let mut changed = rs.clone();
                changed[i] = sector_root(b"replacement");
                assert_ne!(base, meta_root(&changed), "leaf {i} of {n}");
            }
        }
    }

    #[test]
    fn single_leaf_differs_from_raw_root() {
        // The leaf tag keeps a one-sector contract root distinct from the
        // sector's own content root.
        let r = sector_root(b"solo");
        assert_ne!(meta_root(&[r]), r);
    }

    #[test]
    fn append_then_truncate_restores_root() {
        let mut rs = roots(5);
        let before = meta_root(&rs);
        rs.push(sector_root(b"extra"));
        rs.pop();
        assert_eq!(before, meta_root(&rs));
    }
}
