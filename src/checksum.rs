//! Whole-forest checksum (spec.md §8 "Checksum stability" invariant and
//! scenario 3), grounded on `p4est_checksum`/`p4est_comm_checksum`
//! (`examples/original_source/src/p4est.c:4859`): a per-leaf hash folded by
//! wrapping addition, so the combined value is independent of leaf order and
//! of which rank happens to own which leaf, then reduced across every rank
//! with the same `all_reduce_sum_u64` primitive `balance`/`partition` already
//! depend on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::comm::Communicator;
use crate::types::forest::Forest;
use crate::types::quadrant::Quadrant;

fn leaf_hash<const D: usize>(tree: u32, q: &Quadrant<D>) -> u64 {
    let mut h = DefaultHasher::new();
    tree.hash(&mut h);
    q.level.hash(&mut h);
    q.coords.hash(&mut h);
    h.finish()
}

/// A global checksum of every leaf this rank owns, combined with every other
/// rank's via an order- and partition-independent fold. Two forests holding
/// the same global leaf set checksum identically regardless of how that set
/// is split across ranks.
pub fn checksum<const D: usize, T, C: Communicator>(forest: &Forest<D, T>, comm: &C) -> u64 {
    let mut local = 0u64;
    for (idx, tree) in forest.trees.iter().enumerate() {
        let tree_id = idx as u32;
        for leaf in tree.leaves() {
            local = local.wrapping_add(leaf_hash(tree_id, &leaf.quadrant));
        }
    }
    comm.all_reduce_sum_u64(local)
}
