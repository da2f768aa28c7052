//! Balance — local kernel (spec.md §4.4): enforce 2:1 within one tree's
//! sorted leaf sequence, entirely in-process and pure.

use std::collections::{BTreeSet, VecDeque};

use crate::constants::QMAXLEVEL;
use crate::types::quadrant::{ConnectType, Quadrant};

fn within_root<const D: usize>(root: &Quadrant<D>, q: &Quadrant<D>) -> bool {
    *root == *q || root.is_ancestor(q)
}

/// Absorb `q` into the reduced set, applying the domination rule: two
/// overlapping entries can never both survive, and the *finer* one always
/// wins (spec.md §8: "balance never coarsens" — a candidate this pass
/// derives must never displace an already-present finer leaf). A duplicate
/// is dropped; a strict ancestor of `q` already in the set is replaced by
/// `q`; a strict descendant of `q` already in the set makes `q` itself
/// redundant. Returns `true` if `q` newly became (or remains) a
/// representative and must have its own insulation neighbors visited by the
/// worklist.
fn insert_reduced<const D: usize>(set: &mut BTreeSet<Quadrant<D>>, q: Quadrant<D>) -> bool {
    if let Some(pred) = set.range(..=q).next_back().copied() {
        if pred == q {
            return false;
        }
        if pred.is_ancestor(&q) {
            set.remove(&pred);
            set.insert(q);
            return true;
        }
    }
    let hi = q.last_descendant(QMAXLEVEL);
    if set.range(q..=hi).next().is_some() {
        return false;
    }
    set.insert(q);
    true
}

/// Run the local balance kernel over `input` (a sorted, non-overlapping
/// sequence of representative leaves, all descendants of `root`), returning
/// a new reduced representative set whose completion (`crate::completion`)
/// is 2:1-balanced at `connect_type` *within this tree*. Cross-tree and
/// cross-process neighbors are out of scope here — the ghost-layer and sort
/// variants in this module's siblings handle those — so any insulation
/// neighbor (or its level-minus-one ancestor) that falls outside `root` is
/// simply skipped.
pub fn run<const D: usize>(
    root: Quadrant<D>,
    input: &[Quadrant<D>],
    connect_type: ConnectType,
) -> Vec<Quadrant<D>> {
    let max_codim = connect_type.max_codim(D);
    let mut set: BTreeSet<Quadrant<D>> = BTreeSet::new();
    let mut worklist: VecDeque<Quadrant<D>> = VecDeque::new();

    for &q in input {
        if insert_reduced(&mut set, q) {
            worklist.push_back(q);
        }
    }

    while let Some(q) = worklist.pop_front() {
        if q.level == 0 {
            continue;
        }
        for (n, codim) in q.insulation_neighbors() {
            if codim > max_codim {
                continue;
            }
            if !within_root(&root, &n) {
                continue;
            }
            let candidate = n.parent();
            if !within_root(&root, &candidate) {
                continue;
            }
            if insert_reduced(&mut set, candidate) {
                worklist.push_back(candidate);
            }
        }
    }

    set.into_iter().collect()
}

/// `true` iff every face/edge/corner-neighbor pair (by `connect_type`) in
/// the completion of `leaves` (all within `root`) differs in level by at
/// most one. Used by tests to check the 2:1 property (spec.md §8) and
/// available to callers that want to assert balance held without
/// re-running the kernel.
pub fn is_balanced<const D: usize>(
    root: Quadrant<D>,
    leaves: &[Quadrant<D>],
    connect_type: ConnectType,
) -> bool {
    let max_codim = connect_type.max_codim(D);
    let set: BTreeSet<Quadrant<D>> = leaves.iter().copied().collect();
    for &q in leaves {
        for (n, codim) in q.insulation_neighbors() {
            if codim > max_codim || !within_root(&root, &n) {
                continue;
            }
            // Find the leaf whose subtree contains `n`: the predecessor of
            // `n` in the completed sequence, since leaves are non-
            // overlapping and exactly one can be an ancestor of (or equal
            // to) `n`.
            if let Some(owner) = set.range(..=n).next_back() {
                if (*owner == n || owner.is_ancestor(&n))
                    && owner.level.abs_diff(q.level) > 1
                {
                    return false;
                }
            }
        }
    }
    true
}
