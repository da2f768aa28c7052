//! Per-tree leaf storage (spec.md §4.2).
//!
//! Leaves live in one contiguous, Morton-sorted `Vec`, never behind
//! individually-owned pointers (Design Notes, spec.md §9) — essential for
//! the binary searches and range scans the balance kernel and completion
//! step both rely on.

use crate::constants::MAXLEVEL;
use crate::types::quadrant::Quadrant;

const NUM_LEVELS: usize = MAXLEVEL as usize + 1;

/// A leaf quadrant plus an index into the forest's user-data pool. The
/// transient `from_tree`/codim tags used mid-balance are *not* stored here;
/// see [`crate::balance::TaggedQuadrant`] — giving them their own type
/// avoids overloading this struct the way the source overloads `pad8`/
/// `pad16` (spec.md §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf<const D: usize> {
    pub quadrant: Quadrant<D>,
    pub data: Option<usize>,
}

impl<const D: usize> Leaf<D> {
    pub fn new(quadrant: Quadrant<D>) -> Self {
        Leaf {
            quadrant,
            data: None,
        }
    }
}

/// One tree's leaf sequence and incremental bookkeeping.
#[derive(Clone, Debug)]
pub struct TreeStorage<const D: usize> {
    pub tree_id: u32,
    leaves: Vec<Leaf<D>>,
    quadrants_per_level: [usize; NUM_LEVELS],
    maxlevel: u8,
    /// Scratch buffer for incremental construction (see
    /// `Forest::new`'s use of `rebuild_leaves_push` /
    /// `finish_incremental_build`); empty outside that one call sequence.
    pub(crate) scratch: Option<Vec<Leaf<D>>>,
}

impl<const D: usize> TreeStorage<D> {
    pub fn new(tree_id: u32) -> Self {
        TreeStorage {
            tree_id,
            leaves: Vec::new(),
            quadrants_per_level: [0; NUM_LEVELS],
            maxlevel: 0,
            scratch: None,
        }
    }

    /// A complete, uniformly refined tree at `level`.
    pub fn uniform(tree_id: u32, level: u8) -> Self {
        let mut t = TreeStorage::new(tree_id);
        t.rebuild_from_sorted(
            complete_uniform(level)
                .into_iter()
                .map(Leaf::new)
                .collect(),
        );
        t
    }

    pub fn leaves(&self) -> &[Leaf<D>] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn maxlevel(&self) -> u8 {
        self.maxlevel
    }

    pub fn quadrants_at_level(&self, level: u8) -> usize {
        self.quadrants_per_level[level as usize]
    }

    pub fn first_descendant(&self) -> Option<Quadrant<D>> {
        self.leaves.first().map(|l| l.quadrant)
    }

    pub fn last_descendant(&self) -> Option<Quadrant<D>> {
        self.leaves.last().map(|l| l.quadrant)
    }

    /// Replace the whole leaf sequence. Callers (completion, merge, refine,
    /// coarsen) always produce an already Morton-sorted sequence; this is
    /// the one place per-level counts and `maxlevel` are recomputed, in
    /// `O(n)`, rather than maintained through every individual mutation.
    pub fn rebuild_from_sorted(&mut self, leaves: Vec<Leaf<D>>) {
        debug_assert!(
            leaves.windows(2).all(|w| w[0].quadrant < w[1].quadrant),
            "tree storage requires a strictly Morton-sorted, non-overlapping sequence"
        );
        self.quadrants_per_level = [0; NUM_LEVELS];
        self.maxlevel = 0;
        for leaf in &leaves {
            self.quadrants_per_level[leaf.quadrant.level as usize] += 1;
            self.maxlevel = self.maxlevel.max(leaf.quadrant.level);
        }
        self.leaves = leaves;
    }

    /// Lower bound: index of the first leaf not less than `q`.
    pub fn lower_bound(&self, q: &Quadrant<D>) -> usize {
        self.leaves
            .partition_point(|leaf| leaf.quadrant.morton_cmp(q) == std::cmp::Ordering::Less)
    }

    /// Upper bound: index of the first leaf strictly greater than `q`.
    pub fn upper_bound(&self, q: &Quadrant<D>) -> usize {
        self.leaves.partition_point(|leaf| {
            leaf.quadrant.morton_cmp(q) != std::cmp::Ordering::Greater
        })
    }

    /// All leaves whose quadrant lies in `[lo, hi]` inclusive (by Morton
    /// order); used to clamp a tree back to a process's ownership window
    /// after a merge (spec.md §4.5 "Merge and complete").
    pub fn range(&self, lo: &Quadrant<D>, hi: &Quadrant<D>) -> &[Leaf<D>] {
        let start = self.lower_bound(lo);
        let end = self.upper_bound(hi);
        &self.leaves[start..end]
    }
}

/// The complete, minimal-cardinality tiling of the root by quadrants at a
/// single uniform `level` — used only to seed a brand-new forest
/// (`Forest::new`); general completion of a sparse representative set lives
/// in [`crate::completion`].
fn complete_uniform<const D: usize>(level: u8) -> Vec<Quadrant<D>> {
    let side = Quadrant::<D>::side_len(level);
    let per_axis = (crate::constants::ROOT_LEN / side) as i64;
    let mut out = Vec::new();
    let mut idx = vec![0i64; D];
    loop {
        let mut coords = [0i64; D];
        for i in 0..D {
            coords[i] = idx[i] * side;
        }
        out.push(Quadrant { level, coords });
        // odometer increment
        let mut axis = 0;
        loop {
            idx[axis] += 1;
            if idx[axis] < per_axis {
                break;
            }
            idx[axis] = 0;
            axis += 1;
            if axis == D {
                out.sort();
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_tree_is_complete_and_sorted() {
        let t: TreeStorage<2> = TreeStorage::uniform(0, 2);
        assert_eq!(t.len(), 16);
        assert!(t
            .leaves()
            .windows(2)
            .all(|w| w[0].quadrant < w[1].quadrant));
    }

    #[test]
    fn lower_upper_bound_bracket_exact_match() {
        let t: TreeStorage<2> = TreeStorage::uniform(0, 2);
        let q = t.leaves()[5].quadrant;
        let lo = t.lower_bound(&q);
        let hi = t.upper_bound(&q);
        assert_eq!(hi - lo, 1);
        assert_eq!(t.leaves()[lo].quadrant, q);
    }
}
