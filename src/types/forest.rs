//! The forest: connectivity plus, per process, the trees it owns leaves in,
//! and the replicated global partition arrays (spec.md §3, §6).

use std::sync::Arc;

use crate::types::connectivity::Connectivity;
use crate::types::pool::DataPool;
use crate::types::quadrant::{ConnectType, Quadrant};
use crate::types::tree::{Leaf, TreeStorage};

/// A virtual quadrant marking where a process's ownership window begins:
/// the first quadrant (by global Morton order, tree-major) that belongs to
/// it. `global_first_position[P]` is a sentinel one past the last tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalPosition<const D: usize> {
    pub tree: u32,
    pub quadrant: Quadrant<D>,
}

impl<const D: usize> GlobalPosition<D> {
    /// Total order used by `owner_of`: tree id first, then Morton order
    /// within the tree.
    fn cmp_key(&self) -> (u32, Quadrant<D>) {
        (self.tree, self.quadrant)
    }
}

/// A forest of trees distributed across `size` processes (spec.md §3).
/// `T` is the per-leaf user data payload.
pub struct Forest<const D: usize, T> {
    pub connectivity: Arc<Connectivity<D>>,
    pub trees: Vec<TreeStorage<D>>,
    pub data: DataPool<T>,
    /// Cumulative leaf count before each rank; length `size + 1`. (Not the
    /// Morton ids spec.md §3 describes it as — see DESIGN.md's resolution of
    /// this; sum of local counts must still equal the global count, per
    /// invariant 2, which a cumulative-count array makes a trivial
    /// telescoping check.)
    pub global_first_quadrant: Vec<u64>,
    /// Length `size + 1`; `global_first_position[p]` is the first quadrant
    /// rank `p` owns, `global_first_position[size]` a one-past-the-end
    /// sentinel at `(num_trees, root)`.
    pub global_first_position: Vec<GlobalPosition<D>>,
    pub rank: i32,
    pub size: i32,
    pub connect_type: ConnectType,
    /// spec.md §4.6's `inspect.balance_sort` flag.
    pub balance_sort: bool,
}

impl<const D: usize, T> Forest<D, T> {
    /// Build a uniform forest: every tree refined to the coarsest level
    /// whose global leaf count is at least `min_total_quadrants`, then cut
    /// the global Morton order (tree-major) into `size` equal pieces
    /// (spec.md §6 `new`).
    pub fn new(
        connectivity: Arc<Connectivity<D>>,
        rank: i32,
        size: i32,
        min_total_quadrants: u64,
        connect_type: ConnectType,
    ) -> Self {
        let num_trees = connectivity.num_trees as u64;
        let mut level: u8 = 0;
        while (num_trees << (D as u8 * level)) < min_total_quadrants && level < crate::constants::QMAXLEVEL {
            level += 1;
        }

        let per_tree = 1u64 << (D as u32 * level as u32);
        let total = num_trees * per_tree;

        let mut global_first_quadrant = Vec::with_capacity(size as usize + 1);
        for p in 0..=size as u64 {
            global_first_quadrant.push(total * p / size as u64);
        }

        let mut trees = Vec::with_capacity(connectivity.num_trees as usize);
        for t in 0..connectivity.num_trees {
            trees.push(TreeStorage::new(t));
        }

        // Build each process's slice of the uniform global Morton order
        // without any communication: the order is entirely deterministic
        // given `level`, so every rank can compute it locally.
        let full_order = uniform_global_order::<D>(connectivity.num_trees, level);
        let lo = global_first_quadrant[rank as usize] as usize;
        let hi = global_first_quadrant[rank as usize + 1] as usize;
        for (tree, q) in &full_order[lo..hi] {
            trees[*tree as usize]
                .rebuild_leaves_push(Leaf::new(*q));
        }
        for t in trees.iter_mut() {
            t.finish_incremental_build();
        }

        let mut global_first_position = Vec::with_capacity(size as usize + 1);
        for p in 0..size as usize {
            let idx = global_first_quadrant[p] as usize;
            if idx < full_order.len() {
                let (tree, q) = full_order[idx];
                global_first_position.push(GlobalPosition { tree, quadrant: q });
            } else {
                global_first_position.push(GlobalPosition {
                    tree: connectivity.num_trees,
                    quadrant: Quadrant::root(),
                });
            }
        }
        global_first_position.push(GlobalPosition {
            tree: connectivity.num_trees,
            quadrant: Quadrant::root(),
        });

        Forest {
            connectivity,
            trees,
            data: DataPool::new(),
            global_first_quadrant,
            global_first_position,
            rank,
            size,
            connect_type,
            balance_sort: false,
        }
    }

    pub fn total_leaves(&self) -> u64 {
        self.trees.iter().map(|t| t.len() as u64).sum()
    }

    /// Ownership lookup (spec.md §4.3): the rank owning `(tree, quadrant)`.
    /// Binary search on `global_first_position` for the smallest `p` such
    /// that `(tree, quadrant)` does not precede `global_first_position[p]`.
    pub fn owner_of(&self, tree: u32, quadrant: &Quadrant<D>) -> i32 {
        let key = (tree, *quadrant);
        let p = self.global_first_position.partition_point(|pos| {
            pos.cmp_key() <= key
        });
        debug_assert!(p > 0, "ownership lookup must never return rank -1 (spec.md §7.1)");
        (p - 1) as i32
    }

    pub fn deep_copy(&self) -> Self
    where
        T: Clone,
    {
        Forest {
            connectivity: Arc::clone(&self.connectivity),
            trees: self.trees.clone(),
            data: self.data.clone(),
            global_first_quadrant: self.global_first_quadrant.clone(),
            global_first_position: self.global_first_position.clone(),
            rank: self.rank,
            size: self.size,
            connect_type: self.connect_type,
            balance_sort: self.balance_sort,
        }
    }
}

impl<const D: usize> TreeStorage<D> {
    /// Helper used only while constructing a brand-new uniform forest: push
    /// leaves that are already known to arrive in sorted order one at a
    /// time, deferring the `O(n)` bookkeeping rebuild to
    /// [`TreeStorage::finish_incremental_build`].
    fn rebuild_leaves_push(&mut self, leaf: Leaf<D>) {
        self.incremental_buffer().push(leaf);
    }

    fn incremental_buffer(&mut self) -> &mut Vec<Leaf<D>> {
        // SAFETY-free helper: we reuse `rebuild_from_sorted`'s backing
        // storage by exposing a scratch buffer via a thread-local would be
        // overkill here; instead `Forest::new` always pairs
        // `rebuild_leaves_push` with exactly one
        // `finish_incremental_build` call per tree, so a plain field
        // suffices.
        self.scratch.get_or_insert_with(Vec::new)
    }

    fn finish_incremental_build(&mut self) {
        if let Some(buf) = self.scratch.take() {
            self.rebuild_from_sorted(buf);
        }
    }
}

/// Every `(tree, quadrant)` pair in the uniform tiling at `level`, in global
/// (tree-major, then Morton) order.
fn uniform_global_order<const D: usize>(num_trees: u32, level: u8) -> Vec<(u32, Quadrant<D>)> {
    let side = Quadrant::<D>::side_len(level);
    let per_axis = (crate::constants::ROOT_LEN / side) as i64;
    let mut out = Vec::new();
    for tree in 0..num_trees {
        let mut idx = vec![0i64; D];
        'outer: loop {
            let mut coords = [0i64; D];
            for i in 0..D {
                coords[i] = idx[i] * side;
            }
            out.push((tree, Quadrant { level, coords }));
            let mut axis = 0;
            loop {
                idx[axis] += 1;
                if idx[axis] < per_axis {
                    break;
                }
                idx[axis] = 0;
                axis += 1;
                if axis == D {
                    break 'outer;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_forest_partitions_leaves_without_gaps_or_overlap() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let size = 4;
        let mut total = 0u64;
        for rank in 0..size {
            let forest: Forest<2, ()> = Forest::new(conn.clone(), rank, size, 64, ConnectType::Face);
            total += forest.total_leaves();
        }
        assert_eq!(total, 64);
    }

    #[test]
    fn owner_of_is_consistent_with_global_first_position() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let size = 4;
        let forests: Vec<Forest<2, ()>> = (0..size)
            .map(|rank| Forest::new(conn.clone(), rank, size, 64, ConnectType::Face))
            .collect();
        for forest in &forests {
            for leaf in forest.trees[0].leaves() {
                assert_eq!(forest.owner_of(0, &leaf.quadrant), forest.rank);
            }
        }
    }
}
