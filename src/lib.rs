//! A distributed forest of quadtrees (2D) or octrees (3D): Morton coordinate
//! algebra, 2:1 distributed balance, and the refine/coarsen/partition
//! operations that collaborate with it (spec.md §1).
//!
//! The four primitive operations on a [`Forest`] are free functions rather
//! than inherent methods, mirroring the original library's `p4est_refine`/
//! `p4est_balance`/`p4est_partition` free-function API:
//!
//! - [`ops::refine`] / [`ops::coarsen`] — local leaf-level mutation.
//! - [`balance::balance`] — the distributed 2:1 enforcement this crate
//!   exists to implement, dispatching to [`balance::ghost`] or
//!   [`balance::sort`].
//! - [`ops::partition`] — redistribute leaves across processes.

pub mod balance;
pub mod callbacks;
pub mod checksum;
pub mod comm;
pub mod completion;
pub mod config;
pub mod constants;
pub mod error;
pub mod inspect;
pub mod ops;
pub mod types;

pub use balance::balance;
pub use callbacks::{CoarsenFn, InitFn, RefineFn, ReplaceFn, WeightFn};
pub use checksum::checksum;
pub use comm::Communicator;
pub use completion::{complete, complete_interior, complete_region};
pub use config::ForestConfig;
pub use constants::{MAXLEVEL, QMAXLEVEL, ROOT_LEN};
pub use error::{ForestError, ForestResult};
pub use inspect::Inspect;
pub use ops::{coarsen, partition, refine};
pub use types::connectivity::Connectivity;
pub use types::forest::{Forest, GlobalPosition};
pub use types::quadrant::{ConnectType, Quadrant};
pub use types::tree::{Leaf, TreeStorage};

use std::sync::Arc;

/// Build a uniform forest at the coarsest level whose global leaf count is
/// at least `config.min_total_quadrants` (spec.md §6 `new`).
pub fn new<const D: usize, T>(
    connectivity: Arc<Connectivity<D>>,
    rank: i32,
    size: i32,
    config: &ForestConfig,
) -> Forest<D, T> {
    let mut forest = Forest::new(connectivity, rank, size, config.min_total_quadrants, config.connect_type);
    forest.balance_sort = config.balance_sort;
    forest
}

/// Deep-copy a forest's trees and, when `copy_data` is set, its user data
/// pool (spec.md §6 `copy`).
pub fn copy<const D: usize, T: Clone>(forest: &Forest<D, T>, copy_data: bool) -> Forest<D, T> {
    if copy_data {
        forest.deep_copy()
    } else {
        let mut f = forest.deep_copy();
        f.data = crate::types::pool::DataPool::new();
        for tree in f.trees.iter_mut() {
            let leaves: Vec<_> = tree
                .leaves()
                .iter()
                .map(|l| Leaf {
                    quadrant: l.quadrant,
                    data: None,
                })
                .collect();
            tree.rebuild_from_sorted(leaves);
        }
        f
    }
}

/// Release a forest's pools (spec.md §6 `destroy`). Rust's ownership model
/// already drops every pool when `forest` goes out of scope; this function
/// exists only so callers porting code against the original lifecycle API
/// have a literal call site to reach for.
pub fn destroy<const D: usize, T>(forest: Forest<D, T>) {
    drop(forest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::connectivity::Connectivity;

    #[test]
    fn new_then_copy_preserves_leaf_count() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let config = ForestConfig {
            min_total_quadrants: 16,
            ..ForestConfig::default()
        };
        let forest: Forest<2, u32> = new(conn, 0, 1, &config);
        let copied = copy(&forest, true);
        assert_eq!(forest.total_leaves(), copied.total_leaves());
    }

    #[test]
    fn copy_without_data_clears_every_slot() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let config = ForestConfig {
            min_total_quadrants: 4,
            ..ForestConfig::default()
        };
        let mut forest: Forest<2, u32> = new(conn, 0, 1, &config);
        let mut init = |_t: u32, q: &Quadrant<2>| q.level as u32;
        let mut refine_once = |_t: u32, q: &Quadrant<2>, _d: Option<&u32>| q.level == 0;
        ops::refine(&mut forest, false, 1, &mut refine_once, &mut init, None);
        assert!(!forest.data.is_empty());
        let shallow = copy(&forest, false);
        assert!(shallow.data.is_empty());
        assert_eq!(shallow.total_leaves(), forest.total_leaves());
    }
}
