//! Balance (spec.md §4.4–§4.6): the core operation this crate exists to
//! implement. `local` is the pure, single-tree kernel every other variant
//! builds on; `ghost` is the default distributed protocol; `sort` is the
//! alternative recursive-doubling variant selected via
//! [`crate::inspect::Inspect::balance_sort`] / `Forest::balance_sort`.

pub mod ghost;
pub mod local;
pub mod sort;

pub use ghost::TaggedQuadrant;

use crate::callbacks::{InitFn, ReplaceFn};
use crate::comm::Communicator;
use crate::error::ForestResult;
use crate::inspect::Inspect;
use crate::types::forest::Forest;
use crate::types::quadrant::Quadrant;

/// Keep only the quadrants in `items` that fall inside this rank's
/// ownership window for `tree_id` (spec.md §4.3's `global_first_position`).
/// Needed after any local recompute-and-complete pass over a tree this rank
/// only partially owns: candidates `local::run` discovers near the edge of
/// the owned slice, and gap filling from [`crate::completion::complete_interior`],
/// both stay within the tree's root — neither knows about the rank
/// boundary on its own.
pub(crate) fn clip_to_window<const D: usize, T>(
    forest: &Forest<D, T>,
    tree_id: u32,
    items: Vec<Quadrant<D>>,
) -> Vec<Quadrant<D>> {
    let rank = forest.rank as usize;
    let lo = &forest.global_first_position[rank];
    let hi = &forest.global_first_position[rank + 1];
    items
        .into_iter()
        .filter(|q| {
            let after_lo = lo.tree < tree_id || (lo.tree == tree_id && *q >= lo.quadrant);
            let before_hi = hi.tree > tree_id || (hi.tree == tree_id && *q < hi.quadrant);
            after_lo && before_hi
        })
        .collect()
}

/// Balance `forest` across every rank in `comm`, dispatching to the sort
/// variant when `forest.balance_sort` is set and to the ghost-layer
/// protocol otherwise (spec.md §6 `balance`).
pub fn balance<const D: usize, T, C: Communicator>(
    forest: &mut Forest<D, T>,
    comm: &C,
    init: &mut impl InitFn<D, T>,
    replace: Option<&mut dyn ReplaceFn<D, T>>,
    mut inspect: Option<&mut Inspect>,
) -> ForestResult<()> {
    if forest.balance_sort {
        sort::balance_sort(forest, comm, init, replace, &mut inspect)
    } else {
        ghost::balance_ghost(forest, comm, init, replace, &mut inspect)
    }
}
