//! Refine and coarsen (spec.md §6): local, comparatively simple collaborators
//! of balance. Both drive the same [`crate::completion::splice`] used by the
//! balance merge step, so a parent splitting into its children (refine) or a
//! complete sibling family collapsing into its parent (coarsen) always goes
//! through `replace_cb` when one is given.

use crate::callbacks::{CoarsenFn, InitFn, RefineFn, ReplaceFn};
use crate::completion::splice;
use crate::types::forest::Forest;
use crate::types::quadrant::Quadrant;

fn reborrow<'a, const D: usize, T>(
    r: &'a mut Option<&mut dyn ReplaceFn<D, T>>,
) -> Option<&'a mut dyn ReplaceFn<D, T>> {
    r.as_mut().map(|cb| &mut **cb as &mut dyn ReplaceFn<D, T>)
}

/// Subdivide every owned leaf `refine_cb` approves of, up to `allowed_level`.
/// When `recursive` is set, newly created children are themselves offered to
/// `refine_cb` and may split again, repeating until a pass makes no further
/// change or `allowed_level` is reached.
pub fn refine<const D: usize, T>(
    forest: &mut Forest<D, T>,
    recursive: bool,
    allowed_level: u8,
    refine_cb: &mut impl RefineFn<D, T>,
    init_cb: &mut impl InitFn<D, T>,
    mut replace_cb: Option<&mut dyn ReplaceFn<D, T>>,
) {
    tracing::debug!(trees = forest.trees.len(), recursive, allowed_level, "refine: enter");
    for idx in 0..forest.trees.len() {
        let tree_id = idx as u32;
        loop {
            let leaves = forest.trees[idx].leaves().to_vec();
            let mut completed = Vec::with_capacity(leaves.len());
            let mut any = false;
            for leaf in &leaves {
                let q = leaf.quadrant;
                let data = leaf.data.and_then(|i| forest.data.get(i));
                if q.level < allowed_level && refine_cb.call(tree_id, &q, data) {
                    completed.extend(q.children_of());
                    any = true;
                } else {
                    completed.push(q);
                }
            }
            splice(forest, tree_id, completed, init_cb, reborrow(&mut replace_cb));
            if !any || !recursive {
                break;
            }
        }
    }
    tracing::trace!(leaves = forest.trees.iter().map(|t| t.len()).sum::<usize>(), "refine: exit");
}

/// Collapse every complete run of `CHILDREN` sibling leaves `coarsen_cb`
/// approves of into their parent. `recursive` repeats the pass so a freshly
/// created parent that now completes a coarser family is itself offered to
/// `coarsen_cb`.
pub fn coarsen<const D: usize, T>(
    forest: &mut Forest<D, T>,
    recursive: bool,
    coarsen_cb: &mut impl CoarsenFn<D, T>,
    init_cb: &mut impl InitFn<D, T>,
    mut replace_cb: Option<&mut dyn ReplaceFn<D, T>>,
) {
    let children = Quadrant::<D>::CHILDREN;
    tracing::debug!(trees = forest.trees.len(), recursive, "coarsen: enter");
    for idx in 0..forest.trees.len() {
        let tree_id = idx as u32;
        loop {
            let leaves = forest.trees[idx].leaves().to_vec();
            let mut completed = Vec::with_capacity(leaves.len());
            let mut any = false;
            let mut i = 0usize;
            while i < leaves.len() {
                if i + children <= leaves.len() {
                    let group = &leaves[i..i + children];
                    let quadrants: Vec<Quadrant<D>> = group.iter().map(|l| l.quadrant).collect();
                    let forms_family =
                        quadrants[0].level > 0 && quadrants == quadrants[0].parent().children_of();
                    if forms_family {
                        let data: Vec<Option<&T>> = group
                            .iter()
                            .map(|l| l.data.and_then(|idx2| forest.data.get(idx2)))
                            .collect();
                        if coarsen_cb.call(tree_id, &quadrants, &data) {
                            completed.push(quadrants[0].parent());
                            i += children;
                            any = true;
                            continue;
                        }
                    }
                }
                completed.push(leaves[i].quadrant);
                i += 1;
            }
            splice(forest, tree_id, completed, init_cb, reborrow(&mut replace_cb));
            if !any || !recursive {
                break;
            }
        }
    }
    tracing::trace!(leaves = forest.trees.iter().map(|t| t.len()).sum::<usize>(), "coarsen: exit");
}
