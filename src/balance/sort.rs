//! Balance — sort variant (spec.md §4.6), selected via
//! `Forest::balance_sort` / `Inspect::balance_sort`: instead of looking up
//! the true owner of every boundary quadrant the way
//! [`crate::balance::ghost`] does, this variant exchanges boundary seeds
//! with immediate rank neighbors only. `Forest::new`'s contiguous,
//! tree-major partition guarantees the only ranks whose ownership window
//! touches this rank's are `rank - 1` and `rank + 1`, so a single
//! fixed-degree round replaces the owner lookups and the two-round notify
//! protocol of the ghost variant.

use itertools::Itertools;

use crate::balance::{clip_to_window, local};
use crate::callbacks::{InitFn, ReplaceFn};
use crate::comm::Communicator;
use crate::completion::{complete_interior, splice};
use crate::constants::tags::{BALANCE_SORT_NEIGH, BALANCE_SORT_SORT};
use crate::error::ForestResult;
use crate::inspect::Inspect;
use crate::types::forest::Forest;
use crate::types::quadrant::Quadrant;

fn record_size<const D: usize>() -> usize {
    4 + 1 + 8 * D
}

fn encode<const D: usize>(items: &[(u32, Quadrant<D>)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(items.len() * record_size::<D>());
    for (tree, q) in items {
        buf.extend_from_slice(&tree.to_le_bytes());
        buf.push(q.level);
        for c in q.coords {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
    buf
}

fn decode<const D: usize>(bytes: &[u8]) -> Vec<(u32, Quadrant<D>)> {
    let rs = record_size::<D>();
    debug_assert_eq!(bytes.len() % rs, 0, "malformed sort-variant seed stream");
    bytes
        .chunks(rs)
        .map(|chunk| {
            let tree = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let level = chunk[4];
            let mut coords = [0i64; D];
            let mut off = 5;
            for c in coords.iter_mut() {
                *c = i64::from_le_bytes(chunk[off..off + 8].try_into().unwrap());
                off += 8;
            }
            (tree, Quadrant { level, coords })
        })
        .collect()
}

/// The alternative distributed balance entry point (spec.md §4.6). One
/// local pass, one fixed round of seed exchange with `rank - 1`/`rank + 1`,
/// one merge-and-complete; no owner lookups and no `notify`.
pub fn balance_sort<const D: usize, T, C: Communicator>(
    forest: &mut Forest<D, T>,
    comm: &C,
    init: &mut impl InitFn<D, T>,
    mut replace: Option<&mut dyn ReplaceFn<D, T>>,
    inspect: &mut Option<&mut Inspect>,
) -> ForestResult<()> {
    let reborrow = |r: &mut Option<&mut dyn ReplaceFn<D, T>>| {
        r.as_mut().map(|cb| &mut **cb as &mut dyn ReplaceFn<D, T>)
    };

    tracing::debug!(rank = comm.rank(), trees = forest.trees.len(), "balance_sort: local pass");
    for idx in 0..forest.trees.len() {
        let tree_id = idx as u32;
        let root = Quadrant::root();
        let leaves: Vec<Quadrant<D>> =
            forest.trees[idx].leaves().iter().map(|l| l.quadrant).collect();
        let reduced = local::run(root, &leaves, forest.connect_type);
        let completed = clip_to_window(forest, tree_id, complete_interior(&reduced));
        splice(forest, tree_id, completed, init, reborrow(&mut replace));
    }
    if let Some(ins) = inspect.as_deref_mut() {
        ins.local_pass_added += 1;
    }

    let size = comm.size();
    if size <= 1 {
        return Ok(());
    }
    let rank = comm.rank();

    // Every owned tree contributes its own first and last leaf as a seed:
    // enough for a rank neighbor to notice a level mismatch across the
    // partition boundary and fold it into its own local balance pass. This
    // is exactly the open-interval gap `complete_region` tiles once both
    // sides agree on their shared endpoint.
    let mut lo_seeds: Vec<(u32, Quadrant<D>)> = Vec::new();
    let mut hi_seeds: Vec<(u32, Quadrant<D>)> = Vec::new();
    for (idx, tree) in forest.trees.iter().enumerate() {
        if let Some(q) = tree.first_descendant() {
            lo_seeds.push((idx as u32, q));
        }
        if let Some(q) = tree.last_descendant() {
            hi_seeds.push((idx as u32, q));
        }
    }

    if rank > 0 {
        comm.send_bytes(rank - 1, BALANCE_SORT_SORT, &encode(&lo_seeds));
    }
    if rank + 1 < size {
        comm.send_bytes(rank + 1, BALANCE_SORT_NEIGH, &encode(&hi_seeds));
    }

    let mut incoming: Vec<(u32, Quadrant<D>)> = Vec::new();
    if rank + 1 < size {
        incoming.extend(decode::<D>(&comm.recv_bytes(rank + 1, BALANCE_SORT_SORT)));
    }
    if rank > 0 {
        incoming.extend(decode::<D>(&comm.recv_bytes(rank - 1, BALANCE_SORT_NEIGH)));
    }
    tracing::trace!(rank, seeds = incoming.len(), "balance_sort: seed exchange with rank neighbors");
    if let Some(ins) = inspect.as_deref_mut() {
        ins.first_round_received += (incoming.len() * record_size::<D>()) as u64;
    }

    let by_tree: std::collections::HashMap<u32, Vec<Quadrant<D>>> =
        incoming.into_iter().into_group_map();

    for (tree_id, seeds) in by_tree {
        if forest.trees[tree_id as usize].is_empty() {
            continue;
        }
        let mut input: Vec<Quadrant<D>> = forest.trees[tree_id as usize]
            .leaves()
            .iter()
            .map(|l| l.quadrant)
            .collect();
        input.extend(seeds);
        input.sort();
        input.dedup();

        let root = Quadrant::root();
        let reduced = local::run(root, &input, forest.connect_type);
        let completed = clip_to_window(forest, tree_id, complete_interior(&reduced));
        splice(forest, tree_id, completed, init, reborrow(&mut replace));
    }
    tracing::debug!(rank, "balance_sort: merge complete");
    if let Some(ins) = inspect.as_deref_mut() {
        ins.merge_passes += 1;
    }

    Ok(())
}
