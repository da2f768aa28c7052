//! Balance — ghost-layer protocol (spec.md §4.5), the default distributed
//! balance variant: a local pass over every owned tree, a first exchange
//! carrying each boundary leaf to whichever rank owns the territory next to
//! it, a response exchange carrying back whatever that merge forced into
//! existence, and a final merge-and-complete. Two rounds suffice because one
//! pass of local balance can only ever force refinement by a single level
//! past what the first round already reported (the same bound spec.md §4.4
//! relies on for within-tree balance).

use std::collections::{HashMap, HashSet};

use crate::balance::{clip_to_window, local};
use crate::callbacks::{InitFn, ReplaceFn};
use crate::completion::{complete_interior, splice};
use crate::constants::tags::{BALANCE_FIRST_LOAD, BALANCE_SECOND_LOAD};
use crate::constants::ROOT_LEN;
use crate::comm::Communicator;
use crate::error::ForestResult;
use crate::inspect::Inspect;
use crate::types::connectivity::Connectivity;
use crate::types::forest::Forest;
use crate::types::quadrant::{ConnectType, Quadrant};

/// A leaf in transit between ranks during balance: the quadrant, already
/// expressed in the *destination* tree's local frame, plus enough of its
/// provenance (`from_tree`/`codim`/`from_feature`) for the receiver to know
/// which of its own neighbor records to apply if it ever needs to transform
/// something back the other way. Kept separate from [`crate::types::tree::Leaf`]
/// rather than folding these fields into it permanently (spec.md §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedQuadrant<const D: usize> {
    pub quadrant: Quadrant<D>,
    pub to_tree: u32,
    pub from_tree: u32,
    pub codim: usize,
    pub from_feature: u8,
}

fn record_size<const D: usize>() -> usize {
    1 + 8 * D + 4 + 4 + 1 + 1
}

fn encode<const D: usize>(items: &[TaggedQuadrant<D>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(items.len() * record_size::<D>());
    for t in items {
        buf.push(t.quadrant.level);
        for c in t.quadrant.coords {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf.extend_from_slice(&t.to_tree.to_le_bytes());
        buf.extend_from_slice(&t.from_tree.to_le_bytes());
        buf.push(t.codim as u8);
        buf.push(t.from_feature);
    }
    buf
}

fn decode<const D: usize>(bytes: &[u8]) -> Vec<TaggedQuadrant<D>> {
    let rs = record_size::<D>();
    debug_assert_eq!(bytes.len() % rs, 0, "malformed ghost record stream");
    bytes
        .chunks(rs)
        .map(|chunk| {
            let level = chunk[0];
            let mut coords = [0i64; D];
            let mut off = 1;
            for c in coords.iter_mut() {
                *c = i64::from_le_bytes(chunk[off..off + 8].try_into().unwrap());
                off += 8;
            }
            let to_tree = u32::from_le_bytes(chunk[off..off + 4].try_into().unwrap());
            off += 4;
            let from_tree = u32::from_le_bytes(chunk[off..off + 4].try_into().unwrap());
            off += 4;
            let codim = chunk[off] as usize;
            off += 1;
            let from_feature = chunk[off];
            TaggedQuadrant {
                quadrant: Quadrant { level, coords },
                to_tree,
                from_tree,
                codim,
                from_feature,
            }
        })
        .collect()
}

/// Which face/edge/corner of the root a neighbor produced by
/// `Quadrant::insulation_neighbors` stepped out through, inferred purely
/// from which of its coordinates fall outside `[0, ROOT_LEN)` — consistent
/// with the conventions `face_neighbor`/`corner_neighbor`/`edge_neighbor`
/// use to build those same neighbors in the first place.
fn exit_feature<const D: usize>(n: &Quadrant<D>) -> (usize, u8) {
    let off_axes: Vec<usize> = (0..D)
        .filter(|&i| n.coords[i] < 0 || n.coords[i] >= ROOT_LEN)
        .collect();
    match off_axes.len() {
        1 => {
            let axis = off_axes[0];
            let face = if n.coords[axis] < 0 { axis * 2 } else { axis * 2 + 1 };
            (1, face as u8)
        }
        d if d == D => {
            let mut corner = 0usize;
            for (i, &c) in n.coords.iter().enumerate() {
                if c >= ROOT_LEN {
                    corner |= 1 << i;
                }
            }
            (D, corner as u8)
        }
        2 => {
            let free_axis = (0..D).find(|i| !off_axes.contains(i)).unwrap();
            let mut combo = 0usize;
            let mut bit = 0;
            for i in 0..D {
                if i == free_axis {
                    continue;
                }
                if n.coords[i] >= ROOT_LEN {
                    combo |= 1 << bit;
                }
                bit += 1;
            }
            (2, (free_axis * 4 + combo) as u8)
        }
        other => unreachable!(
            "an insulation neighbor must leave the root through 1, 2 (3D edge) or D axes, got {other}"
        ),
    }
}

/// Phase A: for every owned leaf, walk its insulation neighbors (filtered by
/// `max_codim`) and, for whichever ones fall in territory someone else
/// owns, schedule that leaf to be sent to them — transformed into the
/// neighboring tree's frame when the neighbor crosses a tree boundary.
/// `restrict_to`, when given, keeps only sends to ranks in that set (used by
/// Phase C, which only owes a response to round-1 senders).
///
/// Self is skipped only when the neighbor stays within the same tree — a
/// same-tree, same-rank neighbor is already part of this rank's own owned
/// leaves and gets folded in by the local pass. A neighbor that crosses a
/// tree boundary is kept even when it maps back onto this rank's own
/// territory in the neighboring tree, mirroring `p4est_balance_schedule`'s
/// `if (owner == rank && !inter_tree) continue;`: two distinctly-indexed
/// trees can be owned by the same rank, and the boundary transform must
/// still run. These self-destined records are returned separately since
/// they never go over the wire.
fn schedule<const D: usize, T>(
    forest: &Forest<D, T>,
    max_codim: usize,
    restrict_to: Option<&HashSet<i32>>,
) -> (HashMap<i32, Vec<TaggedQuadrant<D>>>, Vec<TaggedQuadrant<D>>) {
    let mut out: HashMap<i32, Vec<TaggedQuadrant<D>>> = HashMap::new();
    let mut self_items: Vec<TaggedQuadrant<D>> = Vec::new();
    let wants = |rank: i32| match restrict_to {
        Some(set) => set.contains(&rank),
        None => true,
    };

    for (idx, tree) in forest.trees.iter().enumerate() {
        let tree_id = idx as u32;
        for leaf in tree.leaves() {
            let q = leaf.quadrant;
            for (n, codim) in q.insulation_neighbors() {
                if codim > max_codim {
                    continue;
                }
                if n.is_valid() {
                    let owner = forest.owner_of(tree_id, &n);
                    if owner != forest.rank && wants(owner) {
                        out.entry(owner).or_default().push(TaggedQuadrant {
                            quadrant: q,
                            to_tree: tree_id,
                            from_tree: tree_id,
                            codim,
                            from_feature: 0,
                        });
                    }
                    continue;
                }
                let (feat_codim, feature) = exit_feature(&n);
                for record in forest
                    .connectivity
                    .records_for_feature(tree_id, feat_codim, feature)
                {
                    let transformed = Connectivity::utransform(&q, record);
                    let owner = forest.owner_of(record.neighbor_tree, &transformed);
                    let tagged = TaggedQuadrant {
                        quadrant: transformed,
                        to_tree: record.neighbor_tree,
                        from_tree: tree_id,
                        codim: record.codim,
                        from_feature: record.local_feature,
                    };
                    if owner == forest.rank {
                        self_items.push(tagged);
                    } else if wants(owner) {
                        out.entry(owner).or_default().push(tagged);
                    }
                }
            }
        }
    }

    for v in out.values_mut() {
        v.sort_by_key(|t| (t.to_tree, t.quadrant));
        v.dedup_by_key(|t| (t.to_tree, t.quadrant));
    }
    self_items.sort_by_key(|t| (t.to_tree, t.quadrant));
    self_items.dedup_by_key(|t| (t.to_tree, t.quadrant));
    (out, self_items)
}

/// Reborrow a `Option<&mut dyn Trait>` for one call without moving it out of
/// the caller's binding, so the same optional callback can be threaded
/// through a loop of `splice` calls.
fn reborrow<'a, const D: usize, T>(
    r: &'a mut Option<&mut dyn ReplaceFn<D, T>>,
) -> Option<&'a mut dyn ReplaceFn<D, T>> {
    r.as_mut().map(|cb| &mut **cb as &mut dyn ReplaceFn<D, T>)
}

/// Fold a batch of received tagged quadrants, grouped by destination tree,
/// into the owning trees and re-run local balance + completion on every
/// tree that received anything. `self_items` carries records `schedule`
/// addressed back to this same rank across a tree boundary — they never
/// travel through `comm`, but still need the same merge treatment as
/// anything that did. Returns the set of touched tree ids, for the caller
/// to fold into `inspect`.
fn merge_round<const D: usize, T>(
    forest: &mut Forest<D, T>,
    received: Vec<(i32, Vec<u8>)>,
    self_items: Vec<TaggedQuadrant<D>>,
    init: &mut impl InitFn<D, T>,
    mut replace: Option<&mut dyn ReplaceFn<D, T>>,
) -> HashSet<u32> {
    let mut by_tree: HashMap<u32, Vec<Quadrant<D>>> = HashMap::new();
    for tagged in self_items {
        by_tree.entry(tagged.to_tree).or_default().push(tagged.quadrant);
    }
    for (_, bytes) in received {
        for tagged in decode::<D>(&bytes) {
            by_tree.entry(tagged.to_tree).or_default().push(tagged.quadrant);
        }
    }

    let mut touched = HashSet::new();
    for (tree_id, incoming) in by_tree {
        let mut input: Vec<Quadrant<D>> = forest.trees[tree_id as usize]
            .leaves()
            .iter()
            .map(|l| l.quadrant)
            .collect();
        input.extend(incoming);
        input.sort();
        input.dedup();

        let root = Quadrant::root();
        let reduced = local::run(root, &input, forest.connect_type);
        let completed = clip_to_window(forest, tree_id, complete_interior(&reduced));
        splice(forest, tree_id, completed, init, reborrow(&mut replace));
        touched.insert(tree_id);
    }
    touched
}

/// The default distributed balance entry point (spec.md §4.5). Runs a local
/// pass over every owned tree, exchanges boundary leaves with neighboring
/// owners in two rounds, merges what comes back, and leaves every owned
/// tree 2:1-balanced with respect to the rest of the forest as currently
/// partitioned.
pub fn balance_ghost<const D: usize, T, C: Communicator>(
    forest: &mut Forest<D, T>,
    comm: &C,
    init: &mut impl InitFn<D, T>,
    mut replace: Option<&mut dyn ReplaceFn<D, T>>,
    inspect: &mut Option<&mut Inspect>,
) -> ForestResult<()> {
    let max_codim = forest.connect_type.max_codim(D);
    tracing::debug!(rank = forest.rank, trees = forest.trees.len(), "balance_ghost: local pass");

    // Phase A: local pass over every owned tree before anything is sent, so
    // peers receive already-graded boundary leaves.
    for idx in 0..forest.trees.len() {
        let tree_id = idx as u32;
        let root = Quadrant::root();
        let leaves: Vec<Quadrant<D>> = forest.trees[idx].leaves().iter().map(|l| l.quadrant).collect();
        let reduced = local::run(root, &leaves, forest.connect_type);
        let completed = clip_to_window(forest, tree_id, complete_interior(&reduced));
        splice(forest, tree_id, completed, init, reborrow(&mut replace));
    }
    if let Some(ins) = inspect.as_deref_mut() {
        ins.local_pass_added += 1;
    }

    // Phase B: first exchange.
    let (first_schedule, first_self_items) = schedule(forest, max_codim, None);
    let dest_ranks: Vec<i32> = first_schedule.keys().copied().collect();
    tracing::trace!(rank = forest.rank, peers = dest_ranks.len(), "balance_ghost: first exchange notify");
    let incoming_senders = comm.notify(&dest_ranks);
    let first_sends: Vec<(i32, Vec<u8>)> = first_schedule
        .iter()
        .map(|(rank, items)| (*rank, encode(items)))
        .collect();
    if let Some(ins) = inspect.as_deref_mut() {
        ins.first_round_sent += first_sends.iter().map(|(_, b)| b.len() as u64).sum::<u64>();
    }
    let first_received = comm.exchange(
        &first_sends,
        &incoming_senders,
        BALANCE_FIRST_LOAD,
        record_size::<D>(),
    )?;
    tracing::trace!(
        rank = forest.rank,
        senders = incoming_senders.len(),
        bytes = first_received.iter().map(|(_, b)| b.len()).sum::<usize>(),
        "balance_ghost: first exchange received"
    );
    if let Some(ins) = inspect.as_deref_mut() {
        ins.first_round_received += first_received.iter().map(|(_, b)| b.len() as u64).sum::<u64>();
    }

    merge_round(forest, first_received, first_self_items, init, reborrow(&mut replace));
    tracing::debug!(rank = forest.rank, "balance_ghost: first merge complete");
    if let Some(ins) = inspect.as_deref_mut() {
        ins.merge_passes += 1;
    }

    // Phase C: response. Re-schedule over the post-merge state, but only
    // respond to ranks that sent us something in round one — by
    // construction (spec.md §4.5) one more pass is always enough, so the
    // set of ranks we now owe a reply to is exactly that set; we do not
    // issue a second `notify`, assuming the relationship is symmetric (see
    // DESIGN.md).
    let incoming_set: HashSet<i32> = incoming_senders.iter().copied().collect();
    let (second_schedule, second_self_items) = schedule(forest, max_codim, Some(&incoming_set));
    let second_sends: Vec<(i32, Vec<u8>)> = second_schedule
        .iter()
        .map(|(rank, items)| (*rank, encode(items)))
        .collect();
    tracing::trace!(rank = forest.rank, peers = second_sends.len(), "balance_ghost: response exchange");
    if let Some(ins) = inspect.as_deref_mut() {
        ins.second_round_sent += second_sends.iter().map(|(_, b)| b.len() as u64).sum::<u64>();
    }
    let second_received = comm.exchange(
        &second_sends,
        &dest_ranks,
        BALANCE_SECOND_LOAD,
        record_size::<D>(),
    )?;
    if let Some(ins) = inspect.as_deref_mut() {
        ins.second_round_received += second_received.iter().map(|(_, b)| b.len() as u64).sum::<u64>();
    }

    merge_round(forest, second_received, second_self_items, init, reborrow(&mut replace));
    tracing::debug!(rank = forest.rank, "balance_ghost: second merge complete");
    if let Some(ins) = inspect.as_deref_mut() {
        ins.merge_passes += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::sim::Network;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exit_feature_round_trips_with_face_neighbor_in_2d() {
        let q = Quadrant::<2> {
            level: 4,
            coords: [0, ROOT_LEN / 2],
        };
        let n = q.face_neighbor(0); // negative-x face
        assert!(!n.is_valid());
        let (codim, feature) = exit_feature(&n);
        assert_eq!(codim, 1);
        assert_eq!(feature, 0);
    }

    #[test]
    fn two_ranks_across_a_shared_corner_converge_to_a_balanced_forest() {
        // spec.md §8 scenario 2: two trees meeting only at a corner, one
        // rank per tree, one side carrying a deep quadrant against the
        // shared corner. Every leaf within the insulation of that corner
        // must come out at level >= 4, and each rank's own tree must satisfy
        // 2:1 on its own.
        let conn = Arc::new(Connectivity::<2>::two_tree_corner());
        let net = Network::new(2);
        let mut handles = Vec::new();
        for rank in 0..2 {
            let conn = Arc::clone(&conn);
            let comm = net.endpoint(rank);
            handles.push(thread::spawn(move || {
                let mut forest: Forest<2, ()> = Forest::new(conn, rank, 2, 4, ConnectType::Full);
                if rank == 0 {
                    // The quadrant in tree 0 touching the shared corner
                    // (every coordinate maximal) refined three levels deep.
                    let corner_leaf = forest.trees[0]
                        .leaves()
                        .iter()
                        .map(|l| l.quadrant)
                        .max_by_key(|q| (q.coords[0], q.coords[1]))
                        .unwrap();
                    let deep = corner_leaf
                        .children_of()[3]
                        .children_of()[3]
                        .children_of()[3];
                    let mut init = |_t: u32, _q: &Quadrant<2>| ();
                    let reduced = local::run(Quadrant::root(), &[deep], ConnectType::Full);
                    let completed = complete_interior(&reduced);
                    splice(&mut forest, 0, completed, &mut init, None);
                }
                let mut init = |_t: u32, _q: &Quadrant<2>| ();
                let mut inspect = Inspect::default();
                let mut inspect_ref = Some(&mut inspect);
                balance_ghost(&mut forest, &comm, &mut init, None, &mut inspect_ref).unwrap();

                let owned_tree = if rank == 0 { 0 } else { 1 };
                let leaves: Vec<Quadrant<2>> = forest.trees[owned_tree]
                    .leaves()
                    .iter()
                    .map(|l| l.quadrant)
                    .collect();
                assert!(
                    local::is_balanced(Quadrant::root(), &leaves, ConnectType::Full),
                    "rank {rank}'s own tree must satisfy 2:1 on its own boundaries"
                );
                (rank, leaves)
            }));
        }

        let results: Vec<(i32, Vec<Quadrant<2>>)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let tree1_leaves = &results.iter().find(|(r, _)| *r == 1).unwrap().1;
        // Tree 1's corner touching the shared corner is the one with every
        // coordinate at 0 (corner index 0, the neighbor side of
        // `two_tree_corner`).
        let max_level_at_corner = tree1_leaves
            .iter()
            .filter(|q| q.coords.iter().all(|&c| c == 0))
            .map(|q| q.level)
            .max()
            .expect("tree 1 must have a leaf at its corner");
        assert!(
            max_level_at_corner >= 4,
            "tree 1's leaf at the shared corner must be refined to level >= 4, got {max_level_at_corner}"
        );
    }

    #[test]
    fn single_rank_owning_both_trees_still_balances_across_the_shared_face() {
        // Regression: a single rank owning an entire multi-tree
        // connectivity must still enforce 2:1 across a tree boundary.
        // `schedule`'s cross-tree branch used to gate every send on
        // `owner != forest.rank`, which silently dropped this case because
        // the neighboring tree's owner is this same sole rank.
        let conn = Arc::new(Connectivity::<2>::two_tree_strip(0));
        let net = Network::new(1);
        let comm = net.endpoint(0);
        let mut forest: Forest<2, ()> = Forest::new(conn, 0, 1, 4, ConnectType::Full);

        // Deep quadrant in tree 0 right against the shared face (positive
        // x, face 1); tree 1 starts uniformly coarse.
        let seam = forest.trees[0]
            .leaves()
            .iter()
            .map(|l| l.quadrant)
            .max_by_key(|q| q.coords[0])
            .unwrap();
        let deep = seam.children_of()[1].children_of()[1].children_of()[1];
        let mut init = |_t: u32, _q: &Quadrant<2>| ();
        let reduced = local::run(Quadrant::root(), &[deep], ConnectType::Full);
        let completed = complete_interior(&reduced);
        splice(&mut forest, 0, completed, &mut init, None);

        let mut init = |_t: u32, _q: &Quadrant<2>| ();
        balance_ghost(&mut forest, &comm, &mut init, None, &mut None).unwrap();

        let near_seam_max_level = forest.trees[1]
            .leaves()
            .iter()
            .filter(|l| l.quadrant.coords[0] == 0)
            .map(|l| l.quadrant.level)
            .max()
            .expect("tree 1 must have a leaf against the shared face");
        assert!(
            near_seam_max_level >= deep.level - 1,
            "tree 1's face against the shared seam never saw tree 0's deep refinement \
             (self-routed cross-tree balance regressed): got level {near_seam_max_level}, want >= {}",
            deep.level - 1
        );
    }
}
