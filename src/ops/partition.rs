//! Partition (spec.md §6): redistribute leaves across processes along the
//! fixed global order (tree-major, Morton within a tree) to equalize load,
//! optionally by a user-supplied weight rather than raw leaf count.
//!
//! Wire transfer here needs a fixed-size byte representation of the user
//! data itself, not just the quadrant (spec.md §6's `new(..., data_size,
//! ...)` already describes user data as a fixed-size block) — this is the
//! one operation in the crate that requires `T: Copy` rather than staying
//! generic over any `T` (see DESIGN.md).

use std::collections::HashMap;

use itertools::Itertools;

use crate::callbacks::WeightFn;
use crate::comm::Communicator;
use crate::constants::tags::{PARTITION_CORRECTION, PARTITION_WEIGHTED_HIGH, PARTITION_WEIGHTED_LOW};
use crate::error::{ForestError, ForestResult};
use crate::types::forest::{Forest, GlobalPosition};
use crate::types::quadrant::Quadrant;
use crate::types::tree::Leaf;

fn to_bytes<T: Copy>(v: &T) -> Vec<u8> {
    let size = std::mem::size_of::<T>();
    let mut buf = vec![0u8; size];
    unsafe {
        std::ptr::copy_nonoverlapping((v as *const T) as *const u8, buf.as_mut_ptr(), size);
    }
    buf
}

fn from_bytes<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), std::mem::size_of::<T>());
    unsafe { std::ptr::read(bytes.as_ptr() as *const T) }
}

fn record_size<const D: usize, T: Copy>() -> usize {
    4 + 1 + 8 * D + std::mem::size_of::<T>()
}

fn encode_leaf<const D: usize, T: Copy>(tree: u32, q: &Quadrant<D>, data: &T) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_size::<D, T>());
    buf.extend_from_slice(&tree.to_le_bytes());
    buf.push(q.level);
    for c in q.coords {
        buf.extend_from_slice(&c.to_le_bytes());
    }
    buf.extend_from_slice(&to_bytes(data));
    buf
}

fn decode_leaves<const D: usize, T: Copy>(bytes: &[u8]) -> Vec<(u32, Quadrant<D>, T)> {
    let rs = record_size::<D, T>();
    debug_assert_eq!(bytes.len() % rs, 0, "malformed partition record stream");
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
            let data = from_bytes::<T>(&chunk[off..]);
            (tree, Quadrant { level, coords }, data)
        })
        .collect()
}

fn encode_position<const D: usize>(pos: &GlobalPosition<D>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + 8 * D);
    buf.extend_from_slice(&pos.tree.to_le_bytes());
    buf.push(pos.quadrant.level);
    for c in pos.quadrant.coords {
        buf.extend_from_slice(&c.to_le_bytes());
    }
    buf
}

fn decode_position<const D: usize>(bytes: &[u8]) -> GlobalPosition<D> {
    let tree = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let level = bytes[4];
    let mut coords = [0i64; D];
    let mut off = 5;
    for c in coords.iter_mut() {
        *c = i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
    }
    GlobalPosition {
        tree,
        quadrant: Quadrant { level, coords },
    }
}

/// Redistribute every owned leaf across `comm` along the fixed global order,
/// equalizing leaf count or — when `weight_cb` is given — total weight
/// (spec.md §6). When `allow_coarsening` is set, a complete sibling family
/// that would otherwise straddle two new owners is instead kept whole on
/// whichever owner already holds most of it, so a later local `coarsen`
/// never needs an inter-process merge. Returns the number of leaves this
/// rank shipped to a different process.
pub fn partition<const D: usize, T: Copy, C: Communicator>(
    forest: &mut Forest<D, T>,
    comm: &C,
    allow_coarsening: bool,
    mut weight_cb: Option<&mut dyn WeightFn<D, T>>,
) -> ForestResult<u64> {
    let size = forest.size as usize;
    let rank = forest.rank;
    tracing::debug!(rank, size, allow_coarsening, "partition: enter");

    let mut local: Vec<(u32, Quadrant<D>, T, u64)> = Vec::new();
    for (idx, tree) in forest.trees.iter().enumerate() {
        let tree_id = idx as u32;
        for leaf in tree.leaves() {
            let data: T = leaf
                .data
                .and_then(|i| forest.data.get(i))
                .copied()
                .expect("every leaf must carry user data going into partition");
            let w = match &mut weight_cb {
                Some(cb) => cb.call(tree_id, &leaf.quadrant, Some(&data)),
                None => 1,
            };
            local.push((tree_id, leaf.quadrant, data, w));
        }
    }

    let local_total: u64 = local.iter().map(|(_, _, _, w)| *w).sum();
    let totals = comm.all_gather_u64(local_total);
    let offset: u64 = totals[..rank as usize].iter().sum();
    let grand_total: u64 = totals.iter().sum();

    // Balanced target boundaries in weight-space: rank p owns
    // `[ideal[p], ideal[p + 1])`, the same `total * p / size` split
    // `Forest::new` uses for leaf-space.
    let ideal: Vec<u64> = (0..=size).map(|p| grand_total * p as u64 / size as u64).collect();

    // Assign each leaf to the owner of the cumulative weight position at its
    // *start*; a leaf is atomic and is never split across two owners.
    let mut running = offset;
    let mut dest_of: Vec<i32> = Vec::with_capacity(local.len());
    for (_, _, _, w) in &local {
        let p = ideal.partition_point(|&b| b <= running).saturating_sub(1);
        dest_of.push((p.min(size - 1)) as i32);
        running += w;
    }

    if allow_coarsening {
        let children = Quadrant::<D>::CHILDREN;
        let mut i = 0usize;
        while i + children <= local.len() {
            let quadrants: Vec<Quadrant<D>> = local[i..i + children].iter().map(|(_, q, _, _)| *q).collect();
            let forms_family =
                quadrants[0].level > 0 && quadrants == quadrants[0].parent().children_of();
            if forms_family {
                let group: Vec<i32> = dest_of[i..i + children].to_vec();
                if group.iter().any(|d| *d != group[0]) {
                    let counts = group.iter().copied().counts();
                    let majority = *counts.iter().max_by_key(|(_, c)| **c).unwrap().0;
                    for d in &mut dest_of[i..i + children] {
                        *d = majority;
                    }
                }
                i += children;
            } else {
                i += 1;
            }
        }
    }

    let mut outgoing: HashMap<i32, Vec<u8>> = HashMap::new();
    let mut kept: Vec<(u32, Quadrant<D>, T)> = Vec::new();
    let mut shipped = 0u64;
    for ((tree_id, q, data, _), dest) in local.into_iter().zip(dest_of) {
        if dest == rank {
            kept.push((tree_id, q, data));
        } else {
            outgoing.entry(dest).or_default().extend(encode_leaf(tree_id, &q, &data));
            shipped += 1;
        }
    }

    let dest_ranks: Vec<i32> = outgoing.keys().copied().collect();
    tracing::trace!(rank, shipped, peers = dest_ranks.len(), "partition: exchange");
    let senders = comm.notify(&dest_ranks);
    // Tag by direction, not by sender identity, so both ends of a message
    // compute the same tag independently: payload moving toward a
    // higher-ranked process is always `HIGH`.
    for (&dest, payload) in &outgoing {
        let tag = if dest > rank { PARTITION_WEIGHTED_HIGH } else { PARTITION_WEIGHTED_LOW };
        comm.send_bytes(dest, tag, payload);
    }
    let record_size = record_size::<D, T>();
    let mut received: Vec<(i32, Vec<u8>)> = Vec::with_capacity(senders.len());
    for &source in &senders {
        let tag = if rank > source { PARTITION_WEIGHTED_HIGH } else { PARTITION_WEIGHTED_LOW };
        let bytes = comm.recv_bytes(source, tag);
        if bytes.len() % record_size != 0 {
            return Err(ForestError::MalformedMessage {
                rank: source,
                got: bytes.len(),
                record_size,
            });
        }
        received.push((source, bytes));
    }

    let mut by_tree: HashMap<u32, Vec<Leaf<D>>> = HashMap::new();
    for (tree_id, q, data) in kept {
        let idx = forest.data.alloc(data);
        by_tree.entry(tree_id).or_default().push(Leaf {
            quadrant: q,
            data: Some(idx),
        });
    }
    for (_, bytes) in received {
        for (tree_id, q, data) in decode_leaves::<D, T>(&bytes) {
            let idx = forest.data.alloc(data);
            by_tree.entry(tree_id).or_default().push(Leaf {
                quadrant: q,
                data: Some(idx),
            });
        }
    }

    for idx in 0..forest.trees.len() {
        let tree_id = idx as u32;
        let old_slots: Vec<usize> = forest.trees[idx].leaves().iter().filter_map(|l| l.data).collect();
        for slot in old_slots {
            forest.data.free(slot);
        }
        let mut leaves = by_tree.remove(&tree_id).unwrap_or_default();
        leaves.sort_by_key(|l| l.quadrant);
        forest.trees[idx].rebuild_from_sorted(leaves);
    }

    forest.global_first_quadrant = ideal;

    // Rewrite `global_first_position`: every rank announces its own new
    // first-owned position to every other rank (spec.md §6 "rewritten
    // atomically at partition boundaries").
    let my_first = forest
        .trees
        .iter()
        .enumerate()
        .find_map(|(idx, t)| {
            t.first_descendant().map(|q| GlobalPosition {
                tree: idx as u32,
                quadrant: q,
            })
        })
        .unwrap_or(GlobalPosition {
            tree: forest.connectivity.num_trees,
            quadrant: Quadrant::root(),
        });
    let encoded = encode_position(&my_first);
    for dest in 0..forest.size {
        if dest != rank {
            comm.send_bytes(dest, PARTITION_CORRECTION, &encoded);
        }
    }
    let mut positions = vec![my_first; size];
    for source in 0..forest.size {
        if source == rank {
            continue;
        }
        let bytes = comm.recv_bytes(source, PARTITION_CORRECTION);
        positions[source as usize] = decode_position(&bytes);
    }
    positions.push(GlobalPosition {
        tree: forest.connectivity.num_trees,
        quadrant: Quadrant::root(),
    });
    forest.global_first_position = positions;

    tracing::debug!(rank, shipped, "partition: exit");
    Ok(shipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::sim::Network;
    use crate::types::connectivity::Connectivity;
    use crate::types::quadrant::ConnectType;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unweighted_partition_keeps_every_leaf_and_balances_counts() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let net = Network::new(3);
        let mut handles = Vec::new();
        for rank in 0..3 {
            let conn = Arc::clone(&conn);
            let comm = net.endpoint(rank);
            handles.push(thread::spawn(move || {
                let mut forest: Forest<2, u64> = Forest::new(conn, rank, 3, 64, ConnectType::Face);
                partition(&mut forest, &comm, false, None).unwrap();
                forest.total_leaves()
            }));
        }
        let mut grand_total_after = 0u64;
        for h in handles {
            grand_total_after += h.join().unwrap();
        }
        assert_eq!(grand_total_after, 64);
    }

    #[test]
    fn weighted_partition_respects_per_leaf_weight() {
        let conn = Arc::new(Connectivity::<2>::single_tree());
        let net = Network::new(2);
        let mut handles = Vec::new();
        for rank in 0..2 {
            let conn = Arc::clone(&conn);
            let comm = net.endpoint(rank);
            handles.push(thread::spawn(move || {
                let mut forest: Forest<2, u64> = Forest::new(conn, rank, 2, 16, ConnectType::Face);
                let mut weight = |_t: u32, q: &Quadrant<2>, _d: Option<&u64>| {
                    if q.linear_id(q.level) % 2 == 0 {
                        1
                    } else {
                        3
                    }
                };
                partition(&mut forest, &comm, false, Some(&mut weight)).unwrap();
                forest.total_leaves()
            }));
        }
        let mut total = 0u64;
        for h in handles {
            total += h.join().unwrap();
        }
        assert_eq!(total, 16);
    }
}
