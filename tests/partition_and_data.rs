//! Weighted-partition balance and refine/coarsen data-preservation scenarios
//! (spec.md §8 scenarios 4 and 5).

use std::sync::Arc;
use std::thread;

use forest_amr::comm::sim::Network;
use forest_amr::{ops, ConnectType, Connectivity, Forest, Quadrant, ReplaceFn};

#[test]
fn weighted_partition_keeps_every_rank_within_one_leaf_of_ideal() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let net = Network::new(4);
    let mut handles = Vec::new();
    for rank in 0..4 {
        let conn = Arc::clone(&conn);
        let comm = net.endpoint(rank);
        handles.push(thread::spawn(move || {
            let mut forest: Forest<2, u64> = Forest::new(conn, rank, 4, 64, ConnectType::Face);
            let mut init = |_t: u32, q: &Quadrant<2>| q.linear_id(q.level) as u64;
            let leaves: Vec<Quadrant<2>> = forest.trees[0].leaves().iter().map(|l| l.quadrant).collect();
            let mut data_leaves = Vec::with_capacity(leaves.len());
            for q in leaves {
                let idx = forest.data.alloc(init(0, &q));
                data_leaves.push(forest_amr::Leaf { quadrant: q, data: Some(idx) });
            }
            forest.trees[0].rebuild_from_sorted(data_leaves);

            let mut weight = |_t: u32, q: &Quadrant<2>, _d: Option<&u64>| {
                if q.linear_id(q.level) % 2 == 0 { 1 } else { 3 }
            };
            ops::partition(&mut forest, &comm, false, Some(&mut weight)).unwrap();

            let mut total_weight = 0u64;
            for tree in &forest.trees {
                for leaf in tree.leaves() {
                    total_weight += weight(0, &leaf.quadrant, None);
                }
            }
            total_weight
        }));
    }
    let weights: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let grand_total: u64 = weights.iter().sum();
    let ideal = grand_total / 4;
    for w in weights {
        let diff = (w as i64 - ideal as i64).abs();
        assert!(diff <= 3, "rank weight {w} too far from ideal {ideal}");
    }
}

#[test]
fn refine_then_coarsen_round_trip_preserves_the_pre_refinement_value() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let mut forest: Forest<2, u64> = Forest::new(conn, 0, 1, 1, ConnectType::Full);

    let root_quadrant = forest.trees[0].leaves()[0].quadrant;
    // spec.md §8 scenario 5: the payload is the leaf's own 8-byte Morton id.
    let pre_refine_value: u64 = root_quadrant.linear_id(root_quadrant.level) as u64;
    let idx = forest.data.alloc(pre_refine_value);
    forest.trees[0].rebuild_from_sorted(vec![forest_amr::Leaf {
        quadrant: root_quadrant,
        data: Some(idx),
    }]);

    let mut init = |_t: u32, _q: &Quadrant<2>| 0u64;
    let mut refine_root = |_t: u32, q: &Quadrant<2>, _d: Option<&u64>| q.level == 0;
    let mut split_evenly = |_t: u32, outgoing: &[(Quadrant<2>, u64)], incoming: &[Quadrant<2>]| {
        let share = outgoing[0].1 / incoming.len() as u64;
        vec![share; incoming.len()]
    };
    ops::refine(
        &mut forest,
        false,
        1,
        &mut refine_root,
        &mut init,
        Some(&mut split_evenly as &mut dyn ReplaceFn<2, u64>),
    );
    assert_eq!(forest.trees[0].len(), 4);

    let mut coarsen_all = |_t: u32, _q: &[Quadrant<2>], _d: &[Option<&u64>]| true;
    let mut sum_replace = |_t: u32, outgoing: &[(Quadrant<2>, u64)], incoming: &[Quadrant<2>]| {
        let total: u64 = outgoing.iter().map(|(_, d)| *d).sum();
        vec![total; incoming.len()]
    };
    ops::coarsen(
        &mut forest,
        true,
        &mut coarsen_all,
        &mut init,
        Some(&mut sum_replace as &mut dyn ReplaceFn<2, u64>),
    );

    assert_eq!(forest.trees[0].len(), 1);
    let remaining = forest.trees[0].leaves()[0];
    let data = *forest.data.get(remaining.data.unwrap()).unwrap();
    assert_eq!(data, pre_refine_value);
}
