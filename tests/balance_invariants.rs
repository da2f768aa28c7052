//! End-to-end invariants from spec.md §8, driven through the public API with
//! the in-process simulated communicator (no MPI runtime required).

use std::sync::Arc;
use std::thread;

use forest_amr::balance::local::is_balanced;
use forest_amr::comm::sim::Network;
use forest_amr::{balance, ops, ConnectType, Connectivity, Forest, Inspect, Quadrant};

fn is_sorted_and_tiled<const D: usize, T>(forest: &Forest<D, T>) -> bool {
    forest
        .trees
        .iter()
        .all(|tree| tree.leaves().windows(2).all(|w| w[0].quadrant < w[1].quadrant))
}

#[test]
fn single_rank_balance_is_sorted_tiled_and_two_to_one() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let net = Network::new(1);
    let comm = net.endpoint(0);
    let mut forest: Forest<2, ()> = Forest::new(conn, 0, 1, 64, ConnectType::Face);

    let mut init = |_t: u32, _q: &Quadrant<2>| ();
    let mut refine_corner = |_t: u32, q: &Quadrant<2>, _d: Option<&()>| q.coords == [0, 0] && q.level < 5;
    ops::refine(&mut forest, true, 5, &mut refine_corner, &mut init, None);

    balance(&mut forest, &comm, &mut init, None, None).unwrap();

    assert!(is_sorted_and_tiled(&forest));
    let leaves: Vec<Quadrant<2>> = forest.trees[0].leaves().iter().map(|l| l.quadrant).collect();
    assert!(is_balanced(Quadrant::root(), &leaves, ConnectType::Face));
}

#[test]
fn balance_is_idempotent() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let net = Network::new(1);
    let comm = net.endpoint(0);
    let mut forest: Forest<2, ()> = Forest::new(conn, 0, 1, 16, ConnectType::Full);

    let mut init = |_t: u32, _q: &Quadrant<2>| ();
    let mut refine_one = |_t: u32, q: &Quadrant<2>, _d: Option<&()>| q.linear_id(q.level) == 0 && q.level < 4;
    ops::refine(&mut forest, true, 4, &mut refine_one, &mut init, None);

    balance(&mut forest, &comm, &mut init, None, None).unwrap();
    let once: Vec<Quadrant<2>> = forest.trees[0].leaves().iter().map(|l| l.quadrant).collect();

    balance(&mut forest, &comm, &mut init, None, None).unwrap();
    let twice: Vec<Quadrant<2>> = forest.trees[0].leaves().iter().map(|l| l.quadrant).collect();

    assert_eq!(once, twice, "balance must be idempotent leaf-for-leaf");
}

#[test]
fn balance_never_shrinks_the_leaf_count() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let net = Network::new(1);
    let comm = net.endpoint(0);
    let mut forest: Forest<2, ()> = Forest::new(conn, 0, 1, 4, ConnectType::Full);
    let before = forest.total_leaves();

    let mut init = |_t: u32, _q: &Quadrant<2>| ();
    let mut refine_one = |_t: u32, q: &Quadrant<2>, _d: Option<&()>| q.linear_id(q.level) == 0 && q.level < 4;
    ops::refine(&mut forest, true, 4, &mut refine_one, &mut init, None);

    balance(&mut forest, &comm, &mut init, None, None).unwrap();
    assert!(forest.total_leaves() >= before);
}

#[test]
fn four_rank_balance_keeps_every_rank_sorted_and_grows_the_global_total() {
    let conn = Arc::new(Connectivity::<2>::single_tree());
    let net = Network::new(4);
    let pre_total = {
        let conn = Arc::clone(&conn);
        let forest: Forest<2, ()> = Forest::new(conn, 0, 4, 64, ConnectType::Full);
        let mut total = forest.total_leaves();
        for rank in 1..4 {
            let f: Forest<2, ()> = Forest::new(Arc::clone(&conn), rank, 4, 64, ConnectType::Full);
            total += f.total_leaves();
        }
        total
    };

    let mut handles = Vec::new();
    for rank in 0..4 {
        let conn = Arc::clone(&conn);
        let comm = net.endpoint(rank);
        handles.push(thread::spawn(move || {
            let mut forest: Forest<2, ()> = Forest::new(conn, rank, 4, 64, ConnectType::Full);
            let mut init = |_t: u32, _q: &Quadrant<2>| ();
            let mut refine_some =
                |_t: u32, q: &Quadrant<2>, _d: Option<&()>| q.linear_id(q.level) % 7 == 0 && q.level < 4;
            ops::refine(&mut forest, true, 4, &mut refine_some, &mut init, None);
            let mut inspect = Inspect::default();
            let mut inspect_ref = Some(&mut inspect);
            balance(&mut forest, &comm, &mut init, None, inspect_ref.take()).unwrap();
            assert!(is_sorted_and_tiled(&forest));
            forest.total_leaves()
        }));
    }
    let multi_total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert!(multi_total >= pre_total);
}
