mod util;

use cascade_partitioner::algs::communicator::CommTag;
use cascade_partitioner::prelude::*;
use util::{all_ids, run_world, sums, units};

fn balance_world(
    initial: Vec<WorkItems>,
    params: CascadeParams,
) -> (Vec<WorkItems>, Vec<BalanceStats>) {
    let initial = &initial;
    let params = &params;
    run_world(initial.len(), |comm| {
        let mut load = initial[comm.rank()].clone();
        let p = CascadePartitioner::new(comm, params.clone()).unwrap();
        let stats = p.balance(&mut load).unwrap();
        (load, stats)
    })
    .into_iter()
    .unzip()
}

#[test]
fn two_ranks_split_evenly() {
    let (loads, stats) = balance_world(vec![units(4, 0), WorkItems::new()], CascadeParams::default());
    assert_eq!(sums(&loads), vec![2.0, 2.0]);
    assert_eq!(stats[0].shipments_sent, 1);
    assert_eq!(stats[0].work_sent, 2.0);
    assert_eq!(stats[1].shipments_received, 1);
    assert_eq!(stats[1].net_work(), 2.0);
    assert_eq!(all_ids(&loads), vec![0, 1, 2, 3]);
}

#[test]
fn surplus_equal_to_tolerance_stays_put() {
    let initial = || vec![units(3, 0), units(1, 3)];
    let at = CascadeParams {
        load_comparison_tol: 1.0,
        ..Default::default()
    };
    let (loads, stats) = balance_world(initial(), at);
    assert_eq!(sums(&loads), vec![3.0, 1.0]);
    assert!(stats.iter().all(|s| s.shipments_sent == 0));

    let below = CascadeParams {
        load_comparison_tol: 0.999,
        ..Default::default()
    };
    let (loads, _) = balance_world(initial(), below);
    assert_eq!(sums(&loads), vec![2.0, 2.0]);
    assert_eq!(all_ids(&loads), vec![0, 1, 2, 3]);
}

#[test]
fn four_ranks_from_the_last() {
    let initial = vec![WorkItems::new(), WorkItems::new(), WorkItems::new(), units(8, 0)];
    let (loads, stats) = balance_world(initial, CascadeParams::default());
    assert_eq!(sums(&loads), vec![2.0; 4]);
    assert!(stats.iter().all(|s| s.generations == 2));
}

#[test]
fn divisible_work_reaches_the_average() {
    let mut initial = vec![WorkItems::from_items([(0, 10.0)]).with_cut_granularity(0.0)];
    initial.extend((1..8).map(|_| WorkItems::new().with_cut_granularity(0.0)));
    let params = CascadeParams {
        load_comparison_tol: 0.01,
        flexible_load_tol: 0.0,
        ..Default::default()
    };
    let (loads, _) = balance_world(initial, params);
    for (rank, w) in sums(&loads).into_iter().enumerate() {
        assert!((w - 1.25).abs() <= 0.01, "rank {rank} holds {w}");
    }
}

#[test]
fn odd_worlds_balance_from_either_end() {
    for p in [3usize, 5, 7, 9, 11, 13] {
        let total = 3 * p as u64;
        for heavy in [0, p - 1] {
            let initial: Vec<WorkItems> = (0..p)
                .map(|r| if r == heavy { units(total, 0) } else { WorkItems::new() })
                .collect();
            let (loads, _) = balance_world(initial, CascadeParams::default());
            assert_eq!(sums(&loads), vec![3.0; p], "P = {p}, heavy rank {heavy}");
            assert_eq!(all_ids(&loads), (0..total).collect::<Vec<_>>());
        }
    }
}

#[test]
fn balanced_input_is_left_alone() {
    let initial: Vec<WorkItems> = (0..6).map(|r| units(2, 10 * r)).collect();
    let (loads, stats) = balance_world(initial.clone(), CascadeParams::default());
    assert_eq!(loads, initial);
    assert!(stats.iter().all(|s| s.shipments_sent == 0 && s.shipments_received == 0));
}

#[test]
fn second_pass_changes_nothing() {
    let initial: Vec<WorkItems> = (0..5u64).map(|r| units(2 * r + 1, 100 * r)).collect();
    let (once, _) = balance_world(initial, CascadeParams::default());
    let (twice, _) = balance_world(once.clone(), CascadeParams::default());
    assert_eq!(twice, once);
}

#[test]
fn every_flag_combination_conserves_work() {
    let initial: Vec<WorkItems> = (0..7u64).map(|r| units((r * 5) % 7, 100 * r)).collect();
    let before = all_ids(&initial);
    for intermediate in [false, true] {
        for reset in [false, true] {
            for limit in [false, true] {
                let params = CascadeParams {
                    balance_intermediate_groups: intermediate,
                    reset_obligations: reset,
                    limit_supply_to_surplus: limit,
                    ..Default::default()
                };
                let (loads, _) = balance_world(initial.clone(), params);
                assert_eq!(all_ids(&loads), before);
                assert_eq!(sums(&loads).iter().sum::<f64>(), before.len() as f64);
            }
        }
    }
}

#[test]
fn small_first_chunks_still_deliver_shipments() {
    let params = CascadeParams {
        first_data_len: 3,
        ..Default::default()
    };
    let (loads, _) = balance_world(vec![WorkItems::new(), units(40, 0)], params);
    assert_eq!(sums(&loads), vec![20.0, 20.0]);
}

#[test]
fn explicit_average_and_gathered_stats() {
    let initial: Vec<WorkItems> = vec![units(6, 0), units(2, 6), WorkItems::new(), units(4, 8)];
    let initial = &initial;
    let after = run_world(4, |comm| {
        let mut load = initial[comm.rank()].clone();
        let p = CascadePartitioner::new(comm, CascadeParams::default()).unwrap();
        p.distribute_load(&mut load, 3.0).unwrap();
        LoadStats::gather(comm, CommTag::new(0x6000), load.sum_load()).unwrap()
    });
    for s in after {
        assert_eq!(s.total, 12.0);
        assert_eq!((s.min, s.max), (3.0, 3.0));
        assert_eq!(s.imbalance(), 1.0);
    }
}
