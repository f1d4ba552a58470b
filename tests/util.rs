#![allow(dead_code)]
use cascade_partitioner::algs::communicator::RayonComm;
use cascade_partitioner::partitioning::{LoadCollection, WorkItems};

/// Run `f` once per rank of a fresh threaded world and collect the results
/// in rank order.
pub fn run_world<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    let world = RayonComm::world(size);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// `n` unit-weight items with ids starting at `first_id`.
pub fn units(n: u64, first_id: u64) -> WorkItems {
    WorkItems::from_items((first_id..first_id + n).map(|id| (id, 1.0)))
}

pub fn sums(loads: &[WorkItems]) -> Vec<f64> {
    loads.iter().map(LoadCollection::sum_load).collect()
}

/// All item ids across ranks, sorted.
pub fn all_ids(loads: &[WorkItems]) -> Vec<u64> {
    let mut ids: Vec<u64> = loads.iter().flat_map(|l| l.iter().map(|(id, _)| id)).collect();
    ids.sort_unstable();
    ids
}
