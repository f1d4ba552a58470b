//! Cascading bisection-tree load balancing.
//!
//! A pass walks the *top group* from the root down to the local leaf. For each
//! top group every process first re-summarizes the work below it, bottom-up:
//! at each level it swaps summaries with its contacts in the sibling group so
//! that both halves learn each other's total. Then the two children of the
//! top group are balanced: the half with a surplus ships work to the half
//! with a deficit, pairwise between contacts. After the top group reaches the
//! leaf every process holds roughly the global average.
//!
//! Supply decisions use only information every process of a pair shares, so
//! a sender and its receiver always agree on whether a shipment is coming.
//! Shipments may be empty; receivers that expect one always get one.

use std::time::Instant;

use log::{debug, trace, warn};

use crate::algs::communicator::Communicator;
use crate::algs::reduction::all_reduce_sum;
use crate::algs::wire::WireGroupSummary;
use crate::cascade_error::CascadeError;
use crate::debug_invariants::DebugInvariants;
use crate::partitioning::context::BalanceContext;
use crate::partitioning::load::LoadCollection;
use crate::partitioning::metrics::BalanceStats;
use crate::partitioning::params::CascadeParams;
use crate::partitioning::tree::{CascadeTree, NodeId};

/// Decentralized load balancer over a communicator.
pub struct CascadePartitioner<'a, C: Communicator> {
    comm: &'a C,
    params: CascadeParams,
}

impl<'a, C: Communicator> CascadePartitioner<'a, C> {
    pub fn new(comm: &'a C, params: CascadeParams) -> Result<Self, CascadeError> {
        params.validate()?;
        Ok(Self { comm, params })
    }

    pub fn params(&self) -> &CascadeParams {
        &self.params
    }

    pub fn comm(&self) -> &'a C {
        self.comm
    }

    /// Collective: compute the global average load and rebalance towards it.
    pub fn balance<L: LoadCollection>(&self, local_load: &mut L) -> Result<BalanceStats, CascadeError> {
        let total = all_reduce_sum(self.comm, self.params.tags().reduce, local_load.sum_load())?;
        self.distribute_load(local_load, total / self.comm.size() as f64)
    }

    /// Collective: move work between processes until each holds about
    /// `global_avg`. Every rank must pass the same average.
    pub fn distribute_load<L: LoadCollection>(
        &self,
        local_load: &mut L,
        global_avg: f64,
    ) -> Result<BalanceStats, CascadeError> {
        if !global_avg.is_finite() || global_avg < 0.0 {
            return Err(CascadeError::InvalidGlobalAverage(global_avg));
        }
        let start = Instant::now();
        let (rank, nprocs) = (self.comm.rank(), self.comm.size());
        let mut tree = CascadeTree::new(rank, nprocs, global_avg, local_load.sum_load());
        tree.debug_assert_invariants();

        let mut ctx = BalanceContext::new(self.comm, &self.params, local_load, global_avg);
        tree.distribute_load(&mut ctx)?;
        let mut stats = ctx.finish();
        stats.elapsed = start.elapsed();
        debug!(
            "rank {rank}: pass done in {:?}, net work {:+.6}",
            stats.elapsed,
            stats.net_work()
        );
        Ok(stats)
    }
}

impl CascadeTree {
    pub(crate) fn distribute_load<C: Communicator, L: LoadCollection>(
        &mut self,
        ctx: &mut BalanceContext<'_, C, L>,
    ) -> Result<(), CascadeError> {
        let leaf = self.leaf();
        let mut top = Self::ROOT;
        while top != leaf {
            trace!("rank {}: top group {}", ctx.rank, self.nodes[top]);
            self.recompute_leaf_data(ctx);

            let mut current = self.nodes[leaf].parent;
            while let Some(cur) = current {
                if self.nodes[cur].near == Some(top) {
                    break;
                }
                self.combine_children(cur, ctx)?;
                if ctx.params.reset_obligations && cur == top && self.nodes[top].generation != 0 {
                    let avg = self.nodes[top].work / self.nodes[top].size() as f64;
                    self.reset_obligation(top, avg, ctx.tol());
                    ctx.stats.obligation_resets += 1;
                }
                if ctx.params.balance_intermediate_groups || cur == top {
                    self.balance_children(cur, ctx)?;
                }
                current = self.nodes[cur].parent;
            }

            top = self.near_far(top).0;
            ctx.stats.generations += 1;
        }
        Ok(())
    }

    fn recompute_leaf_data<C: Communicator, L: LoadCollection>(
        &mut self,
        ctx: &BalanceContext<'_, C, L>,
    ) {
        let tol = ctx.tol();
        let id = self.leaf();
        let leaf = &mut self.nodes[id];
        leaf.work = ctx.local_load.sum_load();
        leaf.group_may_supply = leaf.surplus() > tol;
        leaf.process_may_supply[0] = leaf.group_may_supply;
        trace!("rank {}: leaf {leaf}", ctx.rank);
    }

    /// Swap work summaries with the sibling group, then sum both children
    /// into `g`.
    fn combine_children<C: Communicator, L: LoadCollection>(
        &mut self,
        g: NodeId,
        ctx: &mut BalanceContext<'_, C, L>,
    ) -> Result<(), CascadeError> {
        let (near, far) = self.near_far(g);
        let n = &self.nodes[near];
        let summary = WireGroupSummary::new(n.work, n.group_may_supply, n.process_may_supply[0]);
        for slot in 0..2 {
            if let Some(contact) = self.nodes[near].contact[slot] {
                ctx.begin_summary_exchange(slot, contact, &summary)?;
            }
        }

        let f = &mut self.nodes[far];
        f.work = 0.0;
        f.group_may_supply = true;
        while let Some(id) = ctx.stage.next_completed()? {
            if let Some((slot, s)) = ctx.received_summary(id)? {
                let f = &mut self.nodes[far];
                // Every contact reports the same far-group totals.
                f.work = s.work();
                f.group_may_supply = s.group_may_supply();
                f.process_may_supply[slot] = s.process_may_supply();
            }
        }
        assert_eq!(
            ctx.stage.number_of_pending_members(),
            0,
            "summary exchange left members pending"
        );

        let [lo, hi] = self.nodes[g]
            .children
            .unwrap_or_else(|| panic!("group {g} has no children"));
        let tol = ctx.tol();
        let work = self.nodes[lo].work + self.nodes[hi].work;
        let near_pms = self.nodes[near].process_may_supply[0];
        let node = &mut self.nodes[g];
        node.work = work;
        node.group_may_supply = node.surplus() > tol;
        node.process_may_supply[0] = near_pms;
        ctx.stats.combine_steps += 1;
        trace!("rank {}: combined {node}", ctx.rank);
        Ok(())
    }

    /// Move work between the two children of `g`.
    fn balance_children<C: Communicator, L: LoadCollection>(
        &mut self,
        g: NodeId,
        ctx: &mut BalanceContext<'_, C, L>,
    ) -> Result<(), CascadeError> {
        assert!(
            ctx.shipment_is_empty(),
            "shipment not empty before balancing"
        );
        let tol = ctx.tol();
        let (near, far) = self.near_far(g);
        let near_surplus = self.nodes[near].surplus();
        let far_surplus = self.nodes[far].surplus();
        ctx.stats.balance_steps += 1;

        if near_surplus > tol && far_surplus < -tol {
            if self.nodes[near].process_may_supply[0] {
                let taker = self.nodes[near].contact[0]
                    .unwrap_or_else(|| panic!("near group of {g} has no contact"));
                let supplied = self.supply_work(near, -far_surplus, taker, ctx);
                trace!(
                    "rank {}: supplying {supplied:.6} of {:.6} to {taker}",
                    ctx.rank, -far_surplus
                );
                let f = &mut self.nodes[far];
                f.work += supplied;
                f.group_may_supply = false;
                f.process_may_supply = [false; 2];
                ctx.send_shipment(taker)?;
            } else {
                trace!("rank {}: near group supplies, this process has nothing", ctx.rank);
            }
        } else if far_surplus > tol && near_surplus < -tol {
            let (nsize, fsize) = (self.nodes[near].size(), self.nodes[far].size());
            // The extra rank of an odd split is already covered by the last
            // lower rank, which also receives on its behalf.
            let redundant = nsize > fsize && ctx.rank == self.nodes[g].end - 1;
            let far_pms = self.nodes[far].process_may_supply;
            let mut expecting = false;
            if self.nodes[far].group_may_supply && !redundant {
                for slot in 0..2 {
                    if far_pms[slot] {
                        let from = self.nodes[near].contact[slot]
                            .unwrap_or_else(|| panic!("no contact {slot} in near group of {g}"));
                        ctx.expect_shipment(slot, from)?;
                        expecting = true;
                    }
                }
            }
            let rank = ctx.rank;
            let supplied = self.supply_work(far, -near_surplus, rank, ctx);
            trace!(
                "rank {rank}: demanding {:.6}, far group supplies {supplied:.6}",
                -near_surplus
            );
            let n = &mut self.nodes[near];
            n.work += supplied;
            n.group_may_supply = false;
            n.process_may_supply[0] = false;
            if expecting {
                ctx.receive_and_unpack_supplied_load()?;
            }
        } else {
            trace!("rank {}: children of {g} neither supply nor demand", ctx.rank);
        }

        ctx.settle()
    }

    /// Take up to `requested` work out of `g` towards `taker`, which is not in
    /// `g`. Only the local leaf really moves work, into the shipment; every
    /// other group just updates its estimate. Returns the estimated amount.
    pub(crate) fn supply_work<C: Communicator, L: LoadCollection>(
        &mut self,
        g: NodeId,
        requested: f64,
        taker: usize,
        ctx: &mut BalanceContext<'_, C, L>,
    ) -> f64 {
        let tol = ctx.tol();
        {
            let n = &self.nodes[g];
            assert!(requested > 0.0, "supply request {requested} is not positive");
            assert!(!n.contains(taker), "group {n} would supply itself");
            assert!(
                n.contains(ctx.rank) || n.children.is_none(),
                "remote group {n} was split"
            );
            assert_eq!(
                n.group_may_supply,
                n.surplus() > tol,
                "stale may-supply flag on {n}"
            );
        }

        let mut estimate = 0.0;
        if self.nodes[g].group_may_supply {
            let n = &self.nodes[g];
            let allowed = requested.min(if ctx.params.limit_supply_to_surplus {
                n.surplus()
            } else {
                n.work
            });

            if let Some([lo, hi]) = n.children {
                // Draw from the child closer to the taker first.
                let (first, second) = if taker < n.begin { (lo, hi) } else { (hi, lo) };
                for child in [first, second] {
                    let want = allowed - estimate;
                    if want <= 0.0 || !self.nodes[child].group_may_supply {
                        continue;
                    }
                    estimate += self.supply_work(child, want, taker, ctx);
                }
            } else {
                estimate = allowed;
                if g == self.leaf() {
                    let flex = ctx.flex();
                    let moved = ctx.shipment.adjust_load(
                        ctx.local_load,
                        estimate,
                        estimate - flex,
                        estimate + flex,
                    );
                    debug!(
                        "rank {}: packed {moved:.6} of {estimate:.6} work for {taker}",
                        ctx.rank
                    );
                    if moved < estimate - flex - tol {
                        warn!(
                            "rank {}: could only pack {moved:.6} of requested {estimate:.6}",
                            ctx.rank
                        );
                    }
                }
            }

            let is_leaf = g == self.leaf();
            let n = &mut self.nodes[g];
            n.work -= estimate;
            if is_leaf {
                n.process_may_supply[0] = ctx.local_load.sum_load() - n.obligation > tol;
            }
            n.group_may_supply = n.surplus() > tol;
        }
        estimate
    }

    /// Set obligations of `g` and its descendants to `avg` per process.
    pub(crate) fn reset_obligation(&mut self, g: NodeId, avg: f64, tol: f64) {
        let n = &mut self.nodes[g];
        n.obligation = avg * n.size() as f64;
        n.group_may_supply = n.surplus() > tol;
        trace!("reset obligation of {n}");
        if let Some(children) = n.children {
            for child in children {
                self.reset_obligation(child, avg, tol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::partitioning::load::WorkItems;

    #[test]
    fn single_process_is_a_no_op() {
        let mut load = WorkItems::from_items([(0, 5.0), (1, 2.0)]);
        let before = load.clone();
        let p = CascadePartitioner::new(&NoComm, CascadeParams::default()).unwrap();
        let stats = p.balance(&mut load).unwrap();
        assert_eq!(load, before);
        assert_eq!(stats.generations, 0);
        assert_eq!(stats.shipments_sent + stats.shipments_received, 0);
    }

    #[test]
    fn rejects_bad_average() {
        let p = CascadePartitioner::new(&NoComm, CascadeParams::default()).unwrap();
        let mut load = WorkItems::new();
        for avg in [f64::NAN, -1.0, f64::INFINITY] {
            assert!(matches!(
                p.distribute_load(&mut load, avg),
                Err(CascadeError::InvalidGlobalAverage(_))
            ));
        }
    }

    #[test]
    fn rejects_bad_params() {
        let params = CascadeParams {
            first_data_len: 0,
            ..Default::default()
        };
        assert!(matches!(
            CascadePartitioner::new(&NoComm, params),
            Err(CascadeError::InvalidParams(_))
        ));
    }

    #[test]
    fn obligation_reset_reaches_every_descendant() {
        let mut t = CascadeTree::new(0, 8, 1.0, 0.0);
        let top = t.near_far(CascadeTree::ROOT).0;
        t.nodes[top].work = 6.0;
        t.reset_obligation(top, 1.5, 1e-9);
        for id in t.near_path().into_iter().skip(1) {
            let n = t.node(id);
            assert_eq!(n.obligation(), 1.5 * n.size() as f64);
            if let Some(far) = n.far() {
                assert_eq!(t.node(far).obligation(), 1.5 * t.node(far).size() as f64);
            }
        }
        assert!(!t.node(top).group_may_supply());
    }

    #[test]
    fn leaf_supply_packs_the_shipment() {
        let world = RayonComm::world(2);
        let params = CascadeParams {
            flexible_load_tol: 0.0,
            ..Default::default()
        };
        let mut load = WorkItems::from_items((0..4).map(|i| (i, 1.0)));
        let mut t = CascadeTree::new(0, 2, 2.0, 4.0);
        let mut ctx = BalanceContext::new(&world[0], &params, &mut load, 2.0);
        t.recompute_leaf_data(&ctx);
        let leaf = t.leaf();
        let got = t.supply_work(leaf, 5.0, 1, &mut ctx);
        // Capped at the leaf's surplus.
        assert_eq!(got, 2.0);
        assert_eq!(ctx.shipment.sum_load(), 2.0);
        assert!(!t.node(leaf).group_may_supply());
        assert_eq!(ctx.local_load.sum_load(), 2.0);
    }

    proptest::proptest! {
        #[test]
        fn leaf_never_supplies_more_than_requested(
            items in 0u64..30,
            requested in 0.1f64..40.0,
            limit in proptest::bool::ANY,
        ) {
            let world = RayonComm::world(2);
            let params = CascadeParams {
                flexible_load_tol: 0.0,
                limit_supply_to_surplus: limit,
                ..Default::default()
            };
            let mut load = WorkItems::from_items((0..items).map(|i| (i, 1.0)));
            let mut t = CascadeTree::new(0, 2, 1.0, items as f64);
            let mut ctx = BalanceContext::new(&world[0], &params, &mut load, 1.0);
            t.recompute_leaf_data(&ctx);
            let leaf = t.leaf();
            let surplus = t.node(leaf).surplus();
            let got = t.supply_work(leaf, requested, 1, &mut ctx);
            proptest::prop_assert!(got <= requested);
            if limit {
                proptest::prop_assert!(got <= surplus.max(0.0));
            }
            proptest::prop_assert!(ctx.shipment.sum_load() <= got);
            proptest::prop_assert_eq!(
                ctx.shipment.sum_load() + ctx.local_load.sum_load(),
                items as f64
            );
        }
    }

    #[test]
    fn small_remainder_still_drawn_from_second_child() {
        let world = RayonComm::world(4);
        let params = CascadeParams {
            load_comparison_tol: 0.5,
            flexible_load_tol: 0.0,
            ..Default::default()
        };
        let mut load = WorkItems::from_items([(0, 2.25)]).with_cut_granularity(0.0);
        let mut t = CascadeTree::new(0, 4, 1.0, 2.25);
        let group = t.near_far(CascadeTree::ROOT).0;
        let (leaf, far) = t.near_far(group);
        assert_eq!(leaf, t.leaf());
        t.nodes[far].work = 2.5;
        t.nodes[far].group_may_supply = true;
        t.nodes[group].work = 4.75;
        t.nodes[group].group_may_supply = true;
        let mut ctx = BalanceContext::new(&world[0], &params, &mut load, 1.0);
        t.recompute_leaf_data(&ctx);
        // The far child covers 1.5; the 0.25 left is below tolerance but
        // still comes from the leaf.
        let got = t.supply_work(group, 1.75, 2, &mut ctx);
        assert_eq!(got, 1.75);
        assert_eq!(t.node(far).work(), 1.0);
        assert_eq!(t.node(leaf).work(), 2.0);
        assert_eq!(t.node(group).work(), 3.0);
        assert!((ctx.shipment.sum_load() - 0.25).abs() < 1e-12);
        assert!(t.node(leaf).process_may_supply()[0]);
    }

    #[test]
    fn remote_supply_is_only_an_estimate() {
        let world = RayonComm::world(2);
        let params = CascadeParams::default();
        let mut load = WorkItems::new();
        let mut t = CascadeTree::new(0, 2, 1.0, 0.0);
        let far = t.near_far(CascadeTree::ROOT).1;
        t.nodes[far].work = 3.0;
        t.nodes[far].group_may_supply = true;
        let mut ctx = BalanceContext::new(&world[0], &params, &mut load, 1.0);
        let got = t.supply_work(far, 1.0, 0, &mut ctx);
        assert_eq!(got, 1.0);
        assert_eq!(t.node(far).work(), 2.0);
        assert!(ctx.shipment.is_empty());
    }
}
