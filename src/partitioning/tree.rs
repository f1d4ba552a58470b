//! The bisection tree of process groups.
//!
//! Rank range `[0, P)` is split recursively: a group `[b, e)` has a lower
//! child `[b, (b+e)/2)` and an upper child `[(b+e)/2, e)`, so the upper child
//! is the larger one when the size is odd. Each process only materializes the
//! path from the root to its own single-rank leaf: every group on that path
//! gets both children, the child holding the local rank is the *near* one and
//! the sibling is the *far* one. Far groups never get children; the local
//! process only ever learns a summary of their work.
//!
//! Nodes live in one arena and point at each other through [`NodeId`]s.

use std::fmt;

use itertools::Itertools;

use crate::cascade_error::CascadeError;
use crate::debug_invariants::{DebugInvariants, ensure};

/// Index of a group node inside its [`CascadeTree`].
pub type NodeId = usize;

/// Which half of its parent a group covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Half {
    Lower,
    Upper,
}

/// `ceil(log2(n))`, with `lg(1) == 0`.
pub fn ceil_log2(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Per-group bookkeeping as seen by the local process.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNode {
    pub(crate) generation: usize,
    pub(crate) cycle: usize,
    pub(crate) begin: usize,
    pub(crate) end: usize,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<[NodeId; 2]>,
    pub(crate) near: Option<NodeId>,
    pub(crate) far: Option<NodeId>,
    pub(crate) work: f64,
    pub(crate) obligation: f64,
    pub(crate) group_may_supply: bool,
    pub(crate) process_may_supply: [bool; 2],
    pub(crate) contact: [Option<usize>; 2],
}

impl GroupNode {
    /// Depth below the root.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Number of bisection cycles left below this group, counted from the
    /// deepest possible leaf.
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn begin(&self) -> usize {
        self.begin
    }
    pub fn end(&self) -> usize {
        self.end
    }
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.begin <= rank && rank < self.end
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
    /// Lower and upper child, if this group was split.
    pub fn children(&self) -> Option<[NodeId; 2]> {
        self.children
    }
    pub fn near(&self) -> Option<NodeId> {
        self.near
    }
    pub fn far(&self) -> Option<NodeId> {
        self.far
    }

    pub fn work(&self) -> f64 {
        self.work
    }
    pub fn obligation(&self) -> f64 {
        self.obligation
    }
    pub fn surplus(&self) -> f64 {
        self.work - self.obligation
    }

    pub fn group_may_supply(&self) -> bool {
        self.group_may_supply
    }
    pub fn process_may_supply(&self) -> [bool; 2] {
        self.process_may_supply
    }

    /// Ranks in the sibling group this process is paired with.
    pub fn contacts(&self) -> impl Iterator<Item = usize> + '_ {
        self.contact.iter().flatten().copied()
    }
}

impl fmt::Display for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen {} cycle {} [{}, {}) work {:.6} obligation {:.6} surplus {:.6} gms {} pms [{}, {}] contacts [{}]",
            self.generation,
            self.cycle,
            self.begin,
            self.end,
            self.work,
            self.obligation,
            self.surplus(),
            self.group_may_supply,
            self.process_may_supply[0],
            self.process_may_supply[1],
            self.contacts().join(", "),
        )
    }
}

/// The local process's view of the bisection tree.
#[derive(Debug, Clone)]
pub struct CascadeTree {
    pub(crate) nodes: Vec<GroupNode>,
    rank: usize,
    nprocs: usize,
    leaf: NodeId,
}

impl CascadeTree {
    pub const ROOT: NodeId = 0;

    /// Build the tree for `rank` out of `nprocs`. Every group's obligation is
    /// `global_avg` times its size; the root starts out with `local_work`.
    pub fn new(rank: usize, nprocs: usize, global_avg: f64, local_work: f64) -> Self {
        assert!(
            rank < nprocs,
            "rank {rank} outside a world of {nprocs} processes"
        );
        let depth = ceil_log2(nprocs);
        let root = GroupNode {
            generation: 0,
            cycle: depth,
            begin: 0,
            end: nprocs,
            parent: None,
            children: None,
            near: None,
            far: None,
            work: local_work,
            obligation: global_avg * nprocs as f64,
            group_may_supply: false,
            process_may_supply: [false; 2],
            contact: [None; 2],
        };
        let mut tree = Self {
            nodes: vec![root],
            rank,
            nprocs,
            leaf: Self::ROOT,
        };

        let mut current = Self::ROOT;
        while tree.nodes[current].size() > 1 {
            let lower = tree.add_child(current, Half::Lower, global_avg, depth);
            let upper = tree.add_child(current, Half::Upper, global_avg, depth);
            let (near, far) = if tree.nodes[lower].contains(rank) {
                (lower, upper)
            } else {
                (upper, lower)
            };
            let node = &mut tree.nodes[current];
            node.children = Some([lower, upper]);
            node.near = Some(near);
            node.far = Some(far);
            current = near;
        }
        tree.leaf = current;
        tree
    }

    fn add_child(&mut self, parent: NodeId, half: Half, global_avg: f64, depth: usize) -> NodeId {
        let p = &self.nodes[parent];
        let (pb, pe) = (p.begin, p.end);
        let split = (pb + pe) / 2;
        let (begin, end) = match half {
            Half::Lower => (pb, split),
            Half::Upper => (split, pe),
        };
        let generation = p.generation + 1;
        let contact = if (begin..end).contains(&self.rank) {
            Self::pair_contacts(self.rank, pb, pe, half)
        } else {
            [None; 2]
        };
        let id = self.nodes.len();
        self.nodes.push(GroupNode {
            generation,
            cycle: depth.saturating_sub(generation),
            begin,
            end,
            parent: Some(parent),
            children: None,
            near: None,
            far: None,
            work: 0.0,
            obligation: global_avg * (end - begin) as f64,
            group_may_supply: false,
            process_may_supply: [false; 2],
            contact,
        });
        id
    }

    /// Partners of `rank` in the sibling of the `half` of `[pb, pe)` holding
    /// it. Ranks pair up by offset within their half. When the parent has odd
    /// size, the upper half has one rank too many: the last lower rank also
    /// serves it, and it talks back to that rank.
    pub fn pair_contacts(rank: usize, pb: usize, pe: usize, half: Half) -> [Option<usize>; 2] {
        let split = (pb + pe) / 2;
        let relative = if rank < split { rank - pb } else { rank - split };
        match half {
            Half::Lower => {
                let first = relative + split;
                let second = (rank + 1 == split && (pe - pb) % 2 == 1).then_some(first + 1);
                [Some(first), second]
            }
            Half::Upper => [Some((relative + pb).min(split - 1)), None],
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
    pub fn nprocs(&self) -> usize {
        self.nprocs
    }
    pub fn leaf(&self) -> NodeId {
        self.leaf
    }
    pub fn depth(&self) -> usize {
        self.nodes[self.leaf].generation
    }

    pub fn node(&self, id: NodeId) -> &GroupNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Groups on the path from the root to the local leaf, root first.
    pub fn near_path(&self) -> Vec<NodeId> {
        let mut path = Vec::with_capacity(self.depth() + 1);
        let mut cur = Some(Self::ROOT);
        while let Some(id) = cur {
            path.push(id);
            cur = self.nodes[id].near;
        }
        path
    }

    /// Near and far child of a split group.
    pub(crate) fn near_far(&self, id: NodeId) -> (NodeId, NodeId) {
        match (self.nodes[id].near, self.nodes[id].far) {
            (Some(near), Some(far)) => (near, far),
            _ => panic!("group {id} has no children"),
        }
    }

    /// Check the cached supply flags against `tol` on every node.
    pub fn validate_supply_flags(&self, tol: f64) -> Result<(), CascadeError> {
        for (id, n) in self.nodes.iter().enumerate() {
            ensure(
                n.children.is_none() || n.group_may_supply == (n.surplus() > tol),
                || format!("group {id} ({n}) has a stale may-supply flag"),
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for CascadeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.near_path() {
            let n = &self.nodes[id];
            writeln!(f, "{:indent$}{n}", "", indent = 2 * n.generation)?;
            if let Some(far) = n.far {
                let fnode = &self.nodes[far];
                writeln!(f, "{:indent$}far {fnode}", "", indent = 2 * fnode.generation)?;
            }
        }
        Ok(())
    }
}

impl DebugInvariants for CascadeTree {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CascadeTree");
    }

    fn validate_invariants(&self) -> Result<(), CascadeError> {
        let leaves: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].children.is_none() && self.nodes[i].contains(self.rank))
            .collect();
        ensure(leaves == [self.leaf], || {
            format!("expected one local leaf, found {leaves:?}")
        })?;
        let leaf = &self.nodes[self.leaf];
        ensure(leaf.size() == 1 && leaf.begin == self.rank, || {
            format!("local leaf {leaf} is not [{}]", self.rank)
        })?;
        for (id, n) in self.nodes.iter().enumerate() {
            let Some([lo, hi]) = n.children else {
                continue;
            };
            let (lo, hi) = (&self.nodes[lo], &self.nodes[hi]);
            ensure(
                lo.begin == n.begin && lo.end == hi.begin && hi.end == n.end,
                || format!("children of group {id} do not split it"),
            )?;
            ensure(n.contains(self.rank), || format!("far group {id} was split"))?;
            let (near, far) = self.near_far(id);
            let (near, far) = (&self.nodes[near], &self.nodes[far]);
            ensure(near.contains(self.rank) && !far.contains(self.rank), || {
                format!("near/far children of group {id} are swapped")
            })?;
            ensure(far.children.is_none(), || {
                format!("far child of group {id} was split")
            })?;
            ensure(
                near.contact[0].is_some() && near.contacts().all(|c| far.contains(c)),
                || format!("contacts of {near} are not in {far}"),
            )?;
        }
        Ok(())
    }
}
