//! Balance-quality metrics.

use std::time::Duration;

use itertools::{Itertools, MinMaxResult};

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::reduction::{ReduceOp, all_reduce};
use crate::cascade_error::CascadeError;

/// What one balancing pass did on the local process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceStats {
    /// Top groups processed, i.e. depth of the local leaf.
    pub generations: usize,
    /// Summary exchanges with sibling groups.
    pub combine_steps: usize,
    /// Groups whose children were balanced against each other.
    pub balance_steps: usize,
    /// Obligation resets applied to a top group and its descendants.
    pub obligation_resets: usize,
    pub shipments_sent: usize,
    pub shipments_received: usize,
    pub work_sent: f64,
    pub work_received: f64,
    /// Time spent blocked in the communication stage.
    pub comm_wait: Duration,
    /// Wall time of the whole pass.
    pub elapsed: Duration,
}

impl BalanceStats {
    /// Work gained (positive) or shed (negative) by the local process.
    pub fn net_work(&self) -> f64 {
        self.work_received - self.work_sent
    }
}

/// Load spread across processes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadStats {
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl LoadStats {
    /// Statistics of a known set of per-process loads.
    pub fn from_loads(loads: &[f64]) -> Self {
        let total: f64 = loads.iter().sum();
        let (min, max) = match loads.iter().copied().minmax_by(f64::total_cmp) {
            MinMaxResult::NoElements => (0.0, 0.0),
            MinMaxResult::OneElement(v) => (v, v),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };
        let avg = if loads.is_empty() {
            0.0
        } else {
            total / loads.len() as f64
        };
        Self {
            total,
            min,
            max,
            avg,
        }
    }

    /// Collective: gather statistics of `local` over every rank of `comm`.
    /// Uses tags `tag .. tag + 6`.
    pub fn gather<C: Communicator>(
        comm: &C,
        tag: CommTag,
        local: f64,
    ) -> Result<Self, CascadeError> {
        let total = all_reduce(comm, tag, local, ReduceOp::Sum)?;
        let min = all_reduce(comm, tag.offset(2), local, ReduceOp::Min)?;
        let max = all_reduce(comm, tag.offset(4), local, ReduceOp::Max)?;
        Ok(Self {
            total,
            min,
            max,
            avg: total / comm.size().max(1) as f64,
        })
    }

    /// `max / avg`; 1.0 is perfect balance.
    pub fn imbalance(&self) -> f64 {
        if self.avg > 0.0 {
            self.max / self.avg
        } else {
            1.0
        }
    }

    /// Largest distance of any process from the average.
    pub fn max_deviation(&self) -> f64 {
        (self.max - self.avg).max(self.avg - self.min)
    }
}
