//! Global reductions of a single `f64` over point-to-point messages.
//!
//! Values are combined up a binomial tree rooted at rank 0 and the result is
//! broadcast back down the same tree, so every rank exchanges O(log P)
//! messages and all ranks end with bit-identical results.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireF64, expect_exact_len};
use crate::cascade_error::{CascadeError, CommError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

fn recv_value<C: Communicator>(comm: &C, peer: usize, tag: u16) -> Result<f64, CascadeError> {
    let raw = comm.irecv(peer, tag).wait().ok_or_else(|| CascadeError::CommError {
        neighbor: peer,
        source: Box::new(CommError("missing reduction partial".into())),
    })?;
    expect_exact_len(raw.len(), std::mem::size_of::<WireF64>()).map_err(|e| {
        CascadeError::CommError {
            neighbor: peer,
            source: Box::new(CommError(e)),
        }
    })?;
    Ok(bytemuck::pod_read_unaligned::<WireF64>(&raw).get())
}

fn send_value<C: Communicator>(comm: &C, peer: usize, tag: u16, v: f64) {
    let w = WireF64::of(v);
    comm.isend(peer, tag, bytemuck::bytes_of(&w)).wait();
}

/// Combine `value` from every rank with `op`; every rank gets the result.
///
/// Uses `tag` for the reduction and `tag + 1` for the broadcast.
pub fn all_reduce<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: f64,
    op: ReduceOp,
) -> Result<f64, CascadeError> {
    let (rank, size) = (comm.rank(), comm.size());
    if size <= 1 {
        return Ok(value);
    }
    let up = tag.as_u16();
    let down = tag.offset(1).as_u16();

    // 1) reduce towards rank 0
    let mut acc = value;
    let mut mask = 1usize;
    while mask < size {
        if rank & mask != 0 {
            send_value(comm, rank & !mask, up, acc);
            break;
        }
        let child = rank | mask;
        if child < size {
            acc = op.apply(acc, recv_value(comm, child, up)?);
        }
        mask <<= 1;
    }

    // 2) broadcast back down the same tree
    let lowest = if rank == 0 {
        size.next_power_of_two()
    } else {
        1 << rank.trailing_zeros()
    };
    if rank != 0 {
        acc = recv_value(comm, rank & !lowest, down)?;
    }
    let mut m = lowest >> 1;
    while m > 0 {
        if rank + m < size {
            send_value(comm, rank + m, down, acc);
        }
        m >>= 1;
    }
    Ok(acc)
}

pub fn all_reduce_sum<C: Communicator>(comm: &C, tag: CommTag, value: f64) -> Result<f64, CascadeError> {
    all_reduce(comm, tag, value, ReduceOp::Sum)
}
