#![cfg_attr(docsrs, feature(doc_cfg))]
//! # cascade-partitioner
//!
//! cascade-partitioner is a decentralized load balancer for SPMD codes. Each
//! process holds some divisible work; one collective pass moves work between
//! processes until every process holds about the global average, using only
//! point-to-point messages and `O(log P)` steps.
//!
//! ## Features
//! - Bisection tree of process groups, materialized only along the local path
//! - Staged non-blocking peer communication with two-phase messages
//! - Pluggable communication backends (serial, threads, MPI)
//! - A reference weighted work-item collection; bring your own by
//!   implementing [`LoadCollection`](partitioning::LoadCollection)
//!
//! ## Determinism
//!
//! All decisions are deterministic given the loads; only the order in which
//! messages complete varies between runs, and no result depends on it.
//!
//! ## Usage
//!
//! ```
//! use cascade_partitioner::prelude::*;
//!
//! let world = RayonComm::world(2);
//! std::thread::scope(|s| {
//!     for comm in &world {
//!         s.spawn(move || {
//!             let mut load = if comm.rank() == 0 {
//!                 WorkItems::from_items((0..4).map(|i| (i, 1.0)))
//!             } else {
//!                 WorkItems::new()
//!             };
//!             let p = CascadePartitioner::new(comm, CascadeParams::default()).unwrap();
//!             p.balance(&mut load).unwrap();
//!             assert_eq!(load.sum_load(), 2.0);
//!         });
//!     }
//! });
//! ```

pub mod algs;
pub mod cascade_error;
pub mod debug_invariants;
pub mod partitioning;

pub use cascade_error::CascadeError;
pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::stage::{AsyncCommStage, MemberId};
    pub use crate::cascade_error::CascadeError;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::partitioning::{
        BalanceStats, CascadeParams, CascadePartitioner, CascadeTree, LoadCollection, LoadStats,
        WorkItems,
    };
}
