//! Cascading bisection-tree load balancing.
//!
//! [`CascadePartitioner`] redistributes divisible work held in a
//! [`LoadCollection`] so that every process ends up near the global average.
//! The work is moved pairwise along a [`CascadeTree`] of process groups,
//! one level per step, using only point-to-point messages.

pub mod cascade;
pub mod context;
pub mod load;
pub mod metrics;
pub mod params;
pub mod tree;

pub use self::cascade::CascadePartitioner;
pub use self::load::{LoadCollection, WorkItems};
pub use self::metrics::{BalanceStats, LoadStats};
pub use self::params::CascadeParams;
pub use self::tree::{CascadeTree, GroupNode, NodeId};
