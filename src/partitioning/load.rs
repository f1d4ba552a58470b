//! The work a process holds, as seen by the partitioner.
//!
//! [`LoadCollection`] is the minimal contract the balancer needs from the
//! application's work representation. [`WorkItems`] is a reference
//! implementation: weighted items keyed by id, optionally cuttable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cascade_error::CascadeError;

/// Divisible local work.
pub trait LoadCollection: Default {
    /// Total work held.
    fn sum_load(&self) -> f64;

    /// Move work out of `donor` into `self`, aiming for `ideal` and accepting
    /// anything in `[low, high]`. Best effort: when no combination of items
    /// lands in the window the closest attempt not above `high` is kept.
    /// Returns the work moved.
    fn adjust_load(&mut self, donor: &mut Self, ideal: f64, low: f64, high: f64) -> f64;

    /// Merge a copy of everything in `other` into `self`.
    fn insert_all(&mut self, other: &Self);

    /// Encode into an opaque byte stream.
    fn pack(&self) -> Result<Vec<u8>, CascadeError>;

    /// Decode from bytes produced by [`pack`](Self::pack).
    fn unpack(bytes: &[u8]) -> Result<Self, CascadeError>;

    fn clear(&mut self);

    fn is_empty(&self) -> bool;
}

/// Weighted work items keyed by id.
///
/// Items are indivisible unless a cut granularity is set, in which case
/// `adjust_load` may cut one item to reach its window. Pieces of the same item
/// that meet on one process merge back together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItems {
    items: BTreeMap<u64, f64>,
    #[serde(skip)]
    cut_granularity: Option<f64>,
}

impl WorkItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items `(id, weight)`; weights must be non-negative.
    pub fn from_items<I: IntoIterator<Item = (u64, f64)>>(items: I) -> Self {
        let mut w = Self::default();
        for (id, weight) in items {
            w.push(id, weight);
        }
        w
    }

    /// Allow cutting items into pieces that are multiples of `granularity`.
    /// A granularity of `0.0` allows cuts of any size.
    pub fn with_cut_granularity(mut self, granularity: f64) -> Self {
        self.cut_granularity = Some(granularity.max(0.0));
        self
    }

    pub fn cut_granularity(&self) -> Option<f64> {
        self.cut_granularity
    }

    /// Add `weight` to item `id`, creating it if needed.
    pub fn push(&mut self, id: u64, weight: f64) {
        assert!(weight >= 0.0, "work item {id} has negative weight {weight}");
        *self.items.entry(id).or_insert(0.0) += weight;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, id: u64) -> Option<f64> {
        self.items.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.items.iter().map(|(&id, &w)| (id, w))
    }

    fn take_item(&mut self, donor: &mut Self, id: u64) -> f64 {
        let w = donor.items.remove(&id).unwrap_or(0.0);
        self.push(id, w);
        w
    }

    /// Largest piece not above `want` allowed by `granularity`.
    fn piece_size(want: f64, granularity: f64) -> f64 {
        if granularity > 0.0 {
            (want / granularity).round() * granularity
        } else {
            want
        }
    }
}

impl LoadCollection for WorkItems {
    fn sum_load(&self) -> f64 {
        self.items.values().sum()
    }

    fn adjust_load(&mut self, donor: &mut Self, ideal: f64, low: f64, high: f64) -> f64 {
        if ideal <= 0.0 || high <= 0.0 || donor.is_empty() {
            return 0.0;
        }
        // Heaviest first, ties by id, so every process decides the same way.
        let mut order: Vec<(u64, f64)> = donor.iter().collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut moved = 0.0;
        for &(id, w) in &order {
            if moved >= ideal {
                break;
            }
            if w > 0.0 && moved + w <= high {
                moved += self.take_item(donor, id);
            }
        }

        if moved < low {
            if let Some(g) = donor.cut_granularity {
                let want = ideal - moved;
                let piece = Self::piece_size(want, g).min(high - moved);
                // Cut from the heaviest remaining item able to spare the piece.
                let source = donor
                    .iter()
                    .filter(|&(_, w)| w > piece)
                    .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
                if let (true, Some((id, _))) = (piece > 0.0, source) {
                    if let Some(w) = donor.items.get_mut(&id) {
                        *w -= piece;
                    }
                    self.push(id, piece);
                    moved += piece;
                }
            }
        }
        moved
    }

    fn insert_all(&mut self, other: &Self) {
        for (id, w) in other.iter() {
            self.push(id, w);
        }
    }

    fn pack(&self) -> Result<Vec<u8>, CascadeError> {
        Ok(bincode::serialize(self)?)
    }

    fn unpack(bytes: &[u8]) -> Result<Self, CascadeError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
