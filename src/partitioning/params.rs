//! Tunable parameters of the cascade partitioner.

use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CascadeCommTags, CommTag};
use crate::algs::peer::DEFAULT_FIRST_DATA_LEN;
use crate::cascade_error::CascadeError;

/// Options recognized by [`CascadePartitioner`](super::cascade::CascadePartitioner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeParams {
    /// Smallest surplus or deficit worth acting on.
    pub load_comparison_tol: f64,
    /// Half-width of the window around a requested transfer, as a fraction
    /// of the global average. Leaves room for indivisible work items.
    pub flexible_load_tol: f64,
    /// Cap what a group donates at its surplus instead of its whole work.
    pub limit_supply_to_surplus: bool,
    /// Also balance the groups between the leaf and the current top group.
    pub balance_intermediate_groups: bool,
    /// After combining a non-root top group, reset the obligations of it and
    /// its descendants to the average it actually holds.
    pub reset_obligations: bool,
    /// Payload bytes sent along with the header of a load shipment.
    pub first_data_len: usize,
    /// Base tag; the pass uses a handful of consecutive tags above it.
    pub base_tag: u16,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            load_comparison_tol: 1e-6,
            flexible_load_tol: 0.05,
            limit_supply_to_surplus: true,
            balance_intermediate_groups: false,
            reset_obligations: true,
            first_data_len: DEFAULT_FIRST_DATA_LEN,
            base_tag: 0x5A00,
        }
    }
}

impl CascadeParams {
    pub fn tags(&self) -> CascadeCommTags {
        CascadeCommTags::from_base(CommTag::new(self.base_tag))
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if !self.load_comparison_tol.is_finite() || self.load_comparison_tol < 0.0 {
            return Err(CascadeError::InvalidParams(format!(
                "load_comparison_tol must be finite and >= 0, got {}",
                self.load_comparison_tol
            )));
        }
        if !self.flexible_load_tol.is_finite() || self.flexible_load_tol < 0.0 {
            return Err(CascadeError::InvalidParams(format!(
                "flexible_load_tol must be finite and >= 0, got {}",
                self.flexible_load_tol
            )));
        }
        if self.first_data_len == 0 {
            return Err(CascadeError::InvalidParams(
                "first_data_len must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate parameters from a JSON document. Missing keys take
    /// their default values.
    pub fn from_json_str(s: &str) -> Result<Self, CascadeError> {
        let params: Self = serde_json::from_str(s)?;
        params.validate()?;
        Ok(params)
    }
}
