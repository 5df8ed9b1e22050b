use candid::{CandidType, Deserialize, Nat};
use num_traits::ToPrimitive;

use crate::types::RewardError;

// =============================================================================
// UNIT INFO
// =============================================================================
// Weight bookkeeping for a reward class (or a single id within a
// semi-fungible class): how many units it can still pay out, and how much
// of the underlying asset one unit pays. Overflow discipline is enforced at
// the construction boundary (units must fit u64, amount-per-unit must fit
// u128); everything downstream works on already-validated fields.

#[derive(CandidType, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedUnitInfo {
    units: u64,
    amount_per_unit: u128,
}

impl PackedUnitInfo {
    /// Overflow-checked construction from boundary-width inputs.
    pub fn new(units: u128, amount_per_unit: &Nat) -> Result<Self, RewardError> {
        let units = u64::try_from(units).map_err(|_| RewardError::UnitsOverflow)?;
        let amount_per_unit = amount_per_unit
            .0
            .to_u128()
            .ok_or(RewardError::AmountOverflow)?;
        Ok(Self {
            units,
            amount_per_unit,
        })
    }

    /// Internal constructor for values already known to be in range.
    pub(crate) fn from_parts(units: u64, amount_per_unit: u128) -> Self {
        Self {
            units,
            amount_per_unit,
        }
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    pub fn amount_per_unit(&self) -> u128 {
        self.amount_per_unit
    }

    pub fn decode(&self) -> (u64, u128) {
        (self.units, self.amount_per_unit)
    }

    /// All-zero is the canonical "unconfigured / exhausted" state.
    pub fn is_empty(&self) -> bool {
        self.units == 0 && self.amount_per_unit == 0
    }

    /// Same rate, different unit count.
    pub(crate) fn with_units(&self, units: u64) -> Self {
        Self {
            units,
            amount_per_unit: self.amount_per_unit,
        }
    }
}

// =============================================================================
// NAT BOUNDARY HELPERS
// =============================================================================
// Candid `Nat` is unbounded; everything past the endpoint boundary works on
// u128 amounts.

pub fn nat_to_amount(n: &Nat) -> Result<u128, RewardError> {
    n.0.to_u128().ok_or(RewardError::AmountOverflow)
}

pub fn amount_to_nat(amount: u128) -> Nat {
    Nat::from(amount)
}
