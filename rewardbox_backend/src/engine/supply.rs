//! Process-wide unit counters and the supply invariant.
//!
//! Every mutation of `units_supply`, `units_requested` and `units_minted`
//! funnels through these primitives so `units_requested <= units_supply`
//! is never observed violated between operations.

use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableCell;
use std::cell::RefCell;

use super::memory_ids::SUPPLY_MEMORY_ID;
use crate::types::{RewardError, SupplyAccount, Units};
use crate::{Memory, MEMORY_MANAGER};

thread_local! {
    static SUPPLY_CELL: RefCell<StableCell<SupplyAccount, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(SUPPLY_MEMORY_ID))),
            SupplyAccount::default()
        ).expect("Failed to init supply cell")
    );
}

pub fn get_supply() -> SupplyAccount {
    SUPPLY_CELL.with(|cell| *cell.borrow().get())
}

fn store(account: SupplyAccount) {
    SUPPLY_CELL.with(|cell| {
        cell.borrow_mut()
            .set(account)
            .expect("CRITICAL: Failed to write supply cell")
    });
}

/// Units still available to new open requests.
pub fn free_units() -> Units {
    let s = get_supply();
    s.units_supply - s.units_requested
}

/// Reserve units for an open request.
pub fn reserve(units: Units) -> Result<(), RewardError> {
    let mut s = get_supply();
    if s.units_supply - s.units_requested < units {
        return Err(RewardError::SupplyExceeded);
    }
    s.units_requested += units;
    store(s);
    Ok(())
}

/// Drop a reservation: fulfillment rollback, or the unreserve half of a
/// successful fulfillment commit.
pub fn release(units: Units) -> Result<(), RewardError> {
    let mut s = get_supply();
    s.units_requested = s
        .units_requested
        .checked_sub(units)
        .ok_or_else(|| corruption("units_requested underflow on release"))?;
    store(s);
    Ok(())
}

/// Apply an inventory weight change to the sellable supply.
pub fn adjust_supply(delta: i128) -> Result<(), RewardError> {
    let mut s = get_supply();
    let new_supply = (s.units_supply as i128) + delta;
    if new_supply < 0 || new_supply < s.units_requested as i128 {
        return Err(RewardError::InsufficientSupply);
    }
    s.units_supply =
        Units::try_from(new_supply).map_err(|_| RewardError::UnitsOverflow)?;
    store(s);
    Ok(())
}

/// Consume fulfilled units: the reservation is spent and the drawn weight
/// has left the inventory, in one step.
pub fn consume_fulfilled(units: Units) -> Result<(), RewardError> {
    let mut s = get_supply();
    s.units_requested = s
        .units_requested
        .checked_sub(units)
        .ok_or_else(|| corruption("units_requested underflow on fulfillment"))?;
    s.units_supply = s
        .units_supply
        .checked_sub(units)
        .ok_or_else(|| corruption("units_supply underflow on fulfillment"))?;
    store(s);
    Ok(())
}

/// Box face-value accounting: issuing `amount` boxes of type `box_id`
/// puts `box_id * amount` units into circulation.
pub fn on_issue(units: Units) -> Result<(), RewardError> {
    let mut s = get_supply();
    s.units_minted = s
        .units_minted
        .checked_add(units)
        .ok_or(RewardError::UnitsOverflow)?;
    store(s);
    Ok(())
}

pub fn on_redeem(units: Units) -> Result<(), RewardError> {
    let mut s = get_supply();
    s.units_minted = s
        .units_minted
        .checked_sub(units)
        .ok_or_else(|| corruption("units_minted underflow on redeem"))?;
    store(s);
    Ok(())
}

fn corruption(msg: &str) -> RewardError {
    RewardError::StateCorruption(msg.to_string())
}
