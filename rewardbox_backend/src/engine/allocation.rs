//! The weighted-random draw: given a 32-byte oracle seed and a unit count,
//! sample the active inventory without replacement, one reward item per
//! unit, proportional to remaining unit weight.
//!
//! The whole run happens against an in-memory snapshot of the inventory
//! and is committed in one step by the caller; a fault (including the step
//! budget running out) discards the snapshot, so partial allocation is
//! never observable.

use candid::Principal;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::types::{ClaimEntry, RewardClassRecord, RewardError, RewardKind, Units};

/// How much of the fulfillment gas budget one scan/sub-draw step is worth.
/// The exact constant only needs to make larger budgets allow larger
/// inventories.
pub const GAS_PER_STEP: u64 = 10_000;

pub fn steps_for_gas(callback_gas: u64) -> u64 {
    callback_gas / GAS_PER_STEP
}

/// Everything a successful run wants written back, atomically.
#[derive(Debug)]
pub struct AllocationOutcome {
    /// Post-draw records for every snapshot class (weights debited,
    /// allocations held).
    pub classes: Vec<(Principal, RewardClassRecord)>,
    /// Draw credits for the requester, one entry per touched class, in
    /// credited order.
    pub credits: Vec<(Principal, ClaimEntry)>,
    pub drawn: Units,
}

struct StepBudget {
    left: u64,
}

impl StepBudget {
    fn spend(&mut self, n: u64) -> Result<(), RewardError> {
        if self.left < n {
            return Err(RewardError::StepBudgetExhausted);
        }
        self.left -= n;
        Ok(())
    }
}

/// Run `units_to_get` draws against the snapshot. `total_units` is the
/// whole sellable supply, so reserved-but-undrawn units of other pending
/// requests keep contributing weight, exactly as they still sit in the
/// inventory.
pub fn allocate(
    seed: &[u8; 32],
    units_to_get: Units,
    mut classes: Vec<(Principal, RewardClassRecord)>,
    mut total_units: Units,
    max_steps: u64,
) -> Result<AllocationOutcome, RewardError> {
    if units_to_get > total_units {
        return Err(RewardError::InsufficientSupply);
    }

    let mut budget = StepBudget { left: max_steps };
    let mut credits: BTreeMap<Principal, ClaimEntry> = BTreeMap::new();
    let mut credit_order: Vec<Principal> = Vec::new();

    for drawn in 0..units_to_get {
        let remaining = units_to_get - drawn;
        if total_units == 0 {
            return Err(corruption("inventory exhausted before request was served"));
        }
        let target = draw_value(seed, remaining) % total_units;

        // Linear scan in index order for the class containing the target
        // offset. Classes drained earlier in this run carry zero weight
        // and are skipped.
        let mut acc: Units = 0;
        let mut chosen: Option<(usize, Units)> = None;
        for (idx, (_, record)) in classes.iter().enumerate() {
            let weight = record.units();
            if weight == 0 {
                continue;
            }
            budget.spend(1)?;
            if target < acc + weight {
                chosen = Some((idx, target - acc));
                break;
            }
            acc += weight;
        }
        let (idx, offset) =
            chosen.ok_or_else(|| corruption("class weights sum below total units"))?;

        let (class, record) = &mut classes[idx];
        if !credits.contains_key(class) {
            credit_order.push(*class);
        }
        let entry = credits.entry(*class).or_default();

        match record.kind {
            RewardKind::Fungible => {
                let amount = record.info.amount_per_unit();
                entry.amount += amount;
                record.allocated = record
                    .allocated
                    .checked_add(amount)
                    .ok_or(RewardError::AmountOverflow)?;
                record.info = record.info.with_units(record.units() - 1);
            }
            RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => {
                // One unit pays `amount_per_unit` distinct ids, picked by
                // further sub-draws over the shrinking member pool.
                let picks = u64::try_from(record.info.amount_per_unit())
                    .map_err(|_| corruption("unique payout count exceeds u64"))?;
                for k in 0..picks {
                    budget.spend(1)?;
                    let pool = record.member_ids.len() as u64;
                    if pool == 0 {
                        return Err(corruption("unique member pool drained below weight"));
                    }
                    let j = sub_draw_value(seed, remaining, k) % pool;
                    let id = record.member_ids.swap_remove(j as usize);
                    entry.ids.push(id);
                    record.allocated += 1;
                }
                record.info = record.info.with_units(record.units() - 1);
            }
            RewardKind::SemiFungibleStack => {
                // Re-use the class offset to find which id absorbs the
                // draw: second linear scan over per-id weights.
                let mut residual = offset;
                let mut hit = None;
                for (id, stack) in record.per_id.iter_mut() {
                    let weight = stack.info.units();
                    if weight == 0 {
                        continue;
                    }
                    budget.spend(1)?;
                    if residual < weight {
                        hit = Some((*id, stack));
                        break;
                    }
                    residual -= weight;
                }
                let (id, stack) =
                    hit.ok_or_else(|| corruption("stack per-id weights below aggregate"))?;
                let amount = stack.info.amount_per_unit();
                *entry.id_amounts.entry(id).or_insert(0) += amount;
                stack.allocated = stack
                    .allocated
                    .checked_add(amount)
                    .ok_or(RewardError::AmountOverflow)?;
                stack.info = stack.info.with_units(stack.info.units() - 1);
                record.info = record.info.with_units(record.units() - 1);
            }
        }

        total_units -= 1;
    }

    let credits = credit_order
        .into_iter()
        .map(|class| {
            let entry = credits.remove(&class).unwrap_or_default();
            (class, entry)
        })
        .collect();

    Ok(AllocationOutcome {
        classes,
        credits,
        drawn: units_to_get,
    })
}

// =============================================================================
// DRAW DERIVATION
// =============================================================================
// One seed, many draws: each draw hashes the seed with its position in the
// run, sub-draws add a third component.

fn draw_value(seed: &[u8; 32], remaining: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(remaining.to_be_bytes());
    let hash = hasher.finalize();
    u64::from_be_bytes(hash[0..8].try_into().unwrap())
}

fn sub_draw_value(seed: &[u8; 32], remaining: u64, k: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(remaining.to_be_bytes());
    hasher.update(k.to_be_bytes());
    let hash = hasher.finalize();
    u64::from_be_bytes(hash[0..8].try_into().unwrap())
}

fn corruption(msg: &str) -> RewardError {
    RewardError::StateCorruption(msg.to_string())
}
