//! Per-reward-class bookkeeping: weight, per-id weight for semi-fungible
//! stacks, allocated-but-unclaimed balances, and the active-inventory index
//! that doubles as the sampling domain for the allocation engine.
//!
//! Every weight change goes through `supply::adjust_supply` before the
//! record is written, so the supply counters and the inventory can never
//! drift apart on a failed operation.

use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableBTreeMap;
use std::cell::RefCell;

use super::memory_ids::{ACTIVE_INDEX_MEMORY_ID, REWARD_CLASSES_MEMORY_ID};
use super::supply;
use crate::pack::PackedUnitInfo;
use crate::types::{
    ClaimEntry, RewardClassRecord, RewardClassView, RewardError, RewardKind, StackEntry, TokenId,
    Units,
};
use crate::{Memory, MEMORY_MANAGER};

thread_local! {
    static REWARD_CLASSES: RefCell<StableBTreeMap<Principal, RewardClassRecord, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(REWARD_CLASSES_MEMORY_ID))),
        ));

    // The set of classes with nonzero aggregate weight. Iteration order of
    // this index is the draw order of the allocation engine.
    static ACTIVE_INDEX: RefCell<StableBTreeMap<Principal, (), Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(ACTIVE_INDEX_MEMORY_ID))),
        ));
}

// =============================================================================
// ACCESSORS
// =============================================================================

pub fn get_class(class: &Principal) -> Option<RewardClassRecord> {
    REWARD_CLASSES.with(|c| c.borrow().get(class))
}

pub fn active_classes() -> Vec<Principal> {
    ACTIVE_INDEX.with(|idx| idx.borrow().iter().map(|(k, _)| k).collect())
}

/// Snapshot of every active class, in index order. The allocation engine
/// draws against this copy and commits it back only on full success.
pub fn snapshot_active() -> Vec<(Principal, RewardClassRecord)> {
    let keys = active_classes();
    REWARD_CLASSES.with(|c| {
        let classes = c.borrow();
        keys.into_iter()
            .filter_map(|k| classes.get(&k).map(|rec| (k, rec)))
            .collect()
    })
}

/// Weight over every record, active or not. Used by the conservation
/// audit; must equal `units_supply` at all times.
pub fn total_units_all_classes() -> Units {
    REWARD_CLASSES.with(|c| c.borrow().iter().map(|(_, rec)| rec.units()).sum())
}

pub fn class_view(class: &Principal) -> Option<RewardClassView> {
    get_class(class).map(|rec| RewardClassView {
        class: *class,
        kind: rec.kind,
        units: rec.info.units(),
        amount_per_unit: rec.info.amount_per_unit(),
        balance: rec.balance,
        allocated: rec.allocated,
        member_count: rec.member_ids.len() as u64,
        per_id: rec
            .per_id
            .iter()
            .map(|(id, e)| (*id, e.info.units(), e.info.amount_per_unit()))
            .collect(),
    })
}

/// Write back a post-draw record and fix up index membership. Allocation
/// commit path only.
pub fn commit_class(class: Principal, record: RewardClassRecord) {
    set_active(class, record.units() > 0);
    REWARD_CLASSES.with(|c| c.borrow_mut().insert(class, record));
}

fn set_active(class: Principal, active: bool) {
    ACTIVE_INDEX.with(|idx| {
        let mut idx = idx.borrow_mut();
        if active {
            idx.insert(class, ());
        } else {
            idx.remove(&class);
        }
    });
}

fn put_class(class: Principal, record: RewardClassRecord) {
    set_active(class, record.units() > 0);
    REWARD_CLASSES.with(|c| c.borrow_mut().insert(class, record));
}

// =============================================================================
// SUPPLY
// =============================================================================

/// Register newly arrived reward items and grow the class weight
/// incrementally. The first supply of a class fixes its kind; for the
/// multi-token family the stack/unique split follows the first supplied
/// amount (amount == 1 means unique).
pub fn register_supply(
    class: Principal,
    declared: RewardKind,
    id: TokenId,
    amount: u128,
) -> Result<Units, RewardError> {
    if amount == 0 {
        return Err(RewardError::ZeroAmount);
    }

    let mut record = match get_class(&class) {
        Some(existing) => {
            if !existing.kind.same_family(&declared) {
                return Err(RewardError::ModifiedKind);
            }
            existing
        }
        None => {
            let kind = match declared {
                RewardKind::Fungible => RewardKind::Fungible,
                RewardKind::UniqueItem => RewardKind::UniqueItem,
                RewardKind::SemiFungibleStack | RewardKind::SemiFungibleUnique => {
                    if amount == 1 {
                        RewardKind::SemiFungibleUnique
                    } else {
                        RewardKind::SemiFungibleStack
                    }
                }
            };
            RewardClassRecord::new(kind)
        }
    };

    let old_units = record.units();
    match record.kind {
        RewardKind::Fungible => {
            record.balance = record
                .balance
                .checked_add(amount)
                .ok_or(RewardError::AmountOverflow)?;
            let rate = record.info.amount_per_unit();
            let new_units = units_for(record.balance, record.allocated, rate)?;
            record.info = record.info.with_units(new_units);
        }
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => {
            if amount != 1 {
                return Err(RewardError::InvalidAmount);
            }
            if record.member_ids.contains(&id) {
                return Err(RewardError::DuplicateId(id));
            }
            record.member_ids.push(id);
            record.balance += 1;
            let rate = record.info.amount_per_unit();
            let new_units = units_for(record.member_ids.len() as u128, 0, rate)?;
            record.info = record.info.with_units(new_units);
        }
        RewardKind::SemiFungibleStack => {
            let entry = record.per_id.entry(id).or_insert_with(StackEntry::default);
            entry.balance = entry
                .balance
                .checked_add(amount)
                .ok_or(RewardError::AmountOverflow)?;
            let rate = entry.info.amount_per_unit();
            let new_id_units = units_for(entry.balance, entry.allocated, rate)?;
            let delta = new_id_units as i128 - entry.info.units() as i128;
            entry.info = entry.info.with_units(new_id_units);
            let aggregate = (record.info.units() as i128 + delta) as u64;
            record.info = record.info.with_units(aggregate);
        }
    }

    let added = record.units() - old_units;
    supply::adjust_supply(added as i128)?;
    put_class(class, record);
    Ok(added)
}

// =============================================================================
// RATE CONFIGURATION
// =============================================================================

/// Recompute the weight of a class (or of one id inside a stack class)
/// for a new per-unit rate. `current_balance` comes from the transfer
/// collaborator's balance_held query; `currently_allocated` is the tracked
/// allocated-but-unclaimed amount. Weight is floor((balance - allocated) /
/// rate), or 0 for a zero rate.
pub fn configure_rate(
    class: Principal,
    id: TokenId,
    new_rate: u128,
    current_balance: u128,
    currently_allocated: u128,
) -> Result<Units, RewardError> {
    let mut record = get_class(&class).ok_or(RewardError::UnknownClass(class))?;

    let old_units = record.units();
    match record.kind {
        RewardKind::Fungible => {
            record.balance = current_balance;
            let new_units = units_for(current_balance, currently_allocated, new_rate)?;
            record.info = PackedUnitInfo::from_parts(new_units, new_rate);
        }
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => {
            // Member list is authoritative for unique kinds: the ids we hold
            // and have not allocated are exactly the sampling pool.
            let new_units = units_for(record.member_ids.len() as u128, 0, new_rate)?;
            record.info = PackedUnitInfo::from_parts(new_units, new_rate);
        }
        RewardKind::SemiFungibleStack => {
            let entry = record.per_id.entry(id).or_insert_with(StackEntry::default);
            entry.balance = current_balance;
            let new_id_units = units_for(current_balance, currently_allocated, new_rate)?;
            let delta = new_id_units as i128 - entry.info.units() as i128;
            entry.info = PackedUnitInfo::from_parts(new_id_units, new_rate);
            let aggregate = (record.info.units() as i128 + delta) as u64;
            record.info = record.info.with_units(aggregate);
        }
    }

    let delta = record.units() as i128 - old_units as i128;
    supply::adjust_supply(delta)?;
    let new_units = record.units();
    put_class(class, record);
    Ok(new_units)
}

// =============================================================================
// ADMINISTRATIVE WITHDRAWAL
// =============================================================================

/// Remove unallocated inventory, shrinking the class weight accordingly.
/// Returns the number of units removed from the supply.
pub fn withdraw_inventory(
    class: Principal,
    id: TokenId,
    amount: u128,
) -> Result<Units, RewardError> {
    let mut record = get_class(&class).ok_or(RewardError::UnknownClass(class))?;

    let old_units = record.units();
    match record.kind {
        RewardKind::Fungible => {
            let available = record.balance.saturating_sub(record.allocated);
            if amount == 0 || amount > available {
                return Err(RewardError::InvalidAmount);
            }
            record.balance -= amount;
            let rate = record.info.amount_per_unit();
            let new_units = units_for(record.balance, record.allocated, rate)?;
            record.info = record.info.with_units(new_units);
        }
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => {
            // Unique items leave one at a time; anything else would make
            // the re-register rollback after a failed transfer impossible.
            if amount != 1 {
                return Err(RewardError::InvalidAmount);
            }
            let pos = record
                .member_ids
                .iter()
                .position(|m| *m == id)
                .ok_or(RewardError::UnknownId(id))?;
            record.member_ids.swap_remove(pos);
            record.balance -= 1;
            let rate = record.info.amount_per_unit();
            let new_units = units_for(record.member_ids.len() as u128, 0, rate)?;
            record.info = record.info.with_units(new_units);
        }
        RewardKind::SemiFungibleStack => {
            let entry = record
                .per_id
                .get_mut(&id)
                .ok_or(RewardError::UnknownId(id))?;
            let available = entry.balance.saturating_sub(entry.allocated);
            if amount == 0 || amount > available {
                return Err(RewardError::InvalidAmount);
            }
            entry.balance -= amount;
            let rate = entry.info.amount_per_unit();
            let new_id_units = units_for(entry.balance, entry.allocated, rate)?;
            let delta = entry.info.units() as i128 - new_id_units as i128;
            entry.info = entry.info.with_units(new_id_units);
            let aggregate = (record.info.units() as i128 - delta) as u64;
            record.info = record.info.with_units(aggregate);
        }
    }

    let removed = old_units - record.units();
    supply::adjust_supply(-(removed as i128))?;
    put_class(class, record);
    Ok(removed)
}

// =============================================================================
// CLAIM BOOKKEEPING
// =============================================================================

/// Tokens are leaving the canister for a claimed entry: release the
/// allocated-but-unclaimed hold and the underlying balance.
pub fn note_claimed(class: &Principal, entry: &ClaimEntry) -> Result<(), RewardError> {
    let mut record = get_class(class)
        .ok_or_else(|| corruption("claim entry for unknown reward class"))?;

    if entry.amount > 0 {
        record.allocated = record
            .allocated
            .checked_sub(entry.amount)
            .ok_or_else(|| corruption("allocated underflow on claim"))?;
        record.balance = record
            .balance
            .checked_sub(entry.amount)
            .ok_or_else(|| corruption("balance underflow on claim"))?;
    }
    if !entry.ids.is_empty() {
        let n = entry.ids.len() as u128;
        record.allocated = record
            .allocated
            .checked_sub(n)
            .ok_or_else(|| corruption("allocated id count underflow on claim"))?;
        record.balance = record
            .balance
            .checked_sub(n)
            .ok_or_else(|| corruption("id balance underflow on claim"))?;
    }
    for (id, amt) in &entry.id_amounts {
        let stack = record
            .per_id
            .get_mut(id)
            .ok_or_else(|| corruption("claim entry for unknown stack id"))?;
        stack.allocated = stack
            .allocated
            .checked_sub(*amt)
            .ok_or_else(|| corruption("stack allocated underflow on claim"))?;
        stack.balance = stack
            .balance
            .checked_sub(*amt)
            .ok_or_else(|| corruption("stack balance underflow on claim"))?;
    }

    put_class(*class, record);
    Ok(())
}

/// Rollback hook for a failed downstream transfer: the entry goes back to
/// the claim ledger and the holds are restored.
pub fn note_unclaimed(class: &Principal, entry: &ClaimEntry) -> Result<(), RewardError> {
    let mut record = get_class(class)
        .ok_or_else(|| corruption("rollback for unknown reward class"))?;

    if entry.amount > 0 {
        record.allocated = record
            .allocated
            .checked_add(entry.amount)
            .ok_or(RewardError::AmountOverflow)?;
        record.balance = record
            .balance
            .checked_add(entry.amount)
            .ok_or(RewardError::AmountOverflow)?;
    }
    if !entry.ids.is_empty() {
        let n = entry.ids.len() as u128;
        record.allocated = record
            .allocated
            .checked_add(n)
            .ok_or(RewardError::AmountOverflow)?;
        record.balance = record
            .balance
            .checked_add(n)
            .ok_or(RewardError::AmountOverflow)?;
    }
    for (id, amt) in &entry.id_amounts {
        let stack = record.per_id.entry(*id).or_insert_with(StackEntry::default);
        stack.allocated = stack
            .allocated
            .checked_add(*amt)
            .ok_or(RewardError::AmountOverflow)?;
        stack.balance = stack
            .balance
            .checked_add(*amt)
            .ok_or(RewardError::AmountOverflow)?;
    }

    put_class(*class, record);
    Ok(())
}

// =============================================================================
// INTEGRITY CHECKS
// =============================================================================

/// Defense in depth: the active index must equal the set of classes with
/// nonzero weight, and stack aggregates must equal their per-id sums.
pub fn verify_index() -> Result<(), String> {
    let all: Vec<(Principal, RewardClassRecord)> =
        REWARD_CLASSES.with(|c| c.borrow().iter().collect());
    let indexed = active_classes();

    for (class, record) in &all {
        let in_index = indexed.contains(class);
        let has_weight = record.units() > 0;
        if in_index != has_weight {
            return Err(format!(
                "index divergence for {}: weight {} vs indexed {}",
                class,
                record.units(),
                in_index
            ));
        }
        if record.kind == RewardKind::SemiFungibleStack {
            let id_sum: u64 = record.per_id.values().map(|e| e.info.units()).sum();
            if id_sum != record.units() {
                return Err(format!(
                    "stack aggregate mismatch for {}: {} vs per-id sum {}",
                    class,
                    record.units(),
                    id_sum
                ));
            }
        }
    }
    for class in &indexed {
        if !all.iter().any(|(c, _)| c == class) {
            return Err(format!("index references unknown class {}", class));
        }
    }
    Ok(())
}

fn units_for(balance: u128, allocated: u128, rate: u128) -> Result<Units, RewardError> {
    if rate == 0 {
        return Ok(0);
    }
    let available = balance
        .checked_sub(allocated)
        .ok_or_else(|| corruption("allocated exceeds balance"))?;
    Units::try_from(available / rate).map_err(|_| RewardError::UnitsOverflow)
}

fn corruption(msg: &str) -> RewardError {
    RewardError::StateCorruption(msg.to_string())
}
