//! Per-account pending allocations, released on a separate claim call.

use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableBTreeMap;
use std::cell::RefCell;

use super::memory_ids::CLAIMS_MEMORY_ID;
use crate::types::{ClaimBook, ClaimEntry, ClaimedReward, RewardError, RewardKind, TokenId};
use crate::{Memory, MEMORY_MANAGER};

thread_local! {
    static CLAIMS: RefCell<StableBTreeMap<Principal, ClaimBook, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(CLAIMS_MEMORY_ID))),
        ));
}

/// Merge one request's draw credits into the account's claim book.
/// Allocation commit path only.
pub fn credit(account: Principal, credits: Vec<(Principal, ClaimEntry)>) {
    CLAIMS.with(|claims| {
        let mut claims = claims.borrow_mut();
        let mut book = claims.get(&account).unwrap_or_default();
        for (class, entry) in credits {
            let slot = book.entries.entry(class).or_default();
            slot.amount += entry.amount;
            slot.ids.extend(entry.ids);
            for (id, amt) in entry.id_amounts {
                *slot.id_amounts.entry(id).or_insert(0) += amt;
            }
        }
        claims.insert(account, book);
    });
}

/// Zero-and-return every nonzero pending entry for the account. Draining
/// is all-or-nothing per call; `NothingToClaim` when the book is empty.
pub fn drain(account: Principal) -> Result<Vec<(Principal, ClaimEntry)>, RewardError> {
    let book = CLAIMS.with(|claims| claims.borrow_mut().remove(&account));
    let entries: Vec<(Principal, ClaimEntry)> = book
        .map(|b| b.entries.into_iter().filter(|(_, e)| !e.is_empty()).collect())
        .unwrap_or_default();
    if entries.is_empty() {
        return Err(RewardError::NothingToClaim);
    }
    Ok(entries)
}

/// Put one entry back after a failed downstream transfer.
pub fn restore(account: Principal, class: Principal, entry: ClaimEntry) {
    credit(account, vec![(class, entry)]);
}

/// Read-only view of what an account could claim right now.
pub fn pending(account: Principal) -> Vec<(Principal, ClaimEntry)> {
    CLAIMS.with(|claims| {
        claims
            .borrow()
            .get(&account)
            .map(|b| b.entries.into_iter().filter(|(_, e)| !e.is_empty()).collect())
            .unwrap_or_default()
    })
}

/// Total units' worth of pending claims is not tracked here; what callers
/// need is the external shape of each entry.
pub fn to_claimed_reward(class: Principal, kind: RewardKind, entry: &ClaimEntry) -> ClaimedReward {
    ClaimedReward {
        class,
        kind,
        amount: entry.amount,
        ids: entry.ids.clone(),
        id_amounts: entry
            .id_amounts
            .iter()
            .map(|(id, amt)| (*id, *amt))
            .collect::<Vec<(TokenId, u128)>>(),
    }
}
