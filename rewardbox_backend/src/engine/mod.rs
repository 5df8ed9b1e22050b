//! The reward-box engine: inventory, supply counters, open-request state
//! machine, allocation and claims.
//!
//! Every function here is a synchronous, atomic state transition taking
//! `caller`/`now` as plain parameters; inter-canister traffic lives in the
//! endpoint layer. That keeps the whole engine natively testable.

pub mod allocation;
pub mod audit;
pub mod claims;
pub mod guard;
pub mod inventory;
pub mod memory_ids;
pub mod registry;
pub mod supply;

#[cfg(test)]
mod tests;

use candid::Principal;
use std::time::Duration;

use crate::types::{
    AuditEvent, ClaimEntry, ClaimedReward, FulfillStatus, OpenRequest, RewardError, RewardKind,
    TokenId, Units,
};
use audit::{log_audit, short_reason};

// =============================================================================
// BOX ISSUANCE
// =============================================================================

/// Face-value accounting for newly sold boxes. The box type id is its unit
/// face value; minting more circulating units than the inventory backs is
/// rejected.
pub fn issue_boxes_core(to: Principal, box_id: u64, amount: u64, now: u64) -> Result<Units, RewardError> {
    if box_id == 0 || box_id > registry::MAX_BOX_TYPE {
        return Err(RewardError::InvalidBoxType(box_id));
    }
    if amount == 0 {
        return Err(RewardError::ZeroAmount);
    }
    let units = box_id
        .checked_mul(amount)
        .ok_or(RewardError::UnitsOverflow)?;

    let s = supply::get_supply();
    if s.units_minted.checked_add(units).ok_or(RewardError::UnitsOverflow)? > s.units_supply {
        return Err(RewardError::SupplyExceeded);
    }
    supply::on_issue(units)?;
    log_audit(now, AuditEvent::BoxesIssued { to, box_id, amount });
    Ok(units)
}

// =============================================================================
// SUPPLY AND RATES
// =============================================================================

pub fn register_supply_core(
    class: Principal,
    kind: RewardKind,
    id: TokenId,
    amount: u128,
    now: u64,
) -> Result<Units, RewardError> {
    let units_added = inventory::register_supply(class, kind, id, amount)?;
    log_audit(
        now,
        AuditEvent::SupplyAdded {
            class,
            id,
            amount,
            units_added,
        },
    );
    Ok(units_added)
}

/// Configure a per-unit rate using the collaborator-reported balance and
/// the tracked allocated-but-unclaimed hold.
pub fn configure_rate_core(
    class: Principal,
    id: TokenId,
    new_rate: u128,
    current_balance: u128,
    now: u64,
) -> Result<Units, RewardError> {
    let record = inventory::get_class(&class).ok_or(RewardError::UnknownClass(class))?;
    let currently_allocated = match record.kind {
        RewardKind::Fungible => record.allocated,
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => 0,
        RewardKind::SemiFungibleStack => record
            .per_id
            .get(&id)
            .map(|e| e.allocated)
            .unwrap_or(0),
    };
    let units = inventory::configure_rate(class, id, new_rate, current_balance, currently_allocated)?;
    log_audit(now, AuditEvent::RateConfigured { class, id, units });
    Ok(units)
}

pub fn withdraw_inventory_core(
    class: Principal,
    id: TokenId,
    amount: u128,
    now: u64,
) -> Result<Units, RewardError> {
    let removed = inventory::withdraw_inventory(class, id, amount)?;
    log_audit(now, AuditEvent::InventoryWithdrawn { class, id, amount });
    Ok(removed)
}

// =============================================================================
// OPEN REQUESTS
// =============================================================================

/// Synchronous validation before any boxes are burned: single-flight,
/// box selection, gas floor and a free-supply precheck.
pub fn prepare_open(
    caller: Principal,
    box_ids: &[u64],
    box_amounts: &[u64],
    callback_gas: u64,
    min_callback_gas: u64,
) -> Result<Units, RewardError> {
    registry::ensure_idle(&caller)?;
    if callback_gas < min_callback_gas {
        return Err(RewardError::InsufficientGas);
    }
    let units = registry::validate_box_selection(box_ids, box_amounts)?;
    if supply::free_units() < units {
        return Err(RewardError::SupplyExceeded);
    }
    Ok(units)
}

/// The burn has happened: take the burned boxes out of circulation, then
/// reserve their units. A reservation failure here (supply drained by a
/// concurrent operation during the burn) leaves the redeem in place and
/// the caller parks the request in the failed-recoverable state.
pub fn redeem_and_reserve(units: Units) -> Result<(), RewardError> {
    supply::on_redeem(units)?;
    supply::reserve(units)
}

pub fn record_open(
    request_id: u64,
    caller: Principal,
    units: Units,
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
    callback_gas: u64,
    now: u64,
) {
    registry::insert_request(
        request_id,
        OpenRequest {
            requester: caller,
            units_to_get: units,
            burned_box_ids: box_ids,
            burned_box_amounts: box_amounts,
            callback_gas,
            created_at: now,
        },
    );
    log_audit(
        now,
        AuditEvent::RequestSubmitted {
            requester: caller,
            request_id,
            units,
        },
    );
}

/// The randomness submit itself failed after the boxes were burned: park
/// the burned-box record in the already-failed state under a local id so
/// the caller can recover. The reservation must already be released.
pub fn record_failed_open(
    caller: Principal,
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
    callback_gas: u64,
    now: u64,
    reason: &str,
) -> u64 {
    let request_id = registry::next_fallback_id();
    registry::insert_request(
        request_id,
        OpenRequest {
            requester: caller,
            units_to_get: 0,
            burned_box_ids: box_ids,
            burned_box_amounts: box_amounts,
            callback_gas,
            created_at: now,
        },
    );
    log_audit(
        now,
        AuditEvent::RequestFailed {
            requester: caller,
            request_id,
            units: 0,
            reason: short_reason(reason),
        },
    );
    request_id
}

// =============================================================================
// FULFILLMENT
// =============================================================================

/// Resolve a pending request with the oracle's seed. Success commits the
/// whole draw atomically; any allocation fault converts to the recoverable
/// failed state instead of propagating.
pub fn fulfill_core(request_id: u64, seed: [u8; 32], now: u64) -> Result<FulfillStatus, RewardError> {
    let req = registry::get_request(request_id).ok_or(RewardError::UnknownRequest(request_id))?;
    if req.units_to_get == 0 {
        // Already failed and awaiting recovery; a second callback for the
        // same id has nothing to resolve.
        return Err(RewardError::UnknownRequest(request_id));
    }

    let snapshot = inventory::snapshot_active();
    let total_units = supply::get_supply().units_supply;
    let max_steps = allocation::steps_for_gas(req.callback_gas);

    match allocation::allocate(&seed, req.units_to_get, snapshot, total_units, max_steps) {
        Ok(outcome) => {
            for (class, record) in outcome.classes {
                inventory::commit_class(class, record);
            }
            let credited: Vec<ClaimedReward> = outcome
                .credits
                .iter()
                .map(|(class, entry)| {
                    let kind = inventory::get_class(class)
                        .map(|r| r.kind)
                        .unwrap_or(RewardKind::Fungible);
                    claims::to_claimed_reward(*class, kind, entry)
                })
                .collect();
            claims::credit(req.requester, outcome.credits);
            supply::consume_fulfilled(outcome.drawn)?;
            registry::remove_request(request_id);
            log_audit(
                now,
                AuditEvent::RequestFulfilled {
                    requester: req.requester,
                    request_id,
                    units: outcome.drawn,
                },
            );
            Ok(FulfillStatus::Fulfilled {
                request_id,
                units: outcome.drawn,
                credited,
            })
        }
        Err(fault) => {
            // Nothing from the attempt was written; release the
            // reservation and keep the burned-box record recoverable.
            let released = registry::mark_failed(request_id)?;
            supply::release(released)?;
            let reason = fault.to_string();
            log_audit(
                now,
                AuditEvent::RequestFailed {
                    requester: req.requester,
                    request_id,
                    units: released,
                    reason: short_reason(&reason),
                },
            );
            Ok(FulfillStatus::Failed { request_id, reason })
        }
    }
}

// =============================================================================
// CLAIMS
// =============================================================================

/// Drain the caller's pending allocations and release the inventory holds.
/// The caller hands each returned entry to the transfer collaborator and
/// calls `claim_restore` for any that could not be delivered.
pub fn claim_take(
    account: Principal,
    now: u64,
) -> Result<Vec<(Principal, RewardKind, ClaimEntry)>, RewardError> {
    let entries = claims::drain(account)?;

    let mut released: Vec<(Principal, ClaimEntry)> = Vec::new();
    let mut fault: Option<RewardError> = None;
    for (class, entry) in &entries {
        match inventory::note_claimed(class, entry) {
            Ok(()) => released.push((*class, entry.clone())),
            Err(f) => {
                fault = Some(f);
                break;
            }
        }
    }
    if let Some(fault) = fault {
        // Invariant fault: put everything back and abort with no
        // observable effect.
        for (done_class, done_entry) in &released {
            let _ = inventory::note_unclaimed(done_class, done_entry);
        }
        for (class, entry) in entries {
            claims::restore(account, class, entry);
        }
        return Err(fault);
    }

    log_audit(
        now,
        AuditEvent::RewardsClaimed {
            account,
            classes: entries.len() as u64,
        },
    );

    Ok(entries
        .into_iter()
        .map(|(class, entry)| {
            let kind = inventory::get_class(&class)
                .map(|r| r.kind)
                .unwrap_or(RewardKind::Fungible);
            (class, kind, entry)
        })
        .collect())
}

/// A downstream transfer failed: the entry goes back to the ledger and the
/// inventory hold is restored.
pub fn claim_restore(account: Principal, class: Principal, entry: ClaimEntry, now: u64) {
    if let Err(fault) = inventory::note_unclaimed(&class, &entry) {
        log_audit(
            now,
            AuditEvent::SystemError {
                error: short_reason(&fault.to_string()),
            },
        );
    }
    claims::restore(account, class, entry);
    log_audit(now, AuditEvent::TransferRollback { account, class });
}

// =============================================================================
// RECOVERY
// =============================================================================

pub fn recover_take(caller: Principal) -> Result<(u64, OpenRequest), RewardError> {
    registry::take_recoverable(&caller)
}

/// Boxes reissued successfully: put their face value back in circulation.
pub fn recover_commit(request_id: u64, request: &OpenRequest, now: u64) -> Result<(), RewardError> {
    let units = registry::validate_box_selection(
        &request.burned_box_ids,
        &request.burned_box_amounts,
    )?;
    supply::on_issue(units)?;
    log_audit(
        now,
        AuditEvent::BoxesRecovered {
            requester: request.requester,
            request_id,
        },
    );
    Ok(())
}

/// The reissue call failed: the record goes back untouched.
pub fn recover_restore(request_id: u64, request: OpenRequest) {
    registry::restore_request(request_id, request);
}

// =============================================================================
// INTEGRITY
// =============================================================================

/// Conservation audit: weights, reservations and in-flight requests must
/// tie out exactly.
pub fn audit_invariants() -> Result<String, String> {
    inventory::verify_index()?;

    let s = supply::get_supply();
    let total_weight = inventory::total_units_all_classes();
    if total_weight != s.units_supply {
        return Err(format!(
            "❌ Audit FAILED: class weights ({}) != units_supply ({})",
            total_weight, s.units_supply
        ));
    }

    let inflight = registry::total_inflight_units();
    if inflight != s.units_requested {
        return Err(format!(
            "❌ Audit FAILED: in-flight units ({}) != units_requested ({})",
            inflight, s.units_requested
        ));
    }

    if s.units_requested > s.units_supply {
        return Err(format!(
            "❌ Audit FAILED: units_requested ({}) > units_supply ({})",
            s.units_requested, s.units_supply
        ));
    }

    Ok(format!(
        "✅ Audit passed: weights ({}) = supply ({}), requested ({}), minted ({})",
        total_weight, s.units_supply, s.units_requested, s.units_minted
    ))
}

/// Periodic self-check; divergence is logged for the indexers and for the
/// operators rather than trapping.
pub fn start_integrity_timer() {
    ic_cdk_timers::set_timer_interval(Duration::from_secs(3600), || {
        if let Err(error) = audit_invariants() {
            log_audit(
                ic_cdk::api::time(),
                AuditEvent::SystemError {
                    error: short_reason(&error),
                },
            );
        }
    });
}
