//! Failure branches of the open-request state machine: allocation faults,
//! failed randomness submits, recovery, and the single-flight rule. The
//! burned boxes must always end up either fulfilled or recoverable, never
//! both and never neither.

use candid::Principal;

use crate::engine::{
    self, audit_invariants, claims, fulfill_core, issue_boxes_core, prepare_open, record_open,
    redeem_and_reserve, registry, supply,
};
use crate::types::{FulfillStatus, RewardError, RewardKind};

fn principal(n: u8) -> Principal {
    Principal::from_slice(&[n; 8])
}

const NOW: u64 = 1_700_000_000_000_000_000;
const SEED: [u8; 32] = [0x5E; 32];
const GAS: u64 = 1_000_000_000;

fn seed_inventory() {
    let a = principal(10);
    engine::register_supply_core(a, RewardKind::Fungible, 0, 30, NOW).unwrap();
    engine::configure_rate_core(a, 0, 3, 30, NOW).unwrap();
    assert_eq!(supply::get_supply().units_supply, 10);
}

/// Open with a tiny gas budget so the allocation runs out of steps. The
/// request must convert to the recoverable failed state with the rest of
/// the ledger untouched.
#[test]
fn allocation_fault_leaves_state_recoverable() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 1, NOW).unwrap();

    // Gas worth one step; two draws need at least two.
    let gas = crate::engine::allocation::GAS_PER_STEP;
    let units = prepare_open(user, &[2], &[1], gas, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    record_open(7, user, units, vec![2], vec![1], gas, NOW);

    let before = engine::inventory::snapshot_active();
    let supply_before = supply::get_supply().units_supply;

    let status = fulfill_core(7, SEED, NOW).unwrap();
    assert!(matches!(status, FulfillStatus::Failed { request_id: 7, .. }));

    // Inventory byte-for-byte unchanged, reservation released, nothing
    // credited.
    assert_eq!(engine::inventory::snapshot_active(), before);
    let s = supply::get_supply();
    assert_eq!(s.units_supply, supply_before);
    assert_eq!(s.units_requested, 0);
    assert!(claims::pending(user).is_empty());
    audit_invariants().unwrap();

    // The account stays blocked until it recovers its boxes.
    assert_eq!(
        prepare_open(user, &[2], &[1], GAS, 0).unwrap_err(),
        RewardError::DuplicatePendingRequest
    );
    let view = registry::view_for_account(&user).unwrap();
    assert!(view.recoverable);
    assert_eq!(view.units_to_get, 0);
    assert_eq!(view.burned_box_ids, vec![2]);

    // Recovery puts the face value back in circulation.
    let (request_id, request) = engine::recover_take(user).unwrap();
    engine::recover_commit(request_id, &request, NOW).unwrap();
    assert_eq!(supply::get_supply().units_minted, 2);
    assert!(registry::request_for_account(&user).is_none());
    audit_invariants().unwrap();

    // The original inventory can still be drawn in full.
    let status = {
        let units = prepare_open(user, &[2], &[1], GAS, 0).unwrap();
        redeem_and_reserve(units).unwrap();
        record_open(8, user, units, vec![2], vec![1], GAS, NOW);
        fulfill_core(8, SEED, NOW).unwrap()
    };
    assert!(matches!(status, FulfillStatus::Fulfilled { units: 2, .. }));
}

/// A randomness submit that never reached the provider: the reservation
/// is released and the record parked under a locally generated id.
#[test]
fn failed_submit_parks_recoverable_record() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 1, NOW).unwrap();

    let units = prepare_open(user, &[2], &[1], GAS, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    supply::release(units).unwrap();
    let request_id =
        engine::record_failed_open(user, vec![2], vec![1], GAS, NOW, "provider unreachable");

    // Fallback ids live in the upper half of the id space, away from
    // anything the provider could assign.
    assert!(request_id & (1 << 63) != 0);
    audit_invariants().unwrap();

    // A late provider callback for a parked record resolves nothing.
    assert_eq!(
        fulfill_core(request_id, SEED, NOW).unwrap_err(),
        RewardError::UnknownRequest(request_id)
    );

    let (taken_id, request) = engine::recover_take(user).unwrap();
    assert_eq!(taken_id, request_id);
    engine::recover_commit(taken_id, &request, NOW).unwrap();
    assert_eq!(supply::get_supply().units_minted, 2);
    audit_invariants().unwrap();
}

/// Fulfilled requests are gone for good: no recovery, no second callback.
#[test]
fn no_double_delivery() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 1, NOW).unwrap();

    let units = prepare_open(user, &[2], &[1], GAS, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    record_open(9, user, units, vec![2], vec![1], GAS, NOW);
    let status = fulfill_core(9, SEED, NOW).unwrap();
    assert!(matches!(status, FulfillStatus::Fulfilled { .. }));

    assert_eq!(
        fulfill_core(9, SEED, NOW).unwrap_err(),
        RewardError::UnknownRequest(9)
    );
    assert_eq!(
        engine::recover_take(user).unwrap_err(),
        RewardError::NothingToRecover
    );
}

/// While fulfillment is outstanding the account can neither open again
/// nor recover.
#[test]
fn single_flight_per_account() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 2, NOW).unwrap();

    let units = prepare_open(user, &[2], &[1], GAS, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    record_open(11, user, units, vec![2], vec![1], GAS, NOW);

    assert_eq!(
        prepare_open(user, &[2], &[1], GAS, 0).unwrap_err(),
        RewardError::DuplicatePendingRequest
    );
    assert_eq!(
        engine::recover_take(user).unwrap_err(),
        RewardError::PendingOpenRequest
    );

    // Another account is unaffected.
    let other = principal(2);
    issue_boxes_core(other, 2, 1, NOW).unwrap();
    prepare_open(other, &[2], &[1], GAS, 0).unwrap();
}

/// Transfer rollback keeps the claim and the inventory hold consistent.
#[test]
fn claim_rollback_restores_ledger() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 1, NOW).unwrap();

    let units = prepare_open(user, &[2], &[1], GAS, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    record_open(13, user, units, vec![2], vec![1], GAS, NOW);
    fulfill_core(13, SEED, NOW).unwrap();

    let taken = engine::claim_take(user, NOW).unwrap();
    assert_eq!(taken.len(), 1);
    let (class, _kind, entry) = taken.into_iter().next().unwrap();

    // Simulated downstream transfer failure.
    engine::claim_restore(user, class, entry.clone(), NOW);
    audit_invariants().unwrap();

    // The entry is claimable again, and draining it a second time hands
    // back the same credit.
    let retaken = engine::claim_take(user, NOW).unwrap();
    assert_eq!(retaken.len(), 1);
    assert_eq!(retaken[0].2, entry);
    audit_invariants().unwrap();
}

/// A recovery whose reissue call failed goes back untouched and can be
/// retried.
#[test]
fn recovery_restore_is_retryable() {
    seed_inventory();
    let user = principal(1);
    issue_boxes_core(user, 2, 1, NOW).unwrap();

    let gas = crate::engine::allocation::GAS_PER_STEP;
    let units = prepare_open(user, &[2], &[1], gas, 0).unwrap();
    redeem_and_reserve(units).unwrap();
    record_open(17, user, units, vec![2], vec![1], gas, NOW);
    fulfill_core(17, SEED, NOW).unwrap();

    let (request_id, request) = engine::recover_take(user).unwrap();
    engine::recover_restore(request_id, request);

    // Still there, still recoverable.
    let (again_id, request) = engine::recover_take(user).unwrap();
    assert_eq!(again_id, request_id);
    engine::recover_commit(again_id, &request, NOW).unwrap();
    assert_eq!(supply::get_supply().units_minted, 2);
    audit_invariants().unwrap();
}
