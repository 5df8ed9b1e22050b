//! The happy path end to end: inventory arrives, boxes are sold, opened,
//! fulfilled and claimed, with the supply counters tying out at every
//! stage.

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

/// Fungible class with weight 10 at 3 tokens per unit, plus a unique class
/// of 5 items. Total sellable supply: 15 units.
fn seed_inventory() -> (Principal, Principal) {
    let a = principal(10);
    let b = principal(11);

    engine::register_supply_core(a, RewardKind::Fungible, 0, 30, NOW).unwrap();
    engine::configure_rate_core(a, 0, 3, 30, NOW).unwrap();

    for id in 1..=5u128 {
        engine::register_supply_core(b, RewardKind::UniqueItem, id, 1, NOW).unwrap();
    }

    assert_eq!(supply::get_supply().units_supply, 15);
    (a, b)
}

/// Drives one open request through burn accounting, reservation,
/// registration and fulfillment.
fn open_and_fulfill(
    user: Principal,
    request_id: u64,
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
    gas: u64,
    seed: [u8; 32],
) -> Result<FulfillStatus, RewardError> {
    let units = prepare_open(user, &box_ids, &box_amounts, gas, 0)?;
    redeem_and_reserve(units)?;
    record_open(request_id, user, units, box_ids, box_amounts, gas, NOW);
    fulfill_core(request_id, seed, NOW)
}

#[test]
fn issue_open_fulfill_claim() {
    seed_inventory();
    let user = principal(1);

    // Sell one type-2 box: face value 2 units.
    assert_eq!(issue_boxes_core(user, 2, 1, NOW).unwrap(), 2);
    assert_eq!(supply::get_supply().units_minted, 2);

    let status = open_and_fulfill(user, 42, vec![2], vec![1], GAS, SEED).unwrap();
    let credited = match status {
        FulfillStatus::Fulfilled {
            request_id,
            units,
            credited,
        } => {
            assert_eq!(request_id, 42);
            assert_eq!(units, 2);
            credited
        }
        other => panic!("expected fulfillment, got {:?}", other),
    };
    assert!(!credited.is_empty());

    // Two units left the sellable supply; nothing remains in flight.
    let s = supply::get_supply();
    assert_eq!(s.units_supply, 13);
    assert_eq!(s.units_requested, 0);
    assert_eq!(s.units_minted, 0);
    assert!(registry::request_for_account(&user).is_none());
    audit_invariants().unwrap();

    // The allocation sits in the claim ledger until collected.
    assert!(!claims::pending(user).is_empty());
    let taken = engine::claim_take(user, NOW).unwrap();
    let taken_units: u64 = taken
        .iter()
        .map(|(_, _, e)| {
            (e.amount / 3) as u64
                + e.ids.len() as u64
                + e.id_amounts.values().map(|amt| *amt as u64).sum::<u64>()
        })
        .sum();
    assert_eq!(taken_units, 2);
    assert!(claims::pending(user).is_empty());
    audit_invariants().unwrap();

    // Claiming drained everything; a second claim has nothing.
    assert_eq!(
        engine::claim_take(user, NOW).unwrap_err(),
        RewardError::NothingToClaim
    );
}

#[test]
fn same_seed_same_rewards() {
    seed_inventory();
    let alice = principal(1);
    let bob = principal(2);

    issue_boxes_core(alice, 3, 1, NOW).unwrap();
    issue_boxes_core(bob, 3, 1, NOW).unwrap();

    // Identical seeds over identical remaining state would collide, so
    // give bob a different seed and check alice is reproducible against
    // her own pre-draw snapshot instead.
    let before = crate::engine::inventory::snapshot_active();
    let first = open_and_fulfill(alice, 1, vec![3], vec![1], GAS, SEED).unwrap();

    // Replaying the same draw against the saved snapshot produces the
    // same credits.
    let total = 15;
    let replay = crate::engine::allocation::allocate(&SEED, 3, before, total, u64::MAX).unwrap();
    match first {
        FulfillStatus::Fulfilled { credited, .. } => {
            let replay_classes: Vec<Principal> =
                replay.credits.iter().map(|(c, _)| *c).collect();
            let live_classes: Vec<Principal> = credited.iter().map(|c| c.class).collect();
            assert_eq!(replay_classes, live_classes);
        }
        other => panic!("expected fulfillment, got {:?}", other),
    }

    let second = open_and_fulfill(bob, 2, vec![3], vec![1], GAS, [0x77; 32]).unwrap();
    assert!(matches!(second, FulfillStatus::Fulfilled { units: 3, .. }));

    audit_invariants().unwrap();
}

#[test]
fn open_rejected_when_supply_short() {
    seed_inventory();
    let user = principal(1);

    // 15 units exist; a selection worth 16 cannot be opened, and boxes
    // worth 16 cannot even be minted.
    assert_eq!(
        issue_boxes_core(user, 8, 2, NOW).unwrap_err(),
        RewardError::SupplyExceeded
    );
    assert_eq!(
        prepare_open(user, &[8], &[2], GAS, 0).unwrap_err(),
        RewardError::SupplyExceeded
    );
    issue_boxes_core(user, 5, 3, NOW).unwrap();

    // A selection worth 15 drains the whole inventory.
    let status = open_and_fulfill(user, 9, vec![5, 1], vec![3, 0], GAS, SEED);
    // zero-amount entries are rejected outright
    assert_eq!(status.unwrap_err(), RewardError::ZeroAmount);

    let status = open_and_fulfill(user, 9, vec![5], vec![3], GAS, SEED).unwrap();
    assert!(matches!(status, FulfillStatus::Fulfilled { units: 15, .. }));
    assert_eq!(supply::get_supply().units_supply, 0);
    audit_invariants().unwrap();
}

#[test]
fn gas_floor_and_box_validation() {
    seed_inventory();
    let user = principal(1);

    assert_eq!(
        prepare_open(user, &[2], &[1], 99, 100).unwrap_err(),
        RewardError::InsufficientGas
    );
    assert_eq!(
        prepare_open(user, &[2, 3], &[1], GAS, 0).unwrap_err(),
        RewardError::LengthMismatch
    );
    assert_eq!(
        prepare_open(user, &[], &[], GAS, 0).unwrap_err(),
        RewardError::ZeroAmount
    );
    assert!(matches!(
        prepare_open(user, &[0], &[1], GAS, 0).unwrap_err(),
        RewardError::InvalidBoxType(0)
    ));
    assert!(matches!(
        prepare_open(user, &[512], &[1], GAS, 0).unwrap_err(),
        RewardError::InvalidBoxType(512)
    ));
}

#[test]
fn minting_beyond_inventory_backing_is_rejected() {
    seed_inventory();
    let user = principal(1);

    // 15 units of inventory back at most 15 units of box face value.
    issue_boxes_core(user, 5, 2, NOW).unwrap();
    assert_eq!(
        issue_boxes_core(user, 6, 1, NOW).unwrap_err(),
        RewardError::SupplyExceeded
    );
    assert_eq!(issue_boxes_core(user, 5, 1, NOW).unwrap(), 5);
    assert_eq!(supply::get_supply().units_minted, 15);
}
