//! Single-flight open-request tracking, keyed by the randomness provider's
//! request handle. A request record lives from submission until successful
//! fulfillment or box recovery; a failed fulfillment zeroes `units_to_get`
//! but keeps the burned-box record so nothing is ever lost.

use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::{StableBTreeMap, StableCell};
use std::cell::RefCell;

use super::memory_ids::{
    FALLBACK_REQUEST_COUNTER_MEMORY_ID, OPEN_REQUESTS_MEMORY_ID, PENDING_BY_ACCOUNT_MEMORY_ID,
};
use crate::types::{OpenRequest, OpenRequestView, RewardError, Units};
use crate::{Memory, MEMORY_MANAGER};

/// Box type ids double as unit face values and must stay in one byte.
pub const MAX_BOX_TYPE: u64 = 255;

thread_local! {
    static OPEN_REQUESTS: RefCell<StableBTreeMap<u64, OpenRequest, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(OPEN_REQUESTS_MEMORY_ID))),
        ));

    // Enforces at-most-one live request per account.
    static PENDING_BY_ACCOUNT: RefCell<StableBTreeMap<Principal, u64, Memory>> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(PENDING_BY_ACCOUNT_MEMORY_ID))),
        ));

    // Local ids for requests that never reached the provider (submit
    // failure). High bit set so they can never collide with provider ids.
    static FALLBACK_COUNTER: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(FALLBACK_REQUEST_COUNTER_MEMORY_ID))),
            0u64
        ).expect("Failed to init fallback request counter")
    );
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate a box selection and compute the units it entitles to:
/// sum of face value times amount over all entries.
pub fn validate_box_selection(box_ids: &[u64], box_amounts: &[u64]) -> Result<Units, RewardError> {
    if box_ids.len() != box_amounts.len() {
        return Err(RewardError::LengthMismatch);
    }
    if box_ids.is_empty() {
        return Err(RewardError::ZeroAmount);
    }
    let mut units: Units = 0;
    for (id, amount) in box_ids.iter().zip(box_amounts.iter()) {
        if *id == 0 || *id > MAX_BOX_TYPE {
            return Err(RewardError::InvalidBoxType(*id));
        }
        if *amount == 0 {
            return Err(RewardError::ZeroAmount);
        }
        let face = id.checked_mul(*amount).ok_or(RewardError::UnitsOverflow)?;
        units = units.checked_add(face).ok_or(RewardError::UnitsOverflow)?;
    }
    if units == 0 {
        return Err(RewardError::ZeroAmount);
    }
    Ok(units)
}

/// Reject a second request while one is live for the account.
pub fn ensure_idle(account: &Principal) -> Result<(), RewardError> {
    PENDING_BY_ACCOUNT.with(|p| {
        if p.borrow().contains_key(account) {
            Err(RewardError::DuplicatePendingRequest)
        } else {
            Ok(())
        }
    })
}

// =============================================================================
// STATE TRANSITIONS
// =============================================================================

pub fn insert_request(request_id: u64, request: OpenRequest) {
    PENDING_BY_ACCOUNT.with(|p| p.borrow_mut().insert(request.requester, request_id));
    OPEN_REQUESTS.with(|r| r.borrow_mut().insert(request_id, request));
}

pub fn get_request(request_id: u64) -> Option<OpenRequest> {
    OPEN_REQUESTS.with(|r| r.borrow().get(&request_id))
}

/// Successful fulfillment: the request is replaced by claim entries.
pub fn remove_request(request_id: u64) -> Option<OpenRequest> {
    let removed = OPEN_REQUESTS.with(|r| r.borrow_mut().remove(&request_id));
    if let Some(req) = &removed {
        PENDING_BY_ACCOUNT.with(|p| p.borrow_mut().remove(&req.requester));
    }
    removed
}

/// Failed fulfillment: zero `units_to_get`, keep the burned-box record.
/// The request becomes recoverable; the account stays blocked until it
/// recovers its boxes.
pub fn mark_failed(request_id: u64) -> Result<Units, RewardError> {
    OPEN_REQUESTS.with(|r| {
        let mut requests = r.borrow_mut();
        let mut req = requests
            .get(&request_id)
            .ok_or(RewardError::UnknownRequest(request_id))?;
        let released = req.units_to_get;
        req.units_to_get = 0;
        requests.insert(request_id, req);
        Ok(released)
    })
}

/// Recovery: take the failed request out of the registry. Fails with
/// `PendingOpenRequest` while fulfillment is still outstanding and
/// `NothingToRecover` when the account has no request at all.
pub fn take_recoverable(account: &Principal) -> Result<(u64, OpenRequest), RewardError> {
    let request_id = PENDING_BY_ACCOUNT
        .with(|p| p.borrow().get(account))
        .ok_or(RewardError::NothingToRecover)?;
    let req = get_request(request_id)
        .ok_or_else(|| RewardError::StateCorruption("pending index without request".into()))?;
    if req.units_to_get > 0 {
        return Err(RewardError::PendingOpenRequest);
    }
    remove_request(request_id);
    Ok((request_id, req))
}

/// Undo a `take_recoverable` when the box reissue call failed.
pub fn restore_request(request_id: u64, request: OpenRequest) {
    insert_request(request_id, request);
}

pub fn request_for_account(account: &Principal) -> Option<(u64, OpenRequest)> {
    let request_id = PENDING_BY_ACCOUNT.with(|p| p.borrow().get(account))?;
    get_request(request_id).map(|req| (request_id, req))
}

pub fn view_for_account(account: &Principal) -> Option<OpenRequestView> {
    request_for_account(account).map(|(request_id, req)| OpenRequestView {
        request_id,
        units_to_get: req.units_to_get,
        burned_box_ids: req.burned_box_ids.clone(),
        burned_box_amounts: req.burned_box_amounts.clone(),
        created_at: req.created_at,
        recoverable: req.units_to_get == 0,
    })
}

/// Sum of in-flight units across live (non-failed) requests; must always
/// equal `units_requested`.
pub fn total_inflight_units() -> Units {
    OPEN_REQUESTS.with(|r| r.borrow().iter().map(|(_, req)| req.units_to_get).sum())
}

pub fn next_fallback_id() -> u64 {
    FALLBACK_COUNTER.with(|cell| {
        let next = *cell.borrow().get() + 1;
        cell.borrow_mut()
            .set(next)
            .expect("CRITICAL: Failed to write fallback request counter");
        (1 << 63) | next
    })
}
