use candid::Principal;
use std::cell::RefCell;
use std::collections::BTreeSet;

use crate::types::RewardError;

thread_local! {
    static PENDING_OPERATIONS: RefCell<BTreeSet<Principal>> = RefCell::new(BTreeSet::new());
}

/// Guard to prevent concurrent operations from the same caller across
/// await points. Uses RAII pattern to automatically cleanup on drop.
pub struct OperationGuard {
    caller: Principal,
}

impl OperationGuard {
    /// Create a new guard for the given caller.
    /// Returns an error if the caller already has an operation in flight.
    pub fn new(caller: Principal) -> Result<Self, RewardError> {
        PENDING_OPERATIONS.with(|ops| {
            let mut ops = ops.borrow_mut();
            if ops.contains(&caller) {
                return Err(RewardError::OperationInProgress);
            }
            ops.insert(caller);
            Ok(Self { caller })
        })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        PENDING_OPERATIONS.with(|ops| {
            ops.borrow_mut().remove(&self.caller);
        });
    }
}

/// Emergency safety valve: clear a stuck guard for a specific principal.
///
/// Exists in case a guard fails to drop (canister trap/upgrade during an
/// operation). Bypasses the guard protection; last-resort recovery only.
///
/// Returns: true if a guard was cleared, false if no guard existed.
pub fn clear_guard_for_principal(principal: Principal) -> bool {
    PENDING_OPERATIONS.with(|ops| ops.borrow_mut().remove(&principal))
}
