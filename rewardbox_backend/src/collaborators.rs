//! Inter-canister wrappers for the external collaborators: the box token,
//! the reward-token transfer surface, and the randomness provider. Each
//! wrapper converts rejection codes into `RewardError::CallFailed`; the
//! callers decide what rolls back.

use candid::{Nat, Principal};
use ic_cdk::api::call::RejectionCode;

use crate::pack::nat_to_amount;
use crate::types::{ClaimEntry, RewardError, RewardKind, TokenId};

fn call_failed(err: (RejectionCode, String)) -> RewardError {
    RewardError::CallFailed(format!("{:?}: {}", err.0, err.1))
}

// =============================================================================
// BOX TOKEN
// =============================================================================

/// Mint `amount` boxes of type `box_id` (face value `box_id` units each).
pub async fn issue_boxes(
    box_token: Principal,
    to: Principal,
    box_id: u64,
    amount: u64,
) -> Result<(), RewardError> {
    let (result,): (Result<(), String>,) =
        ic_cdk::call(box_token, "issue", (to, box_id, amount))
            .await
            .map_err(call_failed)?;
    result.map_err(RewardError::CallFailed)
}

/// All-or-nothing batch mint, used when recovering a failed request.
pub async fn issue_boxes_batch(
    box_token: Principal,
    to: Principal,
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
) -> Result<(), RewardError> {
    let (result,): (Result<(), String>,) =
        ic_cdk::call(box_token, "issue_batch", (to, box_ids, box_amounts))
            .await
            .map_err(call_failed)?;
    result.map_err(RewardError::CallFailed)
}

/// All-or-nothing burn of the caller's boxes ahead of an open request.
pub async fn burn_boxes(
    box_token: Principal,
    from: Principal,
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
) -> Result<(), RewardError> {
    let (result,): (Result<(), String>,) =
        ic_cdk::call(box_token, "burn", (from, box_ids, box_amounts))
            .await
            .map_err(call_failed)?;
    result.map_err(RewardError::CallFailed)
}

// =============================================================================
// REWARD TOKENS
// =============================================================================

/// Amount of the reward asset the engine holds, as reported by the asset
/// canister itself. Input to rate configuration.
pub async fn balance_held(class: Principal, id: TokenId) -> Result<u128, RewardError> {
    let holder = ic_cdk::id();
    let (balance,): (Nat,) = ic_cdk::call(class, "balance_held", (holder, id))
        .await
        .map_err(call_failed)?;
    nat_to_amount(&balance)
}

/// Deliver one drained claim entry. One all-or-nothing batch call per
/// class so a failure rolls back a whole entry, never half of one.
pub async fn transfer_reward(
    class: Principal,
    kind: RewardKind,
    to: Principal,
    entry: &ClaimEntry,
) -> Result<(), RewardError> {
    let (ids, amounts): (Vec<TokenId>, Vec<Nat>) = match kind {
        RewardKind::Fungible => (vec![0], vec![Nat::from(entry.amount)]),
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => (
            entry.ids.clone(),
            entry.ids.iter().map(|_| Nat::from(1_u64)).collect(),
        ),
        RewardKind::SemiFungibleStack => (
            entry.id_amounts.keys().copied().collect(),
            entry.id_amounts.values().map(|a| Nat::from(*a)).collect(),
        ),
    };

    let (result,): (Result<(), String>,) =
        ic_cdk::call(class, "transfer_out", (to, ids, amounts))
            .await
            .map_err(call_failed)?;
    result.map_err(RewardError::CallFailed)
}

// =============================================================================
// RANDOMNESS PROVIDER
// =============================================================================

/// Submit an asynchronous randomness request; the provider later calls
/// back `fulfill_randomness` exactly once with this id.
pub async fn request_randomness(
    provider: Principal,
    callback_gas: u64,
) -> Result<u64, RewardError> {
    let (request_id,): (u64,) = ic_cdk::call(provider, "request_randomness", (callback_gas,))
        .await
        .map_err(call_failed)?;
    Ok(request_id)
}
