use candid::{Nat, Principal};
use ic_cdk::{init, post_upgrade, pre_upgrade, query, update};
use ic_stable_structures::memory_manager::{MemoryManager, VirtualMemory};
use ic_stable_structures::DefaultMemoryImpl;
use sha2::{Digest, Sha256};
use std::cell::RefCell;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

mod collaborators;
mod config;
pub mod engine;
pub mod pack;
pub mod types;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use pack::PackedUnitInfo;
pub use types::{
    AuditEntry, ClaimedReward, Config, FulfillStatus, OpenRequestView, RewardClassView,
    RewardError, RewardKind, SupplyAccount,
};

use engine::guard::OperationGuard;
use types::TokenId;

// =============================================================================
// MEMORY MANAGEMENT
// =============================================================================

type Memory = VirtualMemory<DefaultMemoryImpl>;

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));
}

// =============================================================================
// LIFECYCLE HOOKS
// =============================================================================

#[init]
fn init(initial_config: Config) {
    config::set_config(initial_config);
    ic_cdk::println!("Reward Box Backend Initialized");

    engine::start_integrity_timer();
}

#[pre_upgrade]
fn pre_upgrade() {
    // Stable structures persist automatically, no special handling needed.
}

#[post_upgrade]
fn post_upgrade() {
    engine::start_integrity_timer();
}

// =============================================================================
// ADMIN & SUPPLIER ENDPOINTS
// =============================================================================

#[update]
fn set_config(new_config: Config) -> Result<(), RewardError> {
    config::require_admin(ic_cdk::caller())?;
    config::set_config(new_config);
    Ok(())
}

/// Sell boxes: mint through the box token and account their face value.
/// Accounting happens first; a definite mint failure rolls it back.
#[update]
async fn issue_boxes(to: Principal, box_id: u64, amount: u64) -> Result<u64, RewardError> {
    let caller = ic_cdk::caller();
    config::require_admin(caller)?;
    let _guard = OperationGuard::new(caller)?;

    let units = engine::issue_boxes_core(to, box_id, amount, ic_cdk::api::time())?;

    let cfg = config::get_config();
    match collaborators::issue_boxes(cfg.box_token, to, box_id, amount).await {
        Ok(()) => Ok(units),
        Err(e) => {
            engine::supply::on_redeem(units)?;
            Err(e)
        }
    }
}

/// Register reward items that the supplier has transferred in. The first
/// supply of a class fixes its kind.
#[update]
fn register_supply(
    class: Principal,
    kind: RewardKind,
    id: TokenId,
    amount: Nat,
) -> Result<u64, RewardError> {
    config::require_supplier(ic_cdk::caller())?;
    // Class-scoped guard: rejects supply while a rate configure for the
    // same class is awaiting its balance query.
    let _guard = OperationGuard::new(class)?;

    let amount = pack::nat_to_amount(&amount)?;
    engine::register_supply_core(class, kind, id, amount, ic_cdk::api::time())
}

/// Set the per-unit rate for a class (or one id of a stack class) and
/// recompute its weight from the collaborator-reported balance.
#[update]
async fn configure_rate(class: Principal, id: TokenId, new_rate: Nat) -> Result<u64, RewardError> {
    config::require_supplier(ic_cdk::caller())?;
    let _guard = OperationGuard::new(class)?;

    let new_rate = pack::nat_to_amount(&new_rate)?;
    let current_balance = collaborators::balance_held(class, id).await?;
    engine::configure_rate_core(class, id, new_rate, current_balance, ic_cdk::api::time())
}

/// Withdraw unallocated inventory back to the admin, shrinking weight and
/// supply accordingly.
#[update]
async fn admin_withdraw(class: Principal, id: TokenId, amount: Nat) -> Result<u64, RewardError> {
    let caller = ic_cdk::caller();
    config::require_admin(caller)?;
    let _guard = OperationGuard::new(class)?;

    let amount = pack::nat_to_amount(&amount)?;
    let kind = engine::inventory::get_class(&class)
        .ok_or(RewardError::UnknownClass(class))?
        .kind;
    let removed = engine::withdraw_inventory_core(class, id, amount, ic_cdk::api::time())?;

    let entry = withdrawal_entry(kind, id, amount);
    match collaborators::transfer_reward(class, kind, caller, &entry).await {
        Ok(()) => Ok(removed),
        Err(e) => {
            // Definite transfer failure: put the inventory back.
            if let Err(fault) =
                engine::register_supply_core(class, kind, id, amount, ic_cdk::api::time())
            {
                engine::audit::log_audit(
                    ic_cdk::api::time(),
                    types::AuditEvent::SystemError {
                        error: engine::audit::short_reason(&fault.to_string()),
                    },
                );
            }
            Err(e)
        }
    }
}

fn withdrawal_entry(kind: RewardKind, id: TokenId, amount: u128) -> types::ClaimEntry {
    let mut entry = types::ClaimEntry::default();
    match kind {
        RewardKind::Fungible => entry.amount = amount,
        RewardKind::UniqueItem | RewardKind::SemiFungibleUnique => entry.ids = vec![id],
        RewardKind::SemiFungibleStack => {
            entry.id_amounts.insert(id, amount);
        }
    }
    entry
}

#[update]
fn admin_clear_guard(principal: Principal) -> Result<bool, RewardError> {
    config::require_admin(ic_cdk::caller())?;
    Ok(engine::guard::clear_guard_for_principal(principal))
}

// =============================================================================
// OPEN / FULFILL / CLAIM / RECOVER
// =============================================================================

/// Burn boxes and submit an open request to the randomness provider.
/// Returns the provider's request handle.
#[update]
async fn open_boxes(
    box_ids: Vec<u64>,
    box_amounts: Vec<u64>,
    callback_gas: u64,
) -> Result<u64, RewardError> {
    let caller = ic_cdk::caller();
    let _guard = OperationGuard::new(caller)?;
    let cfg = config::get_config();

    let units = engine::prepare_open(
        caller,
        &box_ids,
        &box_amounts,
        callback_gas,
        cfg.min_callback_gas,
    )?;

    // Burn before reserving; from here on the boxes are either turned into
    // a live request or parked as a recoverable record.
    collaborators::burn_boxes(cfg.box_token, caller, box_ids.clone(), box_amounts.clone()).await?;

    let now = ic_cdk::api::time();
    if let Err(e) = engine::redeem_and_reserve(units) {
        engine::record_failed_open(
            caller,
            box_ids,
            box_amounts,
            callback_gas,
            now,
            "supply drained while boxes were burning",
        );
        return Err(e);
    }

    match collaborators::request_randomness(cfg.randomness_provider, callback_gas).await {
        Ok(request_id) => {
            engine::record_open(
                request_id,
                caller,
                units,
                box_ids,
                box_amounts,
                callback_gas,
                ic_cdk::api::time(),
            );
            Ok(request_id)
        }
        Err(e) => {
            engine::supply::release(units)?;
            engine::record_failed_open(
                caller,
                box_ids,
                box_amounts,
                callback_gas,
                ic_cdk::api::time(),
                &e.to_string(),
            );
            Err(e)
        }
    }
}

/// Randomness callback, provider-only. Resource faults during allocation
/// surface as `FulfillStatus::Failed` with the request left recoverable.
#[update]
fn fulfill_randomness(request_id: u64, randomness: Vec<u8>) -> Result<FulfillStatus, RewardError> {
    config::require_randomness_provider(ic_cdk::caller())?;

    let mut hasher = Sha256::new();
    hasher.update(&randomness);
    let seed: [u8; 32] = hasher.finalize()[0..32].try_into().unwrap();

    engine::fulfill_core(request_id, seed, ic_cdk::api::time())
}

/// Drain and deliver every pending allocation for the caller. Entries
/// whose transfer fails are restored to the ledger; the call reports what
/// was actually delivered.
#[update]
async fn claim_rewards() -> Result<Vec<ClaimedReward>, RewardError> {
    let caller = ic_cdk::caller();
    let _guard = OperationGuard::new(caller)?;

    let entries = engine::claim_take(caller, ic_cdk::api::time())?;

    let mut delivered = Vec::new();
    let mut last_failure: Option<RewardError> = None;
    for (class, kind, entry) in entries {
        match collaborators::transfer_reward(class, kind, caller, &entry).await {
            Ok(()) => delivered.push(engine::claims::to_claimed_reward(class, kind, &entry)),
            Err(e) => {
                engine::claim_restore(caller, class, entry, ic_cdk::api::time());
                last_failure = Some(e);
            }
        }
    }

    if delivered.is_empty() {
        if let Some(e) = last_failure {
            return Err(e);
        }
    }
    Ok(delivered)
}

/// Reissue the boxes of a failed open request back to the caller.
#[update]
async fn recover_boxes() -> Result<(Vec<u64>, Vec<u64>), RewardError> {
    let caller = ic_cdk::caller();
    let _guard = OperationGuard::new(caller)?;
    let cfg = config::get_config();

    let (request_id, request) = engine::recover_take(caller)?;

    match collaborators::issue_boxes_batch(
        cfg.box_token,
        caller,
        request.burned_box_ids.clone(),
        request.burned_box_amounts.clone(),
    )
    .await
    {
        Ok(()) => {
            engine::recover_commit(request_id, &request, ic_cdk::api::time())?;
            Ok((request.burned_box_ids, request.burned_box_amounts))
        }
        Err(e) => {
            // Reissue failed: the record goes back so nothing is lost.
            engine::recover_restore(request_id, request);
            Err(e)
        }
    }
}

// =============================================================================
// QUERIES
// =============================================================================

#[query]
fn get_config() -> Config {
    config::get_config()
}

#[query]
fn get_supply_stats() -> SupplyAccount {
    engine::supply::get_supply()
}

#[query]
fn get_reward_class(class: Principal) -> Option<RewardClassView> {
    engine::inventory::class_view(&class)
}

#[query]
fn get_active_classes() -> Vec<Principal> {
    engine::inventory::active_classes()
}

#[query]
fn get_claimable(account: Principal) -> Vec<ClaimedReward> {
    engine::claims::pending(account)
        .into_iter()
        .map(|(class, entry)| {
            let kind = engine::inventory::get_class(&class)
                .map(|r| r.kind)
                .unwrap_or(RewardKind::Fungible);
            engine::claims::to_claimed_reward(class, kind, &entry)
        })
        .collect()
}

#[query]
fn get_my_claimable() -> Vec<ClaimedReward> {
    get_claimable(ic_cdk::caller())
}

#[query]
fn get_open_request(account: Principal) -> Option<OpenRequestView> {
    engine::registry::view_for_account(&account)
}

#[query]
fn get_my_open_request() -> Option<OpenRequestView> {
    get_open_request(ic_cdk::caller())
}

#[query]
fn get_audit_log(offset: u64, limit: u64) -> Vec<AuditEntry> {
    engine::audit::get_audit_log(offset as usize, limit as usize)
}

#[query]
fn get_audit_log_size() -> u64 {
    engine::audit::audit_len()
}

#[query]
fn audit_invariants() -> Result<String, String> {
    engine::audit_invariants()
}
