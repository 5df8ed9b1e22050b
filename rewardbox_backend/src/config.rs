//! Canister configuration: collaborator principals, role checks and the
//! callback-gas floor.

use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableCell;
use std::cell::RefCell;

use crate::engine::memory_ids::CONFIG_MEMORY_ID;
use crate::types::{Config, RewardError};
use crate::{Memory, MEMORY_MANAGER};

thread_local! {
    static CONFIG_CELL: RefCell<StableCell<Config, Memory>> = RefCell::new(
        StableCell::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(CONFIG_MEMORY_ID))),
            Config::default()
        ).expect("Failed to init config cell")
    );
}

pub fn get_config() -> Config {
    CONFIG_CELL.with(|cell| cell.borrow().get().clone())
}

pub fn set_config(config: Config) {
    CONFIG_CELL.with(|cell| {
        cell.borrow_mut()
            .set(config)
            .expect("CRITICAL: Failed to write config cell")
    });
}

pub fn require_admin(caller: Principal) -> Result<(), RewardError> {
    if caller == get_config().admin {
        Ok(())
    } else {
        Err(RewardError::NotAuthorized)
    }
}

/// Suppliers may register supply and configure rates; the admin is always
/// also a supplier.
pub fn require_supplier(caller: Principal) -> Result<(), RewardError> {
    let config = get_config();
    if caller == config.supplier || caller == config.admin {
        Ok(())
    } else {
        Err(RewardError::NotAuthorized)
    }
}

pub fn require_randomness_provider(caller: Principal) -> Result<(), RewardError> {
    if caller == get_config().randomness_provider {
        Ok(())
    } else {
        Err(RewardError::NotAuthorized)
    }
}
