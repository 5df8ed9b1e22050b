//! Central registry for stable memory IDs.
//!
//! IMPORTANT: All memory IDs must be unique across the entire canister.
//!
//! Allocation strategy:
//! - 0-9: Configuration and global counters
//! - 10-19: Inventory (reward classes, active index)
//! - 20-29: Open requests
//! - 30-39: Claim ledger
//! - 40-49: Audit trail

// Configuration and counters (0-9)
pub const CONFIG_MEMORY_ID: u8 = 0;
pub const SUPPLY_MEMORY_ID: u8 = 1;
pub const FALLBACK_REQUEST_COUNTER_MEMORY_ID: u8 = 2;

// Inventory (10-19)
pub const REWARD_CLASSES_MEMORY_ID: u8 = 10;
pub const ACTIVE_INDEX_MEMORY_ID: u8 = 11;

// Open requests (20-29)
pub const OPEN_REQUESTS_MEMORY_ID: u8 = 20;
pub const PENDING_BY_ACCOUNT_MEMORY_ID: u8 = 21;

// Claim ledger (30-39)
pub const CLAIMS_MEMORY_ID: u8 = 30;

// Audit trail (40-49)
pub const AUDIT_LOG_MEMORY_ID: u8 = 40;
