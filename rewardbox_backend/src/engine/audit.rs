//! Fire-and-forget notification sink: an append-only audit trail consumed
//! by external indexers through the paged query endpoint.

use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableVec;
use std::cell::RefCell;

use super::memory_ids::AUDIT_LOG_MEMORY_ID;
use crate::types::{AuditEntry, AuditEvent};
use crate::{Memory, MEMORY_MANAGER};

thread_local! {
    // Audit trail (unbounded - monitor size periodically).
    // Growth estimate: ~300 bytes/entry; archive if it exceeds 100k entries.
    static AUDIT_LOG: RefCell<StableVec<AuditEntry, Memory>> = RefCell::new(
        StableVec::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(AUDIT_LOG_MEMORY_ID)))
        ).expect("Failed to init audit log")
    );
}

pub fn log_audit(now: u64, event: AuditEvent) {
    AUDIT_LOG.with(|log| {
        let entry = AuditEntry {
            timestamp: now,
            event: event.clone(),
        };
        if log.borrow_mut().push(&entry).is_err() {
            ic_cdk::println!("AUDIT LOG FULL! Failed to log event: {:?}", event);
        }
    });
}

pub fn get_audit_log(offset: usize, limit: usize) -> Vec<AuditEntry> {
    AUDIT_LOG.with(|log| log.borrow().iter().skip(offset).take(limit).collect())
}

pub fn audit_len() -> u64 {
    AUDIT_LOG.with(|log| log.borrow().len())
}

/// Keep fault reasons short enough for the bounded audit entry encoding.
/// The cut is on a char boundary at or below the byte limit, so multibyte
/// reasons can never exceed it.
pub fn short_reason(reason: &str) -> String {
    const MAX: usize = 128;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
