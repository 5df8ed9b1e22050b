use candid::{CandidType, Deserialize, Principal};
use ic_stable_structures::storable::Bound;
use ic_stable_structures::Storable;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::pack::PackedUnitInfo;

/// Opaque id of an item inside a reward class (NFT id, multi-token id).
pub type TokenId = u128;

/// Common denomination all reward weight is converted into. One consumed
/// box of face value `k` entitles the holder to `k` draws.
pub type Units = u64;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(CandidType, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum RewardError {
    UnitsOverflow,
    AmountOverflow,
    ZeroAmount,
    InvalidAmount,
    LengthMismatch,
    InvalidBoxType(u64),
    ModifiedKind,
    UnsupportedKind,
    UnknownClass(Principal),
    UnknownId(TokenId),
    DuplicateId(TokenId),
    SupplyExceeded,
    InsufficientSupply,
    DuplicatePendingRequest,
    InsufficientGas,
    UnknownRequest(u64),
    NothingToRecover,
    PendingOpenRequest,
    NothingToClaim,
    NotAuthorized,
    OperationInProgress,
    StepBudgetExhausted,
    StateCorruption(String),
    CallFailed(String),
}

impl fmt::Display for RewardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardError::UnitsOverflow => write!(f, "unit count exceeds field width"),
            RewardError::AmountOverflow => write!(f, "amount exceeds field width"),
            RewardError::ZeroAmount => write!(f, "amount must be non-zero"),
            RewardError::InvalidAmount => write!(f, "amount not valid for this reward kind"),
            RewardError::LengthMismatch => write!(f, "array lengths do not match"),
            RewardError::InvalidBoxType(id) => {
                write!(f, "box type {} outside the 1..=255 face-value range", id)
            }
            RewardError::ModifiedKind => {
                write!(f, "reward kind is fixed at first supply and cannot change")
            }
            RewardError::UnsupportedKind => write!(f, "reward kind not supported here"),
            RewardError::UnknownClass(p) => write!(f, "no reward class registered for {}", p),
            RewardError::UnknownId(id) => write!(f, "id {} is not held by the inventory", id),
            RewardError::DuplicateId(id) => write!(f, "id {} already held by the inventory", id),
            RewardError::SupplyExceeded => {
                write!(f, "not enough unreserved supply for this request")
            }
            RewardError::InsufficientSupply => {
                write!(f, "supply would fall below outstanding requests")
            }
            RewardError::DuplicatePendingRequest => {
                write!(f, "caller already has a pending open request")
            }
            RewardError::InsufficientGas => write!(f, "callback gas budget below the floor"),
            RewardError::UnknownRequest(id) => write!(f, "no open request with id {}", id),
            RewardError::NothingToRecover => write!(f, "no failed request to recover"),
            RewardError::PendingOpenRequest => {
                write!(f, "request is still pending fulfillment")
            }
            RewardError::NothingToClaim => write!(f, "no pending rewards to claim"),
            RewardError::NotAuthorized => write!(f, "caller lacks the required role"),
            RewardError::OperationInProgress => {
                write!(f, "operation already in progress for this caller")
            }
            RewardError::StepBudgetExhausted => {
                write!(f, "allocation ran out of its step budget")
            }
            RewardError::StateCorruption(msg) => write!(f, "state corruption detected: {}", msg),
            RewardError::CallFailed(msg) => write!(f, "inter-canister call failed: {}", msg),
        }
    }
}

// =============================================================================
// REWARD CLASSES
// =============================================================================

#[derive(CandidType, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewardKind {
    /// Divisible asset; one unit pays `amount_per_unit` of it.
    Fungible,
    /// One-of-a-kind items; one unit pays `amount_per_unit` distinct ids.
    UniqueItem,
    /// Multi-token ids with per-id stack depth and per-id rates.
    SemiFungibleStack,
    /// Multi-token ids that each exist exactly once.
    SemiFungibleUnique,
}

impl RewardKind {
    /// Kind immutability is enforced per family: the two semi-fungible kinds
    /// come from the same token standard and are told apart only by the
    /// first supplied amount.
    pub fn same_family(&self, other: &RewardKind) -> bool {
        use RewardKind::*;
        matches!(
            (self, other),
            (Fungible, Fungible)
                | (UniqueItem, UniqueItem)
                | (
                    SemiFungibleStack | SemiFungibleUnique,
                    SemiFungibleStack | SemiFungibleUnique
                )
        )
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, RewardKind::UniqueItem | RewardKind::SemiFungibleUnique)
    }
}

/// Per-id bookkeeping inside a SemiFungibleStack class.
#[derive(CandidType, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StackEntry {
    pub info: PackedUnitInfo,
    /// Amount of this id held by the canister (allocated or not).
    pub balance: u128,
    /// Amount allocated to accounts but not yet claimed out.
    pub allocated: u128,
}

/// One record per distinct reward-item type, created implicitly on first
/// supply. Weight mutates on every supply/configure/draw; records are never
/// destroyed, only drained to zero weight.
#[derive(CandidType, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RewardClassRecord {
    pub kind: RewardKind,
    /// Aggregate weight; for SemiFungibleStack the rate field is unused
    /// (rates live per id).
    pub info: PackedUnitInfo,
    /// Held amount for Fungible classes; unique kinds count member ids.
    pub balance: u128,
    /// Allocated-but-unclaimed amount (Fungible) or id count (unique kinds).
    pub allocated: u128,
    /// Held, unallocated ids. Unique kinds only. Removal is swap-remove,
    /// so order is arbitrary but stable between mutations.
    pub member_ids: Vec<TokenId>,
    /// SemiFungibleStack only: per-id weight and balances.
    pub per_id: BTreeMap<TokenId, StackEntry>,
}

impl RewardClassRecord {
    pub fn new(kind: RewardKind) -> Self {
        // One item per unit is the natural default for unique kinds; rates
        // for divisible kinds must be configured before weight appears.
        let info = if kind.is_unique() {
            PackedUnitInfo::from_parts(0, 1)
        } else {
            PackedUnitInfo::default()
        };
        Self {
            kind,
            info,
            balance: 0,
            allocated: 0,
            member_ids: Vec::new(),
            per_id: BTreeMap::new(),
        }
    }

    pub fn units(&self) -> Units {
        self.info.units()
    }
}

impl Storable for RewardClassRecord {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect(
            "CRITICAL: Failed to encode RewardClassRecord. \
             This should never happen unless there's a bug in candid serialization.",
        ))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes).expect(
            "CRITICAL: Failed to decode RewardClassRecord from stable storage. \
             This indicates storage corruption or an incompatible canister upgrade.",
        )
    }

    const BOUND: Bound = Bound::Unbounded;
}

// =============================================================================
// SUPPLY ACCOUNT
// =============================================================================

/// Process-wide unit counters. Invariant after every completed operation:
/// `units_requested <= units_supply`.
#[derive(CandidType, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupplyAccount {
    /// Total sellable units across the whole inventory.
    pub units_supply: Units,
    /// Units reserved by in-flight open requests.
    pub units_requested: Units,
    /// Units represented by boxes in circulation (face-value accounting).
    pub units_minted: Units,
}

impl Storable for SupplyAccount {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect("CRITICAL: Failed to encode SupplyAccount."))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes)
            .expect("CRITICAL: Failed to decode SupplyAccount from stable storage.")
    }

    const BOUND: Bound = Bound::Bounded {
        max_size: 128,
        is_fixed_size: false,
    };
}

// =============================================================================
// OPEN REQUESTS
// =============================================================================

/// A burned-boxes claim waiting for its randomness callback. `units_to_get`
/// is zeroed when fulfillment fails, which is what makes the record
/// recoverable.
#[derive(CandidType, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub requester: Principal,
    pub units_to_get: Units,
    pub burned_box_ids: Vec<u64>,
    pub burned_box_amounts: Vec<u64>,
    pub callback_gas: u64,
    pub created_at: u64,
}

impl Storable for OpenRequest {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect("CRITICAL: Failed to encode OpenRequest."))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes)
            .expect("CRITICAL: Failed to decode OpenRequest from stable storage.")
    }

    const BOUND: Bound = Bound::Bounded {
        // 255 box denominations at most, so the arrays stay small.
        max_size: 8192,
        is_fixed_size: false,
    };
}

// =============================================================================
// CLAIM LEDGER
// =============================================================================

/// Pending allocation for one (account, reward class) pair.
#[derive(CandidType, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimEntry {
    /// Fungible classes: scalar amount.
    pub amount: u128,
    /// Unique kinds: owned ids.
    pub ids: Vec<TokenId>,
    /// SemiFungibleStack: per-id amounts.
    pub id_amounts: BTreeMap<TokenId, u128>,
}

impl ClaimEntry {
    pub fn is_empty(&self) -> bool {
        self.amount == 0 && self.ids.is_empty() && self.id_amounts.is_empty()
    }
}

/// Everything one account can currently claim, across all reward classes.
#[derive(CandidType, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimBook {
    pub entries: BTreeMap<Principal, ClaimEntry>,
}

impl Storable for ClaimBook {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect("CRITICAL: Failed to encode ClaimBook."))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes)
            .expect("CRITICAL: Failed to decode ClaimBook from stable storage.")
    }

    const BOUND: Bound = Bound::Unbounded;
}

/// Drained claim handed to the transfer collaborator, also the view type
/// for claim queries and fulfillment summaries.
#[derive(CandidType, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClaimedReward {
    pub class: Principal,
    pub kind: RewardKind,
    pub amount: u128,
    pub ids: Vec<TokenId>,
    pub id_amounts: Vec<(TokenId, u128)>,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(CandidType, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub admin: Principal,
    pub supplier: Principal,
    /// Multi-token canister that mints and burns the unit boxes.
    pub box_token: Principal,
    /// Oracle canister that answers request_randomness and later calls
    /// fulfill_randomness exactly once per request.
    pub randomness_provider: Principal,
    /// Floor for the caller-supplied fulfillment gas budget.
    pub min_callback_gas: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin: Principal::anonymous(),
            supplier: Principal::anonymous(),
            box_token: Principal::anonymous(),
            randomness_provider: Principal::anonymous(),
            min_callback_gas: 0,
        }
    }
}

impl Storable for Config {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect("CRITICAL: Failed to encode Config."))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes).expect("CRITICAL: Failed to decode Config from stable storage.")
    }

    const BOUND: Bound = Bound::Bounded {
        max_size: 512,
        is_fixed_size: false,
    };
}

// =============================================================================
// AUDIT TRAIL
// =============================================================================

#[derive(CandidType, Deserialize, Clone, Debug)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub event: AuditEvent,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
pub enum AuditEvent {
    BoxesIssued { to: Principal, box_id: u64, amount: u64 },
    SupplyAdded { class: Principal, id: TokenId, amount: u128, units_added: Units },
    RateConfigured { class: Principal, id: TokenId, units: Units },
    InventoryWithdrawn { class: Principal, id: TokenId, amount: u128 },
    RequestSubmitted { requester: Principal, request_id: u64, units: Units },
    RequestFulfilled { requester: Principal, request_id: u64, units: Units },
    RequestFailed { requester: Principal, request_id: u64, units: Units, reason: String },
    RewardsClaimed { account: Principal, classes: u64 },
    TransferRollback { account: Principal, class: Principal },
    BoxesRecovered { requester: Principal, request_id: u64 },
    SystemError { error: String },
}

impl Storable for AuditEntry {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(candid::encode_one(self).expect(
            "CRITICAL: Failed to encode AuditEntry. \
             Audit logging is failing - system integrity may be compromised.",
        ))
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        candid::decode_one(&bytes)
            .expect("CRITICAL: Failed to decode AuditEntry from stable storage.")
    }

    const BOUND: Bound = Bound::Bounded {
        max_size: 512,
        is_fixed_size: false,
    };
}

// =============================================================================
// VIEWS
// =============================================================================

#[derive(CandidType, Deserialize, Clone, Debug)]
pub struct RewardClassView {
    pub class: Principal,
    pub kind: RewardKind,
    pub units: Units,
    pub amount_per_unit: u128,
    pub balance: u128,
    pub allocated: u128,
    pub member_count: u64,
    pub per_id: Vec<(TokenId, Units, u128)>,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
pub struct OpenRequestView {
    pub request_id: u64,
    pub units_to_get: Units,
    pub burned_box_ids: Vec<u64>,
    pub burned_box_amounts: Vec<u64>,
    pub created_at: u64,
    /// A failed fulfillment zeroes `units_to_get`; only then can the
    /// burned boxes be recovered.
    pub recoverable: bool,
}

#[derive(CandidType, Deserialize, Clone, Debug)]
pub enum FulfillStatus {
    Fulfilled {
        request_id: u64,
        units: Units,
        credited: Vec<ClaimedReward>,
    },
    /// Resource faults during allocation are converted here rather than
    /// propagated; the request is now recoverable.
    Failed { request_id: u64, reason: String },
}
