//! Credit ledger: plan registry, cost table, balances and the usage audit trail.

pub mod costs;
pub mod ledger;
pub mod plans;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod usage;

use thiserror::Error;

pub use costs::{ChargeBreakdown, ChargeLine, CreditAction, CreditCharge, total_cost};
pub use ledger::{
    ChargeOutcome, ConsumeOutcome, ConsumeRequest, CreditLedger, CreditProfile, PROFILES,
};
pub use plans::{PLANS, PlanConfig, PlanKey, limit_for, resolve_plan_key};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
pub use store::{Document, DocumentStore, MemoryStore, StoreError, TxUpdate};
pub use usage::{USAGE_RECORDS, UsageRecord, UsageRecorder, UsageStatus};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: required={required} available={available}")]
    InsufficientCredits { required: u64, available: u64 },
    #[error("insufficient balance: required={required} available={available}")]
    InsufficientBalance { required: u64, available: u64 },
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable {
            message: err.to_string(),
        }
    }
}
