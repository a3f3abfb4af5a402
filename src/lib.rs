//! Credit ledger and request rate limiting for the Merse generation APIs.

pub mod clock;
pub mod config;
pub mod credits;
mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod limits;
pub mod observability;
pub mod orion;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Env, LedgerConfig};
pub use credits::{
    ChargeOutcome, ConsumeOutcome, ConsumeRequest, CreditAction, CreditCharge, CreditLedger,
    CreditProfile, DocumentStore, LedgerError, MemoryStore, PlanKey, StoreError, UsageRecorder,
    UsageStatus, limit_for, resolve_plan_key,
};
pub use error::{MerseError, Result};
pub use limits::{
    Decision, FixedWindowLimiter, RateLimitError, TieredDecision, TieredRateLimiter,
};
pub use observability::{Observability, ObservabilitySnapshot};
pub use orion::{LoopAction, LoopOutcome, OrionError, OrionLoop, ProjectStatus};
