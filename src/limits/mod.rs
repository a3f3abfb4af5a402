//! Request rate limiting: a process-local fixed window and a tiered limiter
//! backed by a shared remote counter.

pub mod fixed_window;
#[cfg(feature = "store-redis")]
pub mod redis_counter;
pub mod rest_counter;
pub mod tiered;

use thiserror::Error;

pub use fixed_window::{
    CounterStore, Decision, FixedWindowLimiter, MemoryCounterStore, WindowState,
};
#[cfg(feature = "store-redis")]
pub use redis_counter::RedisCounter;
pub use rest_counter::RestCounter;
pub use tiered::{
    RateLimitHeaders, RemoteCounter, Resource, TIER_WINDOW_SECS, Tier, TierLimits,
    TieredDecision, TieredRateLimiter, tier_limit, tier_limits,
};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("counter backend unavailable: {message}")]
    CounterBackendUnavailable { message: String },
}

impl RateLimitError {
    pub(crate) fn backend(message: impl std::fmt::Display) -> Self {
        Self::CounterBackendUnavailable {
            message: message.to_string(),
        }
    }
}
