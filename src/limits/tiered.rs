use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::RateLimitError;
use crate::observability::Observability;

pub const TIER_WINDOW_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Image,
    Video,
    Site,
    Object,
}

impl Resource {
    pub const ALL: [Resource; 4] = [Self::Image, Self::Video, Self::Site, Self::Object];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Site => "site",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| format!("unknown rate limited resource: {raw}"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    /// Substring match on the caller's tier label: anything mentioning
    /// `enterprise` wins over `pro`, everything else is `basic`.
    pub fn resolve(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Basic;
        };
        let raw = raw.to_ascii_lowercase();
        if raw.contains("enterprise") {
            Self::Enterprise
        } else if raw.contains("pro") {
            Self::Pro
        } else {
            Self::Basic
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierLimits {
    pub basic: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl TierLimits {
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Basic => self.basic,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Requests per [`TIER_WINDOW_SECS`] window.
pub fn tier_limits(resource: Resource) -> TierLimits {
    match resource {
        Resource::Image => TierLimits {
            basic: 10,
            pro: 40,
            enterprise: 120,
        },
        Resource::Video => TierLimits {
            basic: 3,
            pro: 12,
            enterprise: 40,
        },
        Resource::Site | Resource::Object => TierLimits {
            basic: 5,
            pro: 20,
            enterprise: 60,
        },
    }
}

pub fn tier_limit(resource: Resource, tier: Tier) -> u32 {
    tier_limits(resource).for_tier(tier)
}

/// Shared atomic counter.
#[async_trait]
pub trait RemoteCounter: Send + Sync {
    /// Increments `key` and returns the new count. The key expires
    /// `window_secs` after its first increment.
    async fn increment(&self, key: &str, window_secs: u64) -> Result<u64, RateLimitError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: u64,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "x-ratelimit-limit";
    pub const REMAINING: &'static str = "x-ratelimit-remaining";
    pub const RESET: &'static str = "x-ratelimit-reset";

    /// Header pairs; the reset value is whole seconds, rounded up.
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, ceil_secs(self.reset_ms).to_string()),
        ]
    }
}

pub(crate) fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieredDecision {
    Allowed {
        headers: RateLimitHeaders,
    },
    Denied {
        headers: RateLimitHeaders,
        retry_after_ms: u64,
    },
    /// The counter is disabled or unreachable; the request proceeds unmetered.
    FailOpen,
}

impl TieredDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Self::Allowed { headers } | Self::Denied { headers, .. } => Some(headers),
            Self::FailOpen => None,
        }
    }
}

#[derive(Clone)]
pub struct TieredRateLimiter {
    counter: Option<Arc<dyn RemoteCounter>>,
    prefix: String,
    observability: Arc<Observability>,
}

impl fmt::Debug for TieredRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredRateLimiter")
            .field("enabled", &self.counter.is_some())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl TieredRateLimiter {
    pub fn new(
        counter: Option<Arc<dyn RemoteCounter>>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            counter,
            prefix: "ratelimit".to_string(),
            observability,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.counter.is_some()
    }

    fn key(&self, resource: Resource, tier: Tier, caller_key: &str) -> String {
        format!(
            "{}:{}:{}:{caller_key}",
            self.prefix,
            resource.as_str(),
            tier.as_str()
        )
    }

    pub async fn check(
        &self,
        resource: Resource,
        tier_raw: Option<&str>,
        caller_key: &str,
    ) -> TieredDecision {
        let Some(counter) = self.counter.as_ref() else {
            return TieredDecision::FailOpen;
        };

        let tier = Tier::resolve(tier_raw);
        let limit = tier_limit(resource, tier);
        let key = self.key(resource, tier, caller_key);

        let count = match counter.increment(&key, TIER_WINDOW_SECS).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    resource = resource.as_str(),
                    "rate limit counter unavailable; failing open"
                );
                self.observability.record_limiter_fail_open();
                return TieredDecision::FailOpen;
            }
        };

        // EXPIRE NX does not report the TTL, so the full window is the upper bound.
        let window_ms = TIER_WINDOW_SECS * 1000;
        let used = u32::try_from(count).unwrap_or(u32::MAX);
        let headers = RateLimitHeaders {
            limit,
            remaining: limit.saturating_sub(used),
            reset_ms: window_ms,
        };

        if used > limit {
            self.observability.record_rate_limited();
            tracing::debug!(
                resource = resource.as_str(),
                tier = tier.as_str(),
                count,
                limit,
                "tiered rate limit exceeded"
            );
            return TieredDecision::Denied {
                headers,
                retry_after_ms: window_ms,
            };
        }
        TieredDecision::Allowed { headers }
    }
}
