//! Fixed-window request counter.
//!
//! State lives in whatever [`CounterStore`] the limiter is built with. With the
//! default [`MemoryCounterStore`] the bound holds per process only: replicas
//! each keep their own windows, so a deployment with N instances admits up to
//! N times the limit. Use the tiered limiter with a shared counter when the
//! bound has to hold across instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    pub expires_at_ms: u64,
}

impl WindowState {
    pub fn is_open(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Storage behind [`FixedWindowLimiter`].
pub trait CounterStore: Send + Sync {
    /// Current window for `key`, or `None` when absent or expired.
    fn get(&self, key: &str, now_ms: u64) -> Option<WindowState>;

    fn set(&self, key: &str, state: WindowState);

    /// Adds one to the open window for `key`. When there is no open window a
    /// new one starts at `now_ms` with a count of 1. Atomic per key.
    fn increment(&self, key: &str, window_ms: u64, now_ms: u64) -> WindowState;
}

#[derive(Debug, Default)]
struct MemoryCounters {
    windows: HashMap<String, WindowState>,
    next_sweep_ms: u64,
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryCounters>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryCounters> {
        // Counters are plain integers; a panic mid-update cannot leave them torn.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &str, now_ms: u64) -> Option<WindowState> {
        self.lock()
            .windows
            .get(key)
            .copied()
            .filter(|state| state.is_open(now_ms))
    }

    fn set(&self, key: &str, state: WindowState) {
        self.lock().windows.insert(key.to_string(), state);
    }

    fn increment(&self, key: &str, window_ms: u64, now_ms: u64) -> WindowState {
        let mut counters = self.lock();

        if now_ms >= counters.next_sweep_ms {
            counters.windows.retain(|_, state| state.is_open(now_ms));
            counters.next_sweep_ms = now_ms.saturating_add(window_ms.max(1));
        }

        let state = counters
            .windows
            .entry(key.to_string())
            .or_insert(WindowState {
                count: 0,
                expires_at_ms: 0,
            });
        if !state.is_open(now_ms) {
            state.count = 0;
            state.expires_at_ms = now_ms.saturating_add(window_ms);
        }
        state.count = state.count.saturating_add(1);
        *state
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after_ms: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Allowed { remaining } => {
                serde_json::json!({ "allowed": true, "remaining": remaining })
            }
            Self::Denied { retry_after_ms } => {
                serde_json::json!({ "allowed": false, "retryAfterMs": retry_after_ms })
            }
        }
    }
}

#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter").finish_non_exhaustive()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()), Arc::new(SystemClock))
    }
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Counts one request for `identifier`. A limit of zero denies everything.
    pub fn check(&self, identifier: &str, limit: u32, window_ms: u64) -> Decision {
        let now = self.clock.now_epoch_millis();
        let state = self.store.increment(identifier, window_ms, now);
        if state.count > limit {
            tracing::debug!(identifier, limit, "fixed window exhausted");
            return Decision::Denied {
                retry_after_ms: state.expires_at_ms.saturating_sub(now),
            };
        }
        Decision::Allowed {
            remaining: limit - state.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW_MS: u64 = 60_000;

    fn limiter() -> (FixedWindowLimiter, Arc<ManualClock>, Arc<MemoryCounterStore>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryCounterStore::new());
        (
            FixedWindowLimiter::new(store.clone(), clock.clone()),
            clock,
            store,
        )
    }

    #[test]
    fn ten_calls_count_down_then_eleventh_is_denied() {
        let (limiter, clock, _) = limiter();

        let mut remaining = Vec::new();
        for _ in 0..10 {
            match limiter.check("user-1", 10, WINDOW_MS) {
                Decision::Allowed { remaining: left } => remaining.push(left),
                Decision::Denied { .. } => panic!("denied inside limit"),
            }
            clock.advance(100);
        }
        assert_eq!(remaining, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);

        match limiter.check("user-1", 10, WINDOW_MS) {
            Decision::Denied { retry_after_ms } => {
                assert!(retry_after_ms > 0);
                assert_eq!(retry_after_ms, WINDOW_MS - 1_000);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        clock.advance(WINDOW_MS);
        assert_eq!(
            limiter.check("user-1", 10, WINDOW_MS),
            Decision::Allowed { remaining: 9 }
        );
    }

    #[test]
    fn identifiers_are_counted_separately() {
        let (limiter, _, _) = limiter();
        assert!(limiter.check("a", 1, WINDOW_MS).is_allowed());
        assert!(!limiter.check("a", 1, WINDOW_MS).is_allowed());
        assert!(limiter.check("b", 1, WINDOW_MS).is_allowed());
    }

    #[test]
    fn zero_limit_denies_first_request() {
        let (limiter, _, _) = limiter();
        assert!(!limiter.check("a", 0, WINDOW_MS).is_allowed());
    }

    #[test]
    fn expired_windows_are_swept() {
        let (limiter, clock, store) = limiter();
        limiter.check("a", 5, WINDOW_MS);
        limiter.check("b", 5, WINDOW_MS);
        assert_eq!(store.len(), 2);

        clock.advance(WINDOW_MS + 1);
        limiter.check("c", 5, WINDOW_MS);
        assert_eq!(store.len(), 1);
        assert!(store.get("a", clock.now_epoch_millis()).is_none());
    }

    #[test]
    fn set_seeds_an_open_window() {
        let (limiter, clock, store) = limiter();
        store.set(
            "seeded",
            WindowState {
                count: 3,
                expires_at_ms: clock.now_epoch_millis() + 500,
            },
        );
        assert_eq!(
            limiter.check("seeded", 4, WINDOW_MS),
            Decision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check("seeded", 4, WINDOW_MS),
            Decision::Denied {
                retry_after_ms: 500
            }
        );
    }
}
