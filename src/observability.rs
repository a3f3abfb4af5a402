use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub charges: u64,
    pub insufficient_credits: u64,
    pub consumes: u64,
    pub consumes_skipped: u64,
    pub audit_failures: u64,
    pub rate_limited: u64,
    pub limiter_fail_open: u64,
    pub loop_transitions: u64,
}

/// Shared counters. Every handle that needs to report holds an `Arc` to the
/// same instance.
#[derive(Debug, Default)]
pub struct Observability {
    charges: AtomicU64,
    insufficient_credits: AtomicU64,
    consumes: AtomicU64,
    consumes_skipped: AtomicU64,
    audit_failures: AtomicU64,
    rate_limited: AtomicU64,
    limiter_fail_open: AtomicU64,
    loop_transitions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_charge(&self) {
        bump(&self.charges);
    }

    pub fn record_insufficient_credits(&self) {
        bump(&self.insufficient_credits);
    }

    pub fn record_consume(&self) {
        bump(&self.consumes);
    }

    pub fn record_consume_skipped(&self) {
        bump(&self.consumes_skipped);
    }

    pub fn record_audit_failure(&self) {
        bump(&self.audit_failures);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_limiter_fail_open(&self) {
        bump(&self.limiter_fail_open);
    }

    pub fn record_loop_transition(&self) {
        bump(&self.loop_transitions);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            charges: self.charges.load(Ordering::Relaxed),
            insufficient_credits: self.insufficient_credits.load(Ordering::Relaxed),
            consumes: self.consumes.load(Ordering::Relaxed),
            consumes_skipped: self.consumes_skipped.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            limiter_fail_open: self.limiter_fail_open.load(Ordering::Relaxed),
            loop_transitions: self.loop_transitions.load(Ordering::Relaxed),
        }
    }
}
