//! Liveness endpoint and failure counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct HealthCounters {
    key_failures: AtomicU64,
    throttles: AtomicU64,
    quota_violations: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: &'static str,
    pub key_failures: u64,
    pub throttles: u64,
    pub quota_violations: u64,
}

impl HealthCounters {
    pub fn record_key_failure(&self) {
        self.key_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_violation(&self) {
        self.quota_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            key_failures: self.key_failures.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            quota_violations: self.quota_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = HealthCounters::default();
        counters.record_key_failure();
        counters.record_key_failure();
        counters.record_throttle();
        let report = counters.report();
        assert_eq!(report.key_failures, 2);
        assert_eq!(report.throttles, 1);
        assert_eq!(report.quota_violations, 0);
        assert_eq!(report.status, "ok");
    }
}
