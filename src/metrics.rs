//! Run-scoped request counters
//!
//! One `RunMetrics` is created per orchestrator run and shared by reference
//! with the HTTP client and the retry policy. The orchestrator reads it once
//! when finalizing the alert record.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RunMetrics {
    api_calls: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub api_calls: u64,
    pub retries: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per outbound HTTP attempt
    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per retry (not for the first attempt)
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
