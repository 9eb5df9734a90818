//! Alert/status record
//!
//! The alerting hook reads `pool_volume_alert.json` after each run. The file
//! is reset at the start of a run, rewritten every time a reason is added,
//! and refreshed with final counters at the end of a clean run.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use super::write_document;
use crate::metrics::RunMetrics;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    #[serde(default)]
    pub alert: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default, alias = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub api_call_count: u64,
    #[serde(default)]
    pub retry_count: u64,
}

pub struct AlertLog {
    path: PathBuf,
    metrics: Arc<RunMetrics>,
    state: Mutex<AlertRecord>,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            path: path.into(),
            metrics,
            state: Mutex::new(AlertRecord::default()),
        }
    }

    /// Start-of-run state: no alert, no reasons, zero counters
    pub fn reset(&self) {
        let record = AlertRecord {
            timestamp: now_iso(),
            ..AlertRecord::default()
        };
        let mut state = self.lock();
        *state = record;
        self.persist(&state);
    }

    /// Record an informational reason without flipping the alert flag
    pub fn note(&self, reason: impl Into<String>) {
        self.push(reason.into(), false);
    }

    /// Record a reason and flag the run as failed
    pub fn raise(&self, reason: impl Into<String>) {
        self.push(reason.into(), true);
    }

    pub fn current(&self) -> AlertRecord {
        self.lock().clone()
    }

    /// End-of-run refresh. A run that raised an alert keeps the record as it
    /// was last written; a clean run gets fresh counters and timestamp.
    pub fn finalize(&self) -> AlertRecord {
        let mut state = self.lock();
        if !state.alert {
            self.stamp(&mut state);
            self.persist(&state);
        }
        state.clone()
    }

    fn push(&self, reason: String, alert: bool) {
        let mut state = self.lock();
        if !state.reasons.contains(&reason) {
            state.reasons.push(reason);
        }
        state.alert |= alert;
        self.stamp(&mut state);
        self.persist(&state);
    }

    fn stamp(&self, record: &mut AlertRecord) {
        let snapshot = self.metrics.snapshot();
        record.api_call_count = snapshot.api_calls;
        record.retry_count = snapshot.retries;
        record.timestamp = now_iso();
    }

    fn persist(&self, record: &AlertRecord) {
        if let Err(e) = write_document(&self.path, record) {
            warn!("Failed to write alert file {}: {}", self.path.display(), e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertRecord> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
