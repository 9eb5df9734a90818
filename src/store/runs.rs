//! Run history (`pool_volume_runs.json`), newest last, capped

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{read_document, write_document};
use crate::chain::DataSource;
use crate::error::VolumeError;

pub const MAX_RUN_HISTORY: usize = 500;

/// One successfully accumulated window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    pub pool: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_block: u64,
    pub end_block: u64,
    #[serde(rename = "totalUsdc", alias = "totalUsd")]
    pub total_usd: f64,
    pub source: DataSource,
    /// ISO-8601 time the entry was written
    pub ts: String,
}

/// Entries are kept as raw JSON so rows written by other versions survive
#[derive(Debug, Default)]
pub struct RunHistory {
    path: PathBuf,
    entries: Vec<Value>,
}

impl RunHistory {
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        let entries = match read_document(path)? {
            Some(Value::Array(items)) => items,
            Some(other) => {
                warn!(
                    "Run history {} is not an array ({}); starting fresh",
                    path.display(),
                    kind(&other)
                );
                Vec::new()
            }
            None => Vec::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    /// Typed view of the rows this version can read
    pub fn runs(&self) -> Vec<RunEntry> {
        self.entries
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Append `entry`, dropping the oldest rows beyond [`MAX_RUN_HISTORY`]
    pub fn append(&mut self, entry: &RunEntry) -> Result<(), VolumeError> {
        let value = serde_json::to_value(entry).map_err(|source| VolumeError::StoreFormat {
            path: self.path.display().to_string(),
            source,
        })?;
        self.entries.push(value);
        if self.entries.len() > MAX_RUN_HISTORY {
            let excess = self.entries.len() - MAX_RUN_HISTORY;
            self.entries.drain(..excess);
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), VolumeError> {
        write_document(&self.path, &self.entries)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
