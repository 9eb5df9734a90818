//! Persistence Layer
//!
//! Four flat JSON documents scoped to this job, all under `DATA_DIR`:
//! - `pool_volume.json`: per-pool running totals (shared with other jobs)
//! - `pool_volume_checkpoint.json`: per-pool reconciliation checkpoint
//! - `pool_volume_runs.json`: bounded run history
//! - `pool_volume_alert.json`: alert/status record for the alerting hook
//!
//! Each document is read fully at start and rewritten fully after every pool.
//! Single writer assumed; the scheduler serializes runs.

mod alerts;
mod checkpoints;
mod pools;
mod runs;

pub use alerts::{AlertLog, AlertRecord};
pub use checkpoints::{Checkpoint, Checkpoints};
pub use pools::{normalize_pools, PoolBook, PoolRecord};
pub use runs::{RunEntry, RunHistory, MAX_RUN_HISTORY};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::VolumeError;

// ============================================
// FILE LAYOUT
// ============================================

#[derive(Debug, Clone)]
pub struct DataFiles {
    pub pools: PathBuf,
    pub checkpoints: PathBuf,
    pub runs: PathBuf,
    pub alert: PathBuf,
}

impl DataFiles {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            pools: data_dir.join("pool_volume.json"),
            checkpoints: data_dir.join("pool_volume_checkpoint.json"),
            runs: data_dir.join("pool_volume_runs.json"),
            alert: data_dir.join("pool_volume_alert.json"),
        }
    }
}

/// The three stores the accumulator mutates for each pool
#[derive(Debug)]
pub struct Ledger {
    pub pools: PoolBook,
    pub checkpoints: Checkpoints,
    pub runs: RunHistory,
}

impl Ledger {
    pub fn load(files: &DataFiles) -> Result<Self, VolumeError> {
        Ok(Self {
            pools: PoolBook::load(&files.pools)?,
            checkpoints: Checkpoints::load(&files.checkpoints)?,
            runs: RunHistory::load(&files.runs)?,
        })
    }
}

// ============================================
// DOCUMENT I/O
// ============================================

/// Read a JSON document. A missing or blank file is `None`; anything
/// unreadable or unparseable is an error.
pub(crate) fn read_document(path: &Path) -> Result<Option<Value>, VolumeError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(VolumeError::Store {
                path: path.display().to_string(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| VolumeError::StoreFormat {
            path: path.display().to_string(),
            source,
        })
}

/// Pretty-print `value` to a sibling temp file, then rename over `path`
pub(crate) fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), VolumeError> {
    let io_error = |source| VolumeError::Store {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
    }

    let content = serde_json::to_string_pretty(value).map_err(|source| VolumeError::StoreFormat {
        path: path.display().to_string(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)
}

// ============================================
// LENIENT FIELD PARSING
// ============================================

/// Epoch seconds from a number, numeric string or RFC 3339 string.
/// Millisecond values (> 10^12) are scaled down; non-positive values are `None`.
pub fn epoch_seconds(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(n) => n,
                Err(_) => return chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|d| d.timestamp())
                    .filter(|ts| *ts > 0),
            }
        }
        _ => return None,
    };
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
    Some(secs.floor() as i64)
}

pub(crate) fn lenient_epoch<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(epoch_seconds))
}

pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|f: &f64| f.is_finite()))
}

pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

pub(crate) fn lenient_u8<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_u64(deserializer)?.and_then(|n| u8::try_from(n).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_epoch_seconds_variants() {
        assert_eq!(epoch_seconds(&json!(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(epoch_seconds(&json!(1_700_000_000_123u64)), Some(1_700_000_000));
        assert_eq!(epoch_seconds(&json!("1700000000")), Some(1_700_000_000));
        assert_eq!(
            epoch_seconds(&json!("2023-11-14T22:13:20.000Z")),
            Some(1_700_000_000)
        );
        assert_eq!(epoch_seconds(&json!(0)), None);
        assert_eq!(epoch_seconds(&json!("yesterday")), None);
        assert_eq!(epoch_seconds(&Value::Null), None);
    }

    #[test]
    fn test_missing_and_blank_documents_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(read_document(&path).unwrap().is_none());

        fs::write(&path, "  \n").unwrap();
        assert!(read_document(&path).unwrap().is_none());

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            read_document(&path),
            Err(VolumeError::StoreFormat { .. })
        ));
    }

    #[test]
    fn test_write_document_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data/doc.json");
        write_document(&path, &json!({ "a": 1 })).unwrap();

        let back = read_document(&path).unwrap().unwrap();
        assert_eq!(back, json!({ "a": 1 }));
        assert!(!dir.path().join("nested/data/doc.json.tmp").exists());
    }
}
