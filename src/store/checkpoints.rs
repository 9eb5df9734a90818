//! Checkpoint store (`pool_volume_checkpoint.json`)
//!
//! Keyed by lowercased pool address. Entries written by older deployments
//! used `{address}-{chain}` keys and millisecond timestamps; both are read
//! transparently and the legacy key is dropped on the next write.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{lenient_epoch, lenient_u64, read_document, write_document};
use crate::chain::Chain;
use crate::error::VolumeError;

/// Last reconciled point for a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch seconds; the next window starts here
    #[serde(
        rename = "lastTimestamp",
        alias = "lastProcessedTimestamp",
        default,
        deserialize_with = "lenient_epoch"
    )]
    pub last_timestamp: Option<i64>,

    #[serde(
        rename = "lastBlock",
        alias = "lastProcessedBlock",
        default,
        deserialize_with = "lenient_u64"
    )]
    pub last_block: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Checkpoints {
    path: PathBuf,
    entries: IndexMap<String, Checkpoint>,
}

fn legacy_key(address: &str, chain: Chain) -> String {
    format!("{}-{}", address.to_lowercase(), chain)
}

impl Checkpoints {
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        let entries = match read_document(path)? {
            Some(raw) => serde_json::from_value(raw).map_err(|source| VolumeError::StoreFormat {
                path: path.display().to_string(),
                source,
            })?,
            None => IndexMap::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Current key first, then the legacy `{address}-{chain}` key
    pub fn get(&self, address: &str, chain: Chain) -> Option<Checkpoint> {
        self.entries
            .get(&address.to_lowercase())
            .or_else(|| self.entries.get(&legacy_key(address, chain)))
            .copied()
    }

    pub fn contains(&self, address: &str, chain: Chain) -> bool {
        self.get(address, chain).is_some()
    }

    /// Store `checkpoint` for `address`. The timestamp never moves backwards.
    pub fn advance(&mut self, address: &str, chain: Chain, mut checkpoint: Checkpoint) {
        if let (Some(prev), Some(next)) = (
            self.get(address, chain).and_then(|c| c.last_timestamp),
            checkpoint.last_timestamp,
        ) {
            if next < prev {
                warn!(
                    "Refusing to move checkpoint for {} back from {} to {}",
                    address, prev, next
                );
                checkpoint.last_timestamp = Some(prev);
            }
        }
        self.entries.shift_remove(&legacy_key(address, chain));
        self.entries.insert(address.to_lowercase(), checkpoint);
    }

    pub fn save(&self) -> Result<(), VolumeError> {
        write_document(&self.path, &self.entries)
    }
}
