//! Pool store (`pool_volume.json`)
//!
//! Three document shapes exist in the wild and all load identically:
//! - wrapped: `{ "pools": { "<addr>": {..} }, "lastUpdated": .. }`
//! - list: `[ { "address": "<addr>", .. }, .. ]`
//! - flat: `{ "<addr>": {..}, .. }`
//!
//! Keys are lowercased on load. The document is written back in the shape it
//! was read in (flat for a fresh file). Fields this job doesn't know about are
//! carried through untouched.

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use super::{epoch_seconds, lenient_f64, lenient_u8, read_document, write_document};
use crate::error::VolumeError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,

    /// Stablecoin contract; the configured default applies when absent
    #[serde(
        default,
        alias = "stableTokenAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub usdc: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_u8",
        skip_serializing_if = "Option::is_none"
    )]
    pub usdc_decimals: Option<u8>,

    #[serde(
        default,
        deserialize_with = "lenient_u8",
        skip_serializing_if = "Option::is_none"
    )]
    pub decimals: Option<u8>,

    /// Cumulative volume in stablecoin units
    #[serde(
        default,
        alias = "totalUsd",
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_usd: Option<f64>,

    /// Seconds, milliseconds or an ISO-8601 string
    #[serde(
        default,
        rename = "lastUpdated",
        alias = "lastUpdatedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PoolRecord {
    pub fn last_updated_secs(&self) -> Option<i64> {
        self.last_updated.as_ref().and_then(epoch_seconds)
    }

    /// `usdc_decimals`, then `decimals`
    pub fn stable_decimals(&self) -> Option<u8> {
        self.usdc_decimals.or(self.decimals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DocumentShape {
    #[default]
    Flat,
    Wrapped,
    List,
}

#[derive(Debug, Default)]
pub struct PoolBook {
    path: PathBuf,
    shape: DocumentShape,
    pools: IndexMap<String, PoolRecord>,
}

impl PoolBook {
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        let Some(raw) = read_document(path)? else {
            return Ok(Self {
                path: path.to_path_buf(),
                ..Self::default()
            });
        };

        let shape = match &raw {
            Value::Array(_) => DocumentShape::List,
            Value::Object(map) if map.get("pools").is_some_and(Value::is_object) => {
                DocumentShape::Wrapped
            }
            _ => DocumentShape::Flat,
        };
        let pools = normalize_pools(raw).map_err(|source| VolumeError::StoreFormat {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            shape,
            pools,
        })
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Pool keys in document order
    pub fn addresses(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<&PoolRecord> {
        self.pools.get(&address.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PoolRecord)> {
        self.pools.iter()
    }

    /// Mutable record for `address`, created empty if needed
    pub fn entry(&mut self, address: &str) -> &mut PoolRecord {
        let key = address.to_lowercase();
        self.pools.entry(key.clone()).or_insert_with(|| PoolRecord {
            address: Some(key),
            ..PoolRecord::default()
        })
    }

    pub fn save(&self) -> Result<(), VolumeError> {
        let document = match self.shape {
            DocumentShape::Flat => serde_json::to_value(&self.pools),
            DocumentShape::Wrapped => serde_json::to_value(&self.pools).map(|pools| {
                json!({
                    "pools": pools,
                    "lastUpdated": Utc::now().timestamp_millis(),
                })
            }),
            DocumentShape::List => serde_json::to_value(self.list_entries()),
        }
        .map_err(|source| VolumeError::StoreFormat {
            path: self.path.display().to_string(),
            source,
        })?;
        write_document(&self.path, &document)
    }

    fn list_entries(&self) -> Vec<PoolRecord> {
        self.pools
            .iter()
            .map(|(key, record)| {
                let mut record = record.clone();
                record.address.get_or_insert_with(|| key.clone());
                record
            })
            .collect()
    }
}

/// Collapse any of the three document shapes into an address-keyed map
pub fn normalize_pools(raw: Value) -> Result<IndexMap<String, PoolRecord>, serde_json::Error> {
    let entries: Vec<(String, Value)> = match raw {
        Value::Object(mut map) if map.get("pools").is_some_and(Value::is_object) => {
            match map.remove("pools") {
                Some(Value::Object(pools)) => pools.into_iter().collect(),
                _ => Vec::new(),
            }
        }
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| {
                let address = item.get("address")?.as_str()?.to_string();
                Some((address, item))
            })
            .collect(),
        Value::Object(map) => map.into_iter().filter(|(_, v)| v.is_object()).collect(),
        _ => Vec::new(),
    };

    let mut pools = IndexMap::with_capacity(entries.len());
    for (address, value) in entries {
        let record: PoolRecord = serde_json::from_value(value)?;
        pools.insert(address.to_lowercase(), record);
    }
    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const POOL: &str = "0xAbC0000000000000000000000000000000000001";

    fn shapes() -> Vec<Value> {
        let entry = json!({ "chain": "polygon", "total_usd": 12.5, "lastUpdated": 1_700_000_000 });
        let mut listed = entry.clone();
        listed["address"] = json!(POOL);
        vec![
            json!({ "pools": { POOL: entry.clone() }, "lastUpdated": 1 }),
            json!([listed]),
            json!({ POOL: entry, "lastUpdated": 1_700_000_000 }),
        ]
    }

    #[test]
    fn test_three_shapes_load_identically() {
        let key = POOL.to_lowercase();
        for raw in shapes() {
            let pools = normalize_pools(raw).unwrap();
            assert_eq!(pools.len(), 1, "flat scalars must be ignored");
            let record = &pools[&key];
            assert_eq!(record.chain.as_deref(), Some("polygon"));
            assert_eq!(record.total_usd, Some(12.5));
            assert_eq!(record.last_updated_secs(), Some(1_700_000_000));
        }
    }

    #[test]
    fn test_lenient_fields() {
        let record: PoolRecord = serde_json::from_value(json!({
            "totalUsd": "42.25",
            "lastUpdatedAt": "2023-11-14T22:13:20Z",
            "stableTokenAddress": "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174",
            "decimals": "6",
        }))
        .unwrap();
        assert_eq!(record.total_usd, Some(42.25));
        assert_eq!(record.last_updated_secs(), Some(1_700_000_000));
        assert_eq!(record.stable_decimals(), Some(6));
        assert!(record.usdc.is_some());

        let empty: PoolRecord = serde_json::from_value(json!({ "total_usd": null })).unwrap();
        assert_eq!(empty.total_usd, None);
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_volume.json");
        fs::write(
            &path,
            json!({ POOL: { "chain": "base", "label": "WETH/USDC", "fees": { "bps": 5 } } })
                .to_string(),
        )
        .unwrap();

        let mut book = PoolBook::load(&path).unwrap();
        book.entry(POOL).total_usd = Some(1.0);
        book.save().unwrap();

        let back: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let record = &back[POOL.to_lowercase()];
        assert_eq!(record["label"], "WETH/USDC");
        assert_eq!(record["fees"]["bps"], 5);
        assert_eq!(record["total_usd"], 1.0);
    }

    #[test]
    fn test_wrapped_shape_is_written_back_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool_volume.json");
        fs::write(&path, shapes()[0].to_string()).unwrap();

        let book = PoolBook::load(&path).unwrap();
        book.save().unwrap();

        let back: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(back["pools"].is_object());
        assert!(back["lastUpdated"].is_number());
    }

    #[test]
    fn test_missing_file_is_empty_book() {
        let dir = tempfile::tempdir().unwrap();
        let book = PoolBook::load(&dir.path().join("pool_volume.json")).unwrap();
        assert!(book.is_empty());
    }
}
