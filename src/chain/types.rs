use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, U256};
use alloy_sol_types::{sol, SolEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::VolumeError;

// ============================================
// CHAINS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Base,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Ethereum, Chain::Polygon, Chain::Base];

    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Polygon => 137,
            Chain::Base => 8453,
        }
    }

    /// Env var holding the chain's native explorer key
    pub fn key_env(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETHERSCAN_API_KEY",
            Chain::Polygon => "POLYGONSCAN_API_KEY",
            Chain::Base => "BASESCAN_API_KEY",
        }
    }

    /// Env var overriding the chain's native explorer endpoint
    pub fn base_url_env(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETHERSCAN_API_BASE_URL",
            Chain::Polygon => "POLYGONSCAN_API_BASE_URL",
            Chain::Base => "BASESCAN_API_BASE_URL",
        }
    }

    pub fn native_explorer_url(&self) -> &'static str {
        match self {
            Chain::Ethereum => "https://api.etherscan.io/api",
            Chain::Polygon => "https://api.polygonscan.com/api",
            Chain::Base => "https://api.basescan.org/api",
        }
    }

    /// Prefix of the chain's RPC env vars (`{PREFIX}_RPC_LIST`, `{PREFIX}_RPC`)
    pub fn rpc_env_prefix(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETHEREUM",
            Chain::Polygon => "POLYGON",
            Chain::Base => "BASE",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Base => "base",
        })
    }
}

impl FromStr for Chain {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Chain::Ethereum),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "base" => Ok(Chain::Base),
            other => Err(VolumeError::Validation(format!("unknown chain: {}", other))),
        }
    }
}

/// Which path produced a window's volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "indexer")]
    Indexer,
    #[serde(rename = "rpc-fallback")]
    RpcFallback,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            DataSource::Indexer => "indexer",
            DataSource::RpcFallback => "rpc-fallback",
        })
    }
}

// ============================================
// ADDRESSES & TOPICS
// ============================================

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// `0x` followed by exactly 40 hex characters
pub fn is_valid_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn parse_address(s: &str) -> Result<Address, VolumeError> {
    if !is_valid_address(s) {
        return Err(VolumeError::Validation(format!("invalid address: {}", s)));
    }
    Address::from_str(s).map_err(|e| VolumeError::Validation(format!("invalid address {}: {}", s, e)))
}

/// keccak256("Transfer(address,address,uint256)") as a 0x-prefixed hex topic
pub fn transfer_topic() -> String {
    format!("0x{}", hex::encode(Transfer::SIGNATURE_HASH))
}

/// Address left-padded to a 32-byte topic
pub fn address_topic(address: &Address) -> String {
    format!("0x{}", hex::encode(address.into_word()))
}

// ============================================
// TRANSFERS & SUMMATION
// ============================================

/// Query shared by the indexer and RPC paths
#[derive(Debug, Clone)]
pub struct TransferQuery {
    pub chain: Chain,
    /// Pool (pair) contract
    pub pair: String,
    /// Stablecoin contract
    pub token: String,
    pub start_block: u64,
    pub end_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub raw_value: U256,
    pub decimals: u8,
}

/// Exact integer totals grouped by decimals, converted once at the end
#[derive(Debug, Clone, Default)]
pub struct TransferTotals {
    by_decimals: BTreeMap<u8, U256>,
    count: usize,
}

impl TransferTotals {
    pub fn add(&mut self, raw_value: U256, decimals: u8) -> Result<(), VolumeError> {
        let slot = self.by_decimals.entry(decimals).or_insert(U256::ZERO);
        *slot = slot
            .checked_add(raw_value)
            .ok_or_else(|| VolumeError::Validation("transfer total overflowed uint256".into()))?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn to_units(&self) -> Result<f64, VolumeError> {
        let mut total = 0.0;
        for (decimals, raw) in &self.by_decimals {
            total += raw_to_units(*raw, *decimals)?;
        }
        Ok(total)
    }
}

/// `raw / 10^decimals` as a float, formatted exactly before the cast
pub fn raw_to_units(raw: U256, decimals: u8) -> Result<f64, VolumeError> {
    let formatted = format_units(raw, decimals)
        .map_err(|e| VolumeError::Validation(format!("cannot scale {} by {}: {}", raw, decimals, e)))?;
    formatted
        .parse::<f64>()
        .map_err(|e| VolumeError::Validation(format!("cannot parse amount {}: {}", formatted, e)))
}
