//! Configuration for the Pool Volume job
//!
//! Loaded from environment variables (and `.env`) or from a TOML file with
//! the same field names. Per-chain explorer and RPC settings live in the
//! `[ethereum]`, `[polygon]` and `[base]` tables.

use eyre::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chain::{is_valid_address, Chain};
use crate::net::RetryPolicy;

/// Public Base endpoint, always tried last
pub const PUBLIC_BASE_RPC: &str = "https://mainnet.base.org";

/// Polygon PoS bridged USDC
pub const DEFAULT_STABLE_TOKEN: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

// ============================================
// PER-CHAIN ENDPOINTS
// ============================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainEndpoints {
    /// Chain-specific explorer key (`POLYGONSCAN_API_KEY`, `BASESCAN_API_KEY`)
    pub explorer_api_key: Option<String>,

    /// Override for the native explorer endpoint
    pub explorer_base_url: Option<String>,

    /// JSON-RPC endpoints in failover order
    pub rpc_urls: Vec<String>,
}

// ============================================
// MAIN CONFIGURATION
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========== Storage ==========
    /// Directory holding the four JSON documents
    pub data_dir: PathBuf,

    // ========== Pools ==========
    /// Chain assumed for pool records without one
    pub default_chain: Chain,

    /// Stablecoin measured when a pool record names none
    pub default_stable_token: String,

    /// Decimals assumed when neither the indexer nor the pool record says
    pub stable_decimals: u8,

    /// Look-back for a pool with no checkpoint and no `lastUpdated`
    pub window_seconds: i64,

    /// Upper bound of the per-pool start delay
    pub max_jitter_secs: u64,

    // ========== Retry ==========
    pub api_max_attempts: u32,
    pub api_base_delay_ms: u64,
    pub api_max_delay_ms: u64,

    /// Attempt budget for transient errors reported inside a 200 body
    pub indexer_body_max_attempts: u32,

    pub http_timeout_secs: u64,

    // ========== Indexer ==========
    pub etherscan_api_key: Option<String>,
    pub etherscan_v2_url: String,
    pub indexer_page_size: u32,
    pub block_by_time_max_skew_steps: u32,
    pub block_by_time_skew_seconds: i64,

    // ========== RPC ==========
    pub rpc_log_block_chunk: u64,
    pub rpc_fallback_enabled: bool,

    // ========== Chains ==========
    pub ethereum: ChainEndpoints,
    pub polygon: ChainEndpoints,
    pub base: ChainEndpoints,
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    /// Build from an arbitrary key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let chain_endpoints = |chain: Chain| {
            let prefix = chain.rpc_env_prefix();
            let mut rpc_urls = get(&format!("{}_RPC_LIST", prefix))
                .map(|v| parse_rpc_list(&v))
                .unwrap_or_default();
            if let Some(url) = get(&format!("{}_RPC", prefix)) {
                rpc_urls.push(url);
            }
            if chain == Chain::Ethereum {
                if let Some(url) = get("ETH_RPC") {
                    rpc_urls.push(url);
                }
            }
            ChainEndpoints {
                // the Etherscan key is the global key, not a chain key
                explorer_api_key: match chain {
                    Chain::Ethereum => None,
                    _ => get(chain.key_env()),
                },
                explorer_base_url: get(chain.base_url_env()),
                rpc_urls,
            }
        };

        Self {
            // Storage
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),

            // Pools
            default_chain: parsed(get("DEFAULT_CHAIN")).unwrap_or(defaults.default_chain),
            default_stable_token: get("POLYGON_USDC").unwrap_or(defaults.default_stable_token),
            stable_decimals: parsed(get("USDC_DECIMALS")).unwrap_or(defaults.stable_decimals),
            window_seconds: parsed(get("WINDOW_SECONDS")).unwrap_or(defaults.window_seconds),
            max_jitter_secs: parsed(get("MAX_JITTER")).unwrap_or(defaults.max_jitter_secs),

            // Retry
            api_max_attempts: parsed(get("API_MAX_ATTEMPTS")).unwrap_or(defaults.api_max_attempts),
            api_base_delay_ms: parsed(get("API_BASE_DELAY_MS")).unwrap_or(defaults.api_base_delay_ms),
            api_max_delay_ms: parsed(get("API_MAX_DELAY_MS")).unwrap_or(defaults.api_max_delay_ms),
            indexer_body_max_attempts: parsed(get("INDEXER_BODY_MAX_ATTEMPTS"))
                .unwrap_or(defaults.indexer_body_max_attempts),
            http_timeout_secs: parsed(get("HTTP_TIMEOUT_SECS")).unwrap_or(defaults.http_timeout_secs),

            // Indexer
            etherscan_api_key: get("ETHERSCAN_API_KEY"),
            etherscan_v2_url: get("ETHERSCAN_V2_URL").unwrap_or(defaults.etherscan_v2_url),
            indexer_page_size: parsed(get("INDEXER_PAGE_SIZE")).unwrap_or(defaults.indexer_page_size),
            block_by_time_max_skew_steps: parsed(get("BLOCK_BY_TIME_MAX_SKEW_STEPS"))
                .unwrap_or(defaults.block_by_time_max_skew_steps),
            block_by_time_skew_seconds: parsed::<i64>(get("BLOCK_BY_TIME_SKEW_SECONDS"))
                .unwrap_or(defaults.block_by_time_skew_seconds)
                .max(1),

            // RPC
            rpc_log_block_chunk: parsed::<u64>(get("RPC_LOG_BLOCK_CHUNK"))
                .unwrap_or(defaults.rpc_log_block_chunk)
                .max(10),
            rpc_fallback_enabled: get("RPC_FALLBACK_ENABLED")
                .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
                .unwrap_or(defaults.rpc_fallback_enabled),

            // Chains
            ethereum: chain_endpoints(Chain::Ethereum),
            polygon: chain_endpoints(Chain::Polygon),
            base: chain_endpoints(Chain::Base),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn endpoints(&self, chain: Chain) -> &ChainEndpoints {
        match chain {
            Chain::Ethereum => &self.ethereum,
            Chain::Polygon => &self.polygon,
            Chain::Base => &self.base,
        }
    }

    /// Chain-specific explorer key; for Ethereum that is the Etherscan key
    pub fn chain_api_key(&self, chain: Chain) -> Option<&str> {
        match chain {
            Chain::Ethereum => self.etherscan_api_key.as_deref(),
            _ => self.endpoints(chain).explorer_api_key.as_deref(),
        }
    }

    /// Deduplicated RPC URLs in failover order
    pub fn rpc_urls(&self, chain: Chain) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in &self.endpoints(chain).rpc_urls {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        if chain == Chain::Base && !urls.iter().any(|u| u == PUBLIC_BASE_RPC) {
            urls.push(PUBLIC_BASE_RPC.to_string());
        }
        urls
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.api_max_attempts,
            Duration::from_millis(self.api_base_delay_ms),
            Duration::from_millis(self.api_max_delay_ms),
        )
    }

    /// Same delays as [`Config::retry_policy`], indexer body attempt budget
    pub fn body_retry_policy(&self) -> RetryPolicy {
        self.retry_policy()
            .with_max_attempts(self.indexer_body_max_attempts)
    }

    /// Validate configuration before a run
    pub fn validate(&self) -> Result<()> {
        let any_key = self.etherscan_api_key.is_some()
            || Chain::ALL
                .iter()
                .any(|c| self.endpoints(*c).explorer_api_key.is_some());
        if !any_key {
            return Err(eyre::eyre!(
                "No explorer API key configured - set ETHERSCAN_API_KEY (or POLYGONSCAN_API_KEY / BASESCAN_API_KEY)"
            ));
        }

        if self.api_max_attempts < 1 {
            return Err(eyre::eyre!("API_MAX_ATTEMPTS must be at least 1"));
        }
        if self.indexer_body_max_attempts < 1 {
            return Err(eyre::eyre!("INDEXER_BODY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.api_base_delay_ms > self.api_max_delay_ms {
            return Err(eyre::eyre!(
                "API_BASE_DELAY_MS ({}) must not exceed API_MAX_DELAY_MS ({})",
                self.api_base_delay_ms,
                self.api_max_delay_ms
            ));
        }
        if self.window_seconds <= 0 {
            return Err(eyre::eyre!("WINDOW_SECONDS must be positive"));
        }
        if self.indexer_page_size == 0 {
            return Err(eyre::eyre!("INDEXER_PAGE_SIZE must be positive"));
        }
        if !is_valid_address(&self.default_stable_token) {
            return Err(eyre::eyre!(
                "POLYGON_USDC is not a valid address: {}",
                self.default_stable_token
            ));
        }

        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let set = |v: bool| if v { "✓ Configured" } else { "✗ Not Set" };
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║              POOL VOLUME - CONFIGURATION                   ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ Data Dir:          {:<40} ║", self.data_dir.display());
        println!("║ Default Chain:     {:<40} ║", self.default_chain);
        println!("║ Window:            {:<38}s ║", self.window_seconds);
        println!("║ Max Jitter:        {:<38}s ║", self.max_jitter_secs);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RETRY                                                      ║");
        println!("║ • Max Attempts:    {:<40} ║", self.api_max_attempts);
        println!("║ • Base Delay:      {:<37}ms ║", self.api_base_delay_ms);
        println!("║ • Max Delay:       {:<37}ms ║", self.api_max_delay_ms);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ INDEXER                                                    ║");
        println!("║ • Etherscan Key:   {:<40} ║", set(self.etherscan_api_key.is_some()));
        println!("║ • Polygonscan Key: {:<40} ║", set(self.polygon.explorer_api_key.is_some()));
        println!("║ • Basescan Key:    {:<40} ║", set(self.base.explorer_api_key.is_some()));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RPC                                                        ║");
        for chain in Chain::ALL {
            println!("║ • {:<16} {:>31} URL(s) ║", chain, self.rpc_urls(chain).len());
        }
        println!("║ • Fallback:        {:<40} ║",
            if self.rpc_fallback_enabled { "✓ Enabled" } else { "✗ Disabled" }
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./public/data"),
            default_chain: Chain::Polygon,
            default_stable_token: DEFAULT_STABLE_TOKEN.to_string(),
            stable_decimals: 6,
            window_seconds: 3600,
            max_jitter_secs: 300,
            api_max_attempts: 5,
            api_base_delay_ms: 500,
            api_max_delay_ms: 30_000,
            indexer_body_max_attempts: 3,
            http_timeout_secs: 30,
            etherscan_api_key: None,
            etherscan_v2_url: "https://api.etherscan.io/v2/api".to_string(),
            indexer_page_size: 1000,
            block_by_time_max_skew_steps: 4,
            block_by_time_skew_seconds: 30,
            rpc_log_block_chunk: 500,
            rpc_fallback_enabled: true,
            ethereum: ChainEndpoints::default(),
            polygon: ChainEndpoints::default(),
            base: ChainEndpoints::default(),
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

/// A JSON array of URLs, or URLs separated by commas, semicolons or whitespace
pub fn parse_rpc_list(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.starts_with('[') {
        if let Ok(urls) = serde_json::from_str::<Vec<String>>(value) {
            return urls
                .into_iter()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
    }
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(String::from)
        .collect()
}

// ============================================
// TESTS
// ============================================
