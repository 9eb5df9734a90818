//! Diagnostic tool - Check configuration and key readiness
//!
//! Run with: cargo run --bin diagnose

use std::env;
use std::path::Path;

const CHAINS: [(&str, &str, &str, &str); 3] = [
    // (chain, key env, base url env, rpc prefix)
    ("ethereum", "ETHERSCAN_API_KEY", "ETHERSCAN_API_BASE_URL", "ETHEREUM"),
    ("polygon", "POLYGONSCAN_API_KEY", "POLYGONSCAN_API_BASE_URL", "POLYGON"),
    ("base", "BASESCAN_API_KEY", "BASESCAN_API_BASE_URL", "BASE"),
];

const DATA_FILES: [&str; 4] = [
    "pool_volume.json",
    "pool_volume_checkpoint.json",
    "pool_volume_runs.json",
    "pool_volume_alert.json",
];

fn var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

const PUBLIC_BASE_RPC: &str = "https://mainnet.base.org";

fn parse_rpc_list(value: &str) -> Vec<String> {
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

/// Endpoints a run would use for `prefix`, deduplicated in failover order
fn rpc_urls(get: impl Fn(&str) -> Option<String>, prefix: &str) -> Vec<String> {
    let mut candidates = get(&format!("{}_RPC_LIST", prefix))
        .map(|v| parse_rpc_list(&v))
        .unwrap_or_default();
    candidates.extend(get(&format!("{}_RPC", prefix)));
    if prefix == "ETHEREUM" {
        candidates.extend(get("ETH_RPC"));
    }
    if prefix == "BASE" {
        candidates.push(PUBLIC_BASE_RPC.to_string());
    }

    let mut urls: Vec<String> = Vec::new();
    for url in candidates {
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

fn main() {
    println!("🔍 POOL VOLUME DIAGNOSTIC CHECK\n");

    // Load .env
    dotenvy::dotenv().ok();

    println!("═══════════════════════════════════════════════════");
    println!("                  CONFIGURATION                     ");
    println!("═══════════════════════════════════════════════════\n");

    let checks = [
        ("DATA_DIR", "./public/data", "Where the JSON stores live"),
        ("DEFAULT_CHAIN", "polygon", "Chain for pools without one"),
        ("WINDOW_SECONDS", "3600", "Look-back for never-seen pools"),
        ("MAX_JITTER", "300", "Max per-pool start delay (s)"),
        ("API_MAX_ATTEMPTS", "5", "HTTP attempts per request"),
        ("RPC_FALLBACK_ENABLED", "true", "Use node RPC on plan restriction"),
    ];

    for (key, default, desc) in checks {
        let value = var(key);
        let marker = if value.is_none() { "(default)" } else { "(from .env)" };
        println!("  {}: {} {}", key, value.unwrap_or_else(|| default.to_string()), marker);
        println!("    └─ {}\n", desc);
    }

    println!("═══════════════════════════════════════════════════");
    println!("                  INDEXER ACCESS                    ");
    println!("═══════════════════════════════════════════════════\n");

    let etherscan = var("ETHERSCAN_API_KEY").is_some();
    for (chain, key_env, base_env, _) in CHAINS {
        let chain_key = chain != "ethereum" && var(key_env).is_some();
        let native = var(base_env).is_some() || chain_key;
        let mode = if native { "native explorer" } else { "unified v2" };
        let ready = chain_key || etherscan;
        println!(
            "  {:<9} {:<16} key: {}",
            chain,
            mode,
            if ready { "✅ Set" } else { "❌ Not set" }
        );
    }

    println!("\n═══════════════════════════════════════════════════");
    println!("                  RPC FALLBACK                      ");
    println!("═══════════════════════════════════════════════════\n");

    for (chain, _, _, prefix) in CHAINS {
        let urls = rpc_urls(var, prefix).len();
        println!(
            "  {:<9} {} URL(s) {}",
            chain,
            urls,
            if urls > 0 { "✅" } else { "❌" }
        );
    }

    println!("\n═══════════════════════════════════════════════════");
    println!("                  DATA FILES                        ");
    println!("═══════════════════════════════════════════════════\n");

    let data_dir = var("DATA_DIR").unwrap_or_else(|| "./public/data".to_string());
    for name in DATA_FILES {
        let path = Path::new(&data_dir).join(name);
        println!(
            "  {:<30} {}",
            name,
            if path.exists() { "✅ Present" } else { "➖ Not yet written" }
        );
    }

    if !etherscan && !CHAINS.iter().any(|(_, key, _, _)| var(key).is_some()) {
        println!("\n  ⚠️  WARNING: no explorer key configured!");
        println!("     `pool-volume run` will refuse to start.");
    }

    println!("\n✅ Diagnostic complete!\n");
}
