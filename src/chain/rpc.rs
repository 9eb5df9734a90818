//! RPC Fallback Client
//!
//! Raw JSON-RPC against the configured endpoints, in failover order. Used
//! only when the indexer plan does not cover a chain:
//! - block lookup by timestamp via binary search over `eth_getBlockByNumber`
//! - volume via chunked `eth_getLogs` for `Transfer` events touching the pair

use alloy_primitives::U256;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{
    address_topic, parse_address, raw_to_units, transfer_topic, Chain, TransferQuery,
};
use crate::config::Config;
use crate::error::{classify_rpc_text, ErrorCode, VolumeError};
use crate::net::{redact_url, HttpClient, RetryDecision, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

// ============================================
// WIRE TYPES
// ============================================

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    log_index: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

impl RawLog {
    fn key(&self) -> (String, String) {
        (
            self.transaction_hash.clone().unwrap_or_default().to_lowercase(),
            self.log_index.clone().unwrap_or_default().to_lowercase(),
        )
    }

    /// Transfer amount from the data word; empty data is zero
    fn amount(&self) -> Option<U256> {
        let data = self.data.as_deref().unwrap_or("0x");
        let body = data.strip_prefix("0x").unwrap_or(data);
        if body.is_empty() {
            return Some(U256::ZERO);
        }
        U256::from_str_radix(body, 16).ok()
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    From,
    To,
}

fn parse_quantity(value: &Value) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn quantity(n: u64) -> String {
    format!("{:#x}", n)
}

// ============================================
// CLIENT
// ============================================

pub struct RpcClient {
    http: HttpClient,
    config: Arc<Config>,
    body_policy: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(http: HttpClient, config: Arc<Config>) -> Self {
        let body_policy = config.body_retry_policy();
        Self {
            http,
            config,
            body_policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method` on each configured URL until one answers with a result
    /// `decode` accepts. A malformed result (lagging node, null block) moves
    /// on to the next URL like any other endpoint failure.
    async fn call<T, F>(
        &self,
        chain: Chain,
        method: &str,
        params: Value,
        decode: F,
    ) -> Result<T, VolumeError>
    where
        F: Fn(&Value) -> Result<T, String>,
    {
        let urls = self.config.rpc_urls(chain);
        let mut last_err = None;

        for url in &urls {
            let outcome = self
                .call_endpoint(url, method, &params)
                .await
                .and_then(|result| {
                    decode(&result).map_err(|message| VolumeError::Rpc {
                        code: ErrorCode::Generic,
                        method: method.to_string(),
                        url: redact_url(url),
                        message,
                    })
                });
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("RPC {} failed at {}: {}", method, redact_url(url), e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Err(VolumeError::MissingRpcUrl(chain)),
        }
    }

    async fn call_endpoint(
        &self,
        url: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, VolumeError> {
        let client = self;
        let label = format!("{} {}", method, redact_url(url));

        self.body_policy
            .run(
                self.http.metrics(),
                &label,
                move |_| async move {
                    let payload = json!({
                        "jsonrpc": "2.0",
                        "id": client.next_id.fetch_add(1, Ordering::Relaxed),
                        "method": method,
                        "params": params,
                    });
                    let envelope: RpcEnvelope = client.http.post_json(url, payload).await?;
                    if let Some(err) = envelope.error {
                        return Err(VolumeError::Rpc {
                            code: classify_rpc_text(&err.message),
                            method: method.to_string(),
                            url: redact_url(url),
                            message: format!("{} (code {})", err.message, err.code),
                        });
                    }
                    Ok(envelope.result)
                },
                |err| match err {
                    VolumeError::Rpc {
                        code: ErrorCode::Transient,
                        ..
                    } => RetryDecision::Retry,
                    _ => RetryDecision::Stop,
                },
            )
            .await
    }

    pub async fn latest_block(&self, chain: Chain) -> Result<u64, VolumeError> {
        self.call(chain, "eth_blockNumber", json!([]), |result| {
            parse_quantity(result).ok_or_else(|| format!("bad block number {}", result))
        })
        .await
    }

    pub async fn block(&self, chain: Chain, number: u64) -> Result<BlockHeader, VolumeError> {
        let params = json!([quantity(number), false]);
        self.call(chain, "eth_getBlockByNumber", params, |result| {
            if result.is_null() {
                return Err(format!("missing block data for {}", number));
            }
            let timestamp = parse_quantity(&result["timestamp"])
                .ok_or_else(|| format!("block {} has no timestamp", number))?;
            Ok(BlockHeader {
                number: parse_quantity(&result["number"]).unwrap_or(number),
                timestamp,
            })
        })
        .await
    }

    /// Largest block whose timestamp is `<= timestamp`, in O(log latest)
    /// block fetches.
    pub async fn block_by_timestamp(&self, timestamp: i64, chain: Chain) -> Result<u64, VolumeError> {
        if timestamp < 0 {
            return Err(VolumeError::InvalidTimestamp(timestamp));
        }
        let target = timestamp as u64;

        let latest = self.latest_block(chain).await?;
        let head = self.block(chain, latest).await?;
        if target >= head.timestamp {
            return Ok(latest);
        }

        let mut low = 0u64;
        let mut high = latest;
        let mut best: Option<u64> = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let header = self.block(chain, mid).await?;
            if header.timestamp <= target {
                best = Some(mid);
                low = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                high = mid - 1;
            }
        }

        debug!("RPC block for {} on {}: {:?}", timestamp, chain, best);
        best.ok_or(VolumeError::NoBlockBefore {
            chain,
            timestamp: target,
        })
    }

    async fn transfer_logs(
        &self,
        query: &TransferQuery,
        from_block: u64,
        to_block: u64,
        pair_topic: &str,
        side: Side,
    ) -> Result<Vec<RawLog>, VolumeError> {
        let topics = match side {
            Side::From => json!([transfer_topic(), pair_topic]),
            Side::To => json!([transfer_topic(), Value::Null, pair_topic]),
        };
        let filter = json!({
            "address": query.token.to_lowercase(),
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
            "topics": topics,
        });

        self.call(query.chain, "eth_getLogs", json!([filter]), |result| {
            let items = result
                .as_array()
                .ok_or_else(|| "result is not an array".to_string())?;
            Ok(items
                .iter()
                .filter_map(|item| match RawLog::deserialize(item) {
                    Ok(log) => Some(log),
                    Err(e) => {
                        warn!("Skipping malformed log: {}", e);
                        None
                    }
                })
                .collect::<Vec<RawLog>>())
        })
        .await
    }

    /// Sum of `Transfer` values into or out of the pair over
    /// `[start_block, end_block]`, scanned in chunks. A log matching both
    /// sides (self-transfer) counts once.
    pub async fn sum_transfer_logs(
        &self,
        query: &TransferQuery,
        decimals: u8,
    ) -> Result<f64, VolumeError> {
        if query.end_block < query.start_block {
            return Err(VolumeError::InvalidBlockRange {
                start: query.start_block,
                end: query.end_block,
            });
        }
        parse_address(&query.token)?;
        let pair_topic = address_topic(&parse_address(&query.pair)?);
        let chunk = self.config.rpc_log_block_chunk.max(10);

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut total = U256::ZERO;
        let mut counted = 0usize;
        let mut from = query.start_block;

        loop {
            let to = query.end_block.min(from.saturating_add(chunk - 1));
            let outgoing = self
                .transfer_logs(query, from, to, &pair_topic, Side::From)
                .await?;
            let incoming = self
                .transfer_logs(query, from, to, &pair_topic, Side::To)
                .await?;

            for log in outgoing.into_iter().chain(incoming) {
                if !seen.insert(log.key()) {
                    continue;
                }
                let Some(amount) = log.amount() else {
                    warn!("Skipping log {:?} with malformed data", log.transaction_hash);
                    continue;
                };
                total = total.checked_add(amount).ok_or_else(|| {
                    VolumeError::Validation("transfer total overflowed uint256".into())
                })?;
                counted += 1;
            }

            if to >= query.end_block {
                break;
            }
            from = to + 1;
        }

        let volume = raw_to_units(total, decimals)?;
        info!(
            "RPC: {} transfer logs for {} on {} (blocks {}-{}) = {:.6}",
            counted, query.pair, query.chain, query.start_block, query.end_block, volume
        );
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{transfer_log, FakeTransport, Harness, SyntheticChain};
    use std::sync::atomic::AtomicU32;

    const PAIR: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";
    const USDC: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";

    fn query(start_block: u64, end_block: u64) -> TransferQuery {
        TransferQuery {
            chain: Chain::Polygon,
            pair: PAIR.into(),
            token: USDC.into(),
            start_block,
            end_block,
        }
    }

    fn serve(chain: &Arc<SyntheticChain>) -> Arc<FakeTransport> {
        let chain = chain.clone();
        FakeTransport::new(move |req| chain.respond(req))
    }

    #[tokio::test]
    async fn test_binary_search_boundaries() {
        // block n has timestamp 1000 + 10n
        let chain = Arc::new(SyntheticChain::linear(1024, 1000, 10));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        assert_eq!(rpc.block_by_timestamp(1000, Chain::Polygon).await.unwrap(), 0);
        assert_eq!(rpc.block_by_timestamp(1005, Chain::Polygon).await.unwrap(), 0);
        assert_eq!(rpc.block_by_timestamp(1010, Chain::Polygon).await.unwrap(), 1);
        assert_eq!(rpc.block_by_timestamp(5555, Chain::Polygon).await.unwrap(), 455);
        // exactly the head timestamp
        assert_eq!(
            rpc.block_by_timestamp(1000 + 10 * 1023, Chain::Polygon).await.unwrap(),
            1023
        );
        assert_eq!(
            rpc.block_by_timestamp(1000 + 10 * 1023 - 1, Chain::Polygon).await.unwrap(),
            1022
        );
        // at or past the head short-circuits
        assert_eq!(
            rpc.block_by_timestamp(1_000_000, Chain::Polygon).await.unwrap(),
            1023
        );
    }

    #[tokio::test]
    async fn test_binary_search_is_logarithmic() {
        let chain = Arc::new(SyntheticChain::linear(1 << 16, 0, 2));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        rpc.block_by_timestamp(77_777, Chain::Polygon).await.unwrap();
        // head fetch + at most log2(n)+1 midpoint fetches
        assert!(chain.block_fetches() <= 1 + 17, "fetches = {}", chain.block_fetches());
    }

    #[tokio::test]
    async fn test_timestamp_before_genesis() {
        let chain = Arc::new(SyntheticChain::linear(100, 1000, 10));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        let err = rpc.block_by_timestamp(999, Chain::Polygon).await.unwrap_err();
        assert!(matches!(err, VolumeError::NoBlockBefore { timestamp: 999, .. }));

        let err = rpc.block_by_timestamp(-1, Chain::Polygon).await.unwrap_err();
        assert!(matches!(err, VolumeError::InvalidTimestamp(-1)));
    }

    #[tokio::test]
    async fn test_sum_transfer_logs_dedups_and_chunks() {
        let chain = Arc::new(SyntheticChain::linear(2000, 0, 2).with_logs(vec![
            transfer_log("0xa1", 0, 5, PAIR, OTHER, 1_000_000),
            transfer_log("0xa2", 3, 700, OTHER, PAIR, 2_500_000),
            // self-transfer: matches both the from and the to filter
            transfer_log("0xa3", 1, 1400, PAIR, PAIR, 4_000_000),
            // outside the range
            transfer_log("0xa4", 0, 1900, OTHER, PAIR, 9_000_000),
            // unrelated
            transfer_log("0xa5", 0, 10, OTHER, OTHER, 7_000_000),
        ]));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        let volume = rpc.sum_transfer_logs(&query(0, 1500), 6).await.unwrap();
        assert_eq!(volume, 7.5);
        // 1501 blocks at 500 per chunk is four chunks, two queries each
        assert_eq!(chain.log_queries(), 8);
    }

    #[tokio::test]
    async fn test_empty_range_is_zero() {
        let chain = Arc::new(SyntheticChain::linear(100, 0, 2));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        let volume = rpc.sum_transfer_logs(&query(10, 10), 6).await.unwrap();
        assert_eq!(volume, 0.0);

        let err = rpc.sum_transfer_logs(&query(10, 9), 6).await.unwrap_err();
        assert!(matches!(err, VolumeError::InvalidBlockRange { .. }));
    }

    #[tokio::test]
    async fn test_missing_rpc_url() {
        let harness = Harness::with_config(|c| c.polygon.rpc_urls.clear());
        let rpc = harness.rpc(FakeTransport::new(|_| panic!("no request expected")));

        let err = rpc.latest_block(Chain::Polygon).await.unwrap_err();
        assert!(matches!(err, VolumeError::MissingRpcUrl(Chain::Polygon)));
        assert_eq!(err.code(), ErrorCode::Configuration);
    }

    #[tokio::test]
    async fn test_failover_to_second_url() {
        let chain = Arc::new(SyntheticChain::linear(10, 0, 1));
        let harness = Harness::with_config(|c| {
            c.polygon.rpc_urls = vec!["http://dead.test".into(), "http://rpc.test/polygon".into()];
        });
        let served = chain.clone();
        let transport = FakeTransport::new(move |req| {
            if req.url.starts_with("http://dead.test") {
                Ok(crate::testing::status_response(404))
            } else {
                served.respond(req)
            }
        });
        let rpc = harness.rpc(transport.clone());

        assert_eq!(rpc.latest_block(Chain::Polygon).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_missing_block_data_is_an_endpoint_failure() {
        let chain = Arc::new(SyntheticChain::linear(10, 0, 1));
        let harness = Harness::new();
        let rpc = harness.rpc(serve(&chain));

        let err = rpc.block(Chain::Polygon, 50).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Generic);
        assert!(err.to_string().contains("http://rpc.test/polygon"), "{}", err);
    }

    #[tokio::test]
    async fn test_null_block_fails_over_to_next_url() {
        let chain = Arc::new(SyntheticChain::linear(100, 1000, 10));
        let harness = Harness::with_config(|c| {
            c.polygon.rpc_urls = vec!["http://lagging.test".into(), "http://rpc.test/polygon".into()];
        });
        let served = chain.clone();
        let transport = FakeTransport::new(move |req| {
            let method = req.body.as_ref().and_then(|b| b["method"].as_str());
            if req.url.starts_with("http://lagging.test") && method == Some("eth_getBlockByNumber") {
                Ok(crate::testing::json_response(
                    200,
                    json!({ "jsonrpc": "2.0", "id": 1, "result": null }),
                ))
            } else {
                served.respond(req)
            }
        });
        let rpc = harness.rpc(transport);

        assert_eq!(rpc.block_by_timestamp(1555, Chain::Polygon).await.unwrap(), 55);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_rpc_body_is_retried() {
        let chain = Arc::new(SyntheticChain::linear(10, 0, 1));
        let harness = Harness::new();
        let calls = Arc::new(AtomicU32::new(0));
        let (served, seen) = (chain.clone(), calls.clone());
        let transport = FakeTransport::new(move |req| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(crate::testing::json_response(
                    200,
                    json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32005, "message": "daily request limit exceeded" } }),
                ))
            } else {
                served.respond(req)
            }
        });
        let rpc = harness.rpc(transport.clone());

        assert_eq!(rpc.latest_block(Chain::Polygon).await.unwrap(), 9);
        assert_eq!(transport.request_count(), 2);
    }
}
