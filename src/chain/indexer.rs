//! Indexer Client - Etherscan-compatible explorer API
//!
//! Two endpoint modes:
//! - native: the chain's own explorer (`api.polygonscan.com`, ...), picked
//!   when a base URL override or a chain-specific key is configured
//! - unified: the Etherscan v2 multichain API with a `chainid` parameter
//!
//! HTTP-level retries happen in [`HttpClient`]. On top of that, an envelope
//! whose error text classifies as transient is retried with the body
//! attempt budget.

use alloy_primitives::U256;
use futures::{stream, Stream, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{Chain, TokenTransfer, TransferQuery, TransferTotals};
use crate::config::Config;
use crate::error::{classify_indexer_text, ErrorCode, VolumeError};
use crate::net::{redact_url, HttpClient, RetryDecision, RetryPolicy};

// ============================================
// ENDPOINT SELECTION
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerMode {
    Native,
    Unified,
}

#[derive(Debug, Clone)]
pub struct IndexerEndpoint {
    pub chain: Chain,
    pub mode: IndexerMode,
    pub base_url: String,
    pub api_key: Option<String>,
}

impl IndexerEndpoint {
    pub fn resolve(config: &Config, chain: Chain) -> Self {
        let endpoints = config.endpoints(chain);
        let chain_key = config.chain_api_key(chain);
        let native = endpoints.explorer_base_url.is_some()
            || (chain != Chain::Ethereum && chain_key.is_some());

        if native {
            let base_url = endpoints
                .explorer_base_url
                .as_deref()
                .unwrap_or(chain.native_explorer_url())
                .trim_end_matches('/')
                .to_string();
            Self {
                chain,
                mode: IndexerMode::Native,
                base_url,
                api_key: chain_key
                    .map(str::to_string)
                    .or_else(|| config.etherscan_api_key.clone()),
            }
        } else {
            Self {
                chain,
                mode: IndexerMode::Unified,
                base_url: config.etherscan_v2_url.clone(),
                api_key: config.etherscan_api_key.clone(),
            }
        }
    }

    /// Full request URL, `chainid` first in unified mode, `apikey` last
    pub fn url(&self, params: &[(&str, String)]) -> Result<String, VolumeError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| VolumeError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if self.mode == IndexerMode::Unified {
                query.append_pair("chainid", &self.chain.chain_id().to_string());
            }
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(key) = &self.api_key {
                query.append_pair("apikey", key);
            }
        }
        Ok(url.to_string())
    }
}

// ============================================
// WIRE TYPES
// ============================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

impl Envelope {
    fn is_ok(&self) -> bool {
        self.status == "1"
    }

    /// Message plus a string result, which is where the detail usually is
    fn error_text(&self) -> String {
        match &self.result {
            Value::String(detail) if !detail.is_empty() => format!("{} {}", self.message, detail),
            _ => self.message.clone(),
        }
    }

    fn code(&self) -> ErrorCode {
        classify_indexer_text(&self.error_text())
    }

    fn is_no_closest_block(&self) -> bool {
        self.error_text()
            .to_lowercase()
            .contains("no closest block found")
    }

    fn is_no_transfers(&self) -> bool {
        let text = self.error_text().to_lowercase();
        let is_empty_array = self.result.as_array().is_some_and(Vec::is_empty);
        text.contains("no transactions found")
            || text.contains("no token transfers found")
            || (is_empty_array && text.contains("no "))
    }

    fn into_error(self, context: &str) -> VolumeError {
        VolumeError::Indexer {
            code: self.code(),
            context: context.to_string(),
            message: self.error_text(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransfer {
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    token_decimal: Option<String>,
}

/// `result` of `getblocknobytime`: a number, a numeric string, or an object
/// carrying `blockNumber` / `block`
fn parse_block_result(result: &Value) -> Option<u64> {
    match result {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map
            .get("blockNumber")
            .or_else(|| map.get("block"))
            .and_then(|inner| match inner {
                Value::Object(_) => None,
                other => parse_block_result(other),
            }),
        _ => None,
    }
}

// ============================================
// CLIENT
// ============================================

pub struct IndexerClient {
    http: HttpClient,
    config: Arc<Config>,
    body_policy: RetryPolicy,
}

impl IndexerClient {
    pub fn new(http: HttpClient, config: Arc<Config>) -> Self {
        let body_policy = config.body_retry_policy();
        Self {
            http,
            config,
            body_policy,
        }
    }

    pub fn endpoint(&self, chain: Chain) -> IndexerEndpoint {
        IndexerEndpoint::resolve(&self.config, chain)
    }

    /// GET `url`, retrying envelopes whose error text is transient
    async fn fetch_envelope(&self, url: &str, context: &str) -> Result<Envelope, VolumeError> {
        let http = &self.http;
        let label = format!("{} {}", context, redact_url(url));

        self.body_policy
            .run(
                http.metrics(),
                &label,
                move |_| async move {
                    let envelope: Envelope = http.get_json(url).await?;
                    if !envelope.is_ok() && envelope.code() == ErrorCode::Transient {
                        return Err(envelope.into_error(context));
                    }
                    Ok(envelope)
                },
                |err| match err {
                    VolumeError::Indexer {
                        code: ErrorCode::Transient,
                        ..
                    } => RetryDecision::Retry,
                    _ => RetryDecision::Stop,
                },
            )
            .await
    }

    /// Latest block at or before `timestamp`.
    ///
    /// When the indexer has no closest block yet (fresh timestamps), the
    /// query steps back by the configured skew a bounded number of times.
    pub async fn block_by_timestamp(&self, timestamp: i64, chain: Chain) -> Result<u64, VolumeError> {
        if timestamp < 0 {
            return Err(VolumeError::InvalidTimestamp(timestamp));
        }
        let endpoint = self.endpoint(chain);
        let skew = self.config.block_by_time_skew_seconds.max(1);
        let max_steps = self.config.block_by_time_max_skew_steps;

        let mut query_ts = timestamp;
        let mut step = 0;
        loop {
            let url = endpoint.url(&[
                ("module", "block".to_string()),
                ("action", "getblocknobytime".to_string()),
                ("timestamp", query_ts.to_string()),
                ("closest", "before".to_string()),
            ])?;
            let envelope = self.fetch_envelope(&url, "getblocknobytime").await?;

            if envelope.is_ok() {
                return parse_block_result(&envelope.result).ok_or_else(|| VolumeError::Indexer {
                    code: ErrorCode::Generic,
                    context: format!("invalid block number for timestamp {}", query_ts),
                    message: envelope.result.to_string(),
                });
            }

            if envelope.is_no_closest_block() && step < max_steps {
                step += 1;
                let next = (query_ts - skew).max(0);
                debug!(
                    "No closest block for {} on {}; retrying at {} (step {}/{})",
                    query_ts, chain, next, step, max_steps
                );
                query_ts = next;
                continue;
            }

            return Err(envelope.into_error("failed to get block by time"));
        }
    }

    /// Decoded transfers of one page, plus the number of rows the indexer
    /// returned before malformed ones were dropped
    async fn transfer_page(
        &self,
        query: &TransferQuery,
        page: u32,
    ) -> Result<(Vec<TokenTransfer>, usize), VolumeError> {
        let url = self.endpoint(query.chain).url(&[
            ("module", "account".to_string()),
            ("action", "tokentx".to_string()),
            ("contractaddress", query.token.clone()),
            ("address", query.pair.clone()),
            ("startblock", query.start_block.to_string()),
            ("endblock", query.end_block.to_string()),
            ("page", page.to_string()),
            ("offset", self.config.indexer_page_size.to_string()),
            ("sort", "asc".to_string()),
        ])?;
        let envelope = self.fetch_envelope(&url, "tokentx").await?;

        if !envelope.is_ok() {
            if envelope.is_no_transfers() {
                return Ok((Vec::new(), 0));
            }
            return Err(envelope.into_error("tokentx error"));
        }

        let Value::Array(items) = envelope.result else {
            return Ok((Vec::new(), 0));
        };
        let rows = items.len();
        let transfers = items
            .into_iter()
            .filter_map(|item| self.decode_transfer(item))
            .collect();
        Ok((transfers, rows))
    }

    fn decode_transfer(&self, item: Value) -> Option<TokenTransfer> {
        let wire: WireTransfer = match serde_json::from_value(item) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Skipping malformed transfer: {}", e);
                return None;
            }
        };
        let raw = wire.value.as_deref().unwrap_or("0").trim();
        let Ok(raw_value) = U256::from_str_radix(raw, 10) else {
            warn!("Skipping transfer {:?} with unparseable value {:?}", wire.hash, raw);
            return None;
        };
        let decimals = wire
            .token_decimal
            .as_deref()
            .and_then(|d| d.trim().parse().ok())
            .unwrap_or(self.config.stable_decimals);

        Some(TokenTransfer {
            raw_value,
            decimals,
        })
    }

    /// Every matching transfer, fetched page by page as the stream is polled.
    /// A page with fewer rows than the page size is the last one; rows
    /// dropped as malformed still count towards a full page.
    pub fn token_transfers<'a>(
        &'a self,
        query: &'a TransferQuery,
    ) -> impl Stream<Item = Result<TokenTransfer, VolumeError>> + 'a {
        let page_size = self.config.indexer_page_size as usize;
        stream::try_unfold(Some(1u32), move |page| async move {
            let Some(page) = page else {
                return Ok::<_, VolumeError>(None);
            };
            let (batch, rows) = self.transfer_page(query, page).await?;
            if rows == 0 {
                return Ok(None);
            }
            let next = (rows >= page_size).then_some(page + 1);
            Ok::<_, VolumeError>(Some((batch, next)))
        })
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, VolumeError>)))
        .try_flatten()
    }

    /// Sum of transfer values in stablecoin units
    pub async fn sum_transfers(&self, query: &TransferQuery) -> Result<f64, VolumeError> {
        let transfers = self.token_transfers(query);
        futures::pin_mut!(transfers);

        let mut totals = TransferTotals::default();
        while let Some(transfer) = transfers.try_next().await? {
            totals.add(transfer.raw_value, transfer.decimals)?;
        }

        let volume = totals.to_units()?;
        info!(
            "Indexer: {} transfers for {} on {} (blocks {}-{}) = {:.6}",
            totals.count(),
            query.pair,
            query.chain,
            query.start_block,
            query.end_block,
            volume
        );
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{indexer_error, indexer_ok, query_param, FakeTransport, Harness};
    use serde_json::json;

    const PAIR: &str = "0x1111111111111111111111111111111111111111";
    const USDC: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";

    fn query(chain: Chain) -> TransferQuery {
        TransferQuery {
            chain,
            pair: PAIR.into(),
            token: USDC.into(),
            start_block: 1000,
            end_block: 1100,
        }
    }

    fn transfer(value: &str) -> Value {
        json!({ "hash": "0xaa", "blockNumber": "1001", "value": value, "tokenDecimal": "6" })
    }

    #[test]
    fn test_endpoint_modes() {
        let mut config = Config::default();
        config.etherscan_api_key = Some("global".into());

        let unified = IndexerEndpoint::resolve(&config, Chain::Polygon);
        assert_eq!(unified.mode, IndexerMode::Unified);
        let url = unified.url(&[("module", "block".into())]).unwrap();
        assert!(url.starts_with("https://api.etherscan.io/v2/api?chainid=137&module=block"));
        assert!(url.ends_with("apikey=global"));

        config.polygon.explorer_api_key = Some("poly".into());
        let native = IndexerEndpoint::resolve(&config, Chain::Polygon);
        assert_eq!(native.mode, IndexerMode::Native);
        assert_eq!(native.base_url, "https://api.polygonscan.com/api");
        assert_eq!(native.api_key.as_deref(), Some("poly"));

        // Ethereum only goes native with an explicit base URL
        assert_eq!(
            IndexerEndpoint::resolve(&config, Chain::Ethereum).mode,
            IndexerMode::Unified
        );
        config.ethereum.explorer_base_url = Some("https://eth.explorer.test/api/".into());
        let eth = IndexerEndpoint::resolve(&config, Chain::Ethereum);
        assert_eq!(eth.mode, IndexerMode::Native);
        assert_eq!(eth.base_url, "https://eth.explorer.test/api");
        assert_eq!(eth.api_key.as_deref(), Some("global"));
    }

    #[test]
    fn test_block_result_shapes() {
        assert_eq!(parse_block_result(&json!("12345")), Some(12345));
        assert_eq!(parse_block_result(&json!(12345)), Some(12345));
        assert_eq!(parse_block_result(&json!({ "blockNumber": "7" })), Some(7));
        assert_eq!(parse_block_result(&json!({ "block": 8 })), Some(8));
        assert_eq!(parse_block_result(&json!("Error!")), None);
    }

    #[tokio::test]
    async fn test_block_by_timestamp_sends_closest_before() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|req| {
            assert_eq!(query_param(&req.url, "closest").as_deref(), Some("before"));
            assert_eq!(query_param(&req.url, "chainid").as_deref(), Some("137"));
            Ok(indexer_ok(json!("50123")))
        });
        let indexer = harness.indexer(transport.clone());

        let block = indexer
            .block_by_timestamp(1_700_000_000, Chain::Polygon)
            .await;
        assert_eq!(tokio_test::assert_ok!(block), 50123);
    }

    #[tokio::test]
    async fn test_no_closest_block_steps_back_by_skew() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|req| {
            let ts: i64 = query_param(&req.url, "timestamp").unwrap().parse().unwrap();
            if ts > 1_700_000_000 - 60 {
                Ok(indexer_error("NOTOK", "Error! No closest block found"))
            } else {
                Ok(indexer_ok(json!(ts.to_string())))
            }
        });
        let indexer = harness.indexer(transport.clone());

        let block = indexer
            .block_by_timestamp(1_700_000_000, Chain::Polygon)
            .await
            .unwrap();
        assert_eq!(block, 1_700_000_000 - 60);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_skew_retries_are_bounded() {
        let harness = Harness::new();
        let transport =
            FakeTransport::new(|_| Ok(indexer_error("NOTOK", "Error! No closest block found")));
        let indexer = harness.indexer(transport.clone());

        let err = indexer
            .block_by_timestamp(1_700_000_000, Chain::Polygon)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Generic);
        // first attempt plus four skew steps
        assert_eq!(transport.request_count(), 5);
    }

    #[tokio::test]
    async fn test_plan_restriction_is_classified() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|_| {
            Ok(indexer_error(
                "NOTOK",
                "Free API access is not supported for this chain 8453",
            ))
        });
        let indexer = harness.indexer(transport.clone());

        let err = indexer
            .block_by_timestamp(1_700_000_000, Chain::Base)
            .await
            .unwrap_err();
        assert!(err.is_plan_restricted());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_body_is_retried_with_body_budget() {
        let harness = Harness::new();
        let transport =
            FakeTransport::new(|_| Ok(indexer_error("NOTOK", "Max rate limit reached")));
        let indexer = harness.indexer(transport.clone());

        let err = indexer
            .block_by_timestamp(1_700_000_000, Chain::Polygon)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            transport.request_count(),
            harness.config.indexer_body_max_attempts as usize
        );
    }

    #[tokio::test]
    async fn test_sum_transfers_single_page() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|req| {
            assert_eq!(query_param(&req.url, "action").as_deref(), Some("tokentx"));
            assert_eq!(query_param(&req.url, "address").as_deref(), Some(PAIR));
            assert_eq!(query_param(&req.url, "startblock").as_deref(), Some("1000"));
            Ok(indexer_ok(json!([transfer("5000000"), transfer("3000000")])))
        });
        let indexer = harness.indexer(transport.clone());

        let volume = indexer.sum_transfers(&query(Chain::Polygon)).await.unwrap();
        assert_eq!(volume, 8.0);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_full_page_fetches_next_page() {
        let harness = Harness::with_config(|c| c.indexer_page_size = 2);
        let transport = FakeTransport::new(|req| {
            match query_param(&req.url, "page").as_deref() {
                Some("1") => Ok(indexer_ok(json!([transfer("1000000"), transfer("1000000")]))),
                Some("2") => Ok(indexer_ok(json!([transfer("500000")]))),
                other => panic!("unexpected page {:?}", other),
            }
        });
        let indexer = harness.indexer(transport.clone());

        let volume = indexer.sum_transfers(&query(Chain::Polygon)).await.unwrap();
        assert_eq!(volume, 2.5);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_rows_still_count_towards_a_full_page() {
        let harness = Harness::with_config(|c| c.indexer_page_size = 2);
        let transport = FakeTransport::new(|req| {
            match query_param(&req.url, "page").as_deref() {
                Some("1") => Ok(indexer_ok(json!([
                    transfer("1000000"),
                    { "hash": "0xbb", "value": "garbage", "tokenDecimal": "6" },
                ]))),
                Some("2") => Ok(indexer_ok(json!([transfer("1000000")]))),
                other => panic!("unexpected page {:?}", other),
            }
        });
        let indexer = harness.indexer(transport.clone());

        let volume = indexer.sum_transfers(&query(Chain::Polygon)).await.unwrap();
        assert_eq!(volume, 2.0);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_block_result_is_not_a_validation_error() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|_| Ok(indexer_ok(json!("pending"))));
        let indexer = harness.indexer(transport);

        let err = indexer
            .block_by_timestamp(1_700_000_000, Chain::Polygon)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Generic);
    }

    #[test]
    fn test_no_transfers_detection() {
        let envelope = |message: &str, result: Value| Envelope {
            status: "0".into(),
            message: message.into(),
            result,
        };
        assert!(envelope("No transactions found", json!("")).is_no_transfers());
        assert!(envelope("NOTOK", json!("No token transfers found")).is_no_transfers());
        assert!(envelope("Query returned no records", json!([])).is_no_transfers());
        assert!(!envelope("Query returned no records", json!("Invalid API Key")).is_no_transfers());
        assert!(!envelope("NOTOK", json!([])).is_no_transfers());
    }

    #[tokio::test]
    async fn test_no_transfers_is_zero_volume() {
        let harness = Harness::new();
        let transport =
            FakeTransport::new(|_| Ok(indexer_error("No transactions found", "")));
        let indexer = harness.indexer(transport.clone());

        let volume = indexer.sum_transfers(&query(Chain::Polygon)).await.unwrap();
        assert_eq!(volume, 0.0);
    }

    #[tokio::test]
    async fn test_malformed_transfers_are_skipped() {
        let harness = Harness::new();
        let transport = FakeTransport::new(|_| {
            Ok(indexer_ok(json!([
                transfer("2000000"),
                { "hash": "0xbb", "value": "not-a-number", "tokenDecimal": "6" },
                { "hash": 7 },
            ])))
        });
        let indexer = harness.indexer(transport.clone());

        let volume = indexer.sum_transfers(&query(Chain::Polygon)).await.unwrap();
        assert_eq!(volume, 2.0);
    }
}
