//! Test fixtures: a scriptable transport, a synthetic JSON-RPC chain and a
//! harness wiring clients to a temp data directory.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::accumulator::VolumeAccumulator;
use crate::chain::{address_topic, parse_address, transfer_topic, IndexerClient, RpcClient};
use crate::config::Config;
use crate::error::VolumeError;
use crate::metrics::RunMetrics;
use crate::net::{HttpClient, HttpRequest, HttpResponse, HttpTransport, RetryPolicy};
use crate::store::{AlertLog, DataFiles, Ledger};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, VolumeError> + Send + Sync;

// ============================================
// FAKE TRANSPORT
// ============================================

pub struct FakeTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, VolumeError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, VolumeError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        retry_after: None,
        body: body.to_string(),
    }
}

pub fn status_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        retry_after: None,
        body: String::new(),
    }
}

pub fn indexer_ok(result: Value) -> HttpResponse {
    json_response(200, json!({ "status": "1", "message": "OK", "result": result }))
}

pub fn indexer_error(message: &str, result: &str) -> HttpResponse {
    json_response(200, json!({ "status": "0", "message": message, "result": result }))
}

pub fn query_param(url: &str, key: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// ============================================
// SYNTHETIC CHAIN
// ============================================

/// In-memory chain answering `eth_blockNumber`, `eth_getBlockByNumber` and
/// `eth_getLogs`
pub struct SyntheticChain {
    timestamps: Vec<u64>,
    logs: Vec<Value>,
    block_fetches: AtomicUsize,
    log_queries: AtomicUsize,
}

fn hex_quantity(value: &Value) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

impl SyntheticChain {
    /// `blocks` blocks, block n stamped `genesis + n * spacing`
    pub fn linear(blocks: usize, genesis: u64, spacing: u64) -> Self {
        Self {
            timestamps: (0..blocks as u64).map(|n| genesis + n * spacing).collect(),
            logs: Vec::new(),
            block_fetches: AtomicUsize::new(0),
            log_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_logs(mut self, logs: Vec<Value>) -> Self {
        self.logs = logs;
        self
    }

    pub fn block_fetches(&self) -> usize {
        self.block_fetches.load(Ordering::SeqCst)
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }

    pub fn respond(&self, request: &HttpRequest) -> Result<HttpResponse, VolumeError> {
        let body = request.body.clone().unwrap_or(Value::Null);
        let params = &body["params"];

        let result = match body["method"].as_str().unwrap_or_default() {
            "eth_blockNumber" => json!(format!("{:#x}", self.timestamps.len() - 1)),
            "eth_getBlockByNumber" => {
                self.block_fetches.fetch_add(1, Ordering::SeqCst);
                match hex_quantity(&params[0]).and_then(|n| {
                    self.timestamps.get(n as usize).map(|ts| (n, *ts))
                }) {
                    Some((n, ts)) => json!({
                        "number": format!("{:#x}", n),
                        "timestamp": format!("{:#x}", ts),
                    }),
                    None => Value::Null,
                }
            }
            "eth_getLogs" => {
                self.log_queries.fetch_add(1, Ordering::SeqCst);
                Value::Array(self.matching_logs(&params[0]))
            }
            other => {
                return Ok(json_response(
                    200,
                    json!({
                        "jsonrpc": "2.0",
                        "id": body["id"],
                        "error": { "code": -32601, "message": format!("method {} not found", other) },
                    }),
                ))
            }
        };

        Ok(json_response(
            200,
            json!({ "jsonrpc": "2.0", "id": body["id"], "result": result }),
        ))
    }

    fn matching_logs(&self, filter: &Value) -> Vec<Value> {
        let from = hex_quantity(&filter["fromBlock"]).unwrap_or(0);
        let to = hex_quantity(&filter["toBlock"]).unwrap_or(u64::MAX);
        let address = filter["address"].as_str().unwrap_or_default().to_lowercase();
        let wanted: Vec<Option<String>> = filter["topics"]
            .as_array()
            .map(|topics| {
                topics
                    .iter()
                    .map(|t| t.as_str().map(str::to_lowercase))
                    .collect()
            })
            .unwrap_or_default();

        self.logs
            .iter()
            .filter(|log| {
                let block = hex_quantity(&log["blockNumber"]).unwrap_or(0);
                let same_token = log["address"].as_str().unwrap_or_default().to_lowercase() == address;
                let topics_match = wanted.iter().enumerate().all(|(i, want)| match want {
                    Some(want) => log["topics"][i]
                        .as_str()
                        .is_some_and(|t| t.to_lowercase() == *want),
                    None => true,
                });
                (from..=to).contains(&block) && same_token && topics_match
            })
            .cloned()
            .collect()
    }
}

/// USDC `Transfer` log on the default stablecoin contract
pub fn transfer_log(
    tx_hash: &str,
    log_index: u64,
    block: u64,
    from: &str,
    to: &str,
    amount: u64,
) -> Value {
    let topic = |a: &str| parse_address(a).map(|a| address_topic(&a)).unwrap();
    json!({
        "address": crate::config::DEFAULT_STABLE_TOKEN.to_lowercase(),
        "topics": [transfer_topic(), topic(from), topic(to)],
        "data": format!("0x{:064x}", amount),
        "blockNumber": format!("{:#x}", block),
        "transactionHash": tx_hash,
        "logIndex": format!("{:#x}", log_index),
    })
}

// ============================================
// HARNESS
// ============================================

pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config {
        data_dir: data_dir.to_path_buf(),
        etherscan_api_key: Some("test-key".into()),
        etherscan_v2_url: "http://indexer.test/v2/api".into(),
        max_jitter_secs: 0,
        api_base_delay_ms: 1,
        api_max_delay_ms: 10,
        http_timeout_secs: 5,
        ..Config::default()
    };
    config.ethereum.rpc_urls = vec!["http://rpc.test/ethereum".into()];
    config.polygon.rpc_urls = vec!["http://rpc.test/polygon".into()];
    config.base.rpc_urls = vec!["http://rpc.test/base".into()];
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub metrics: Arc<RunMetrics>,
    pub alerts: Arc<AlertLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        customize(&mut config);

        let metrics = Arc::new(RunMetrics::new());
        let alerts = Arc::new(AlertLog::new(
            DataFiles::new(&config.data_dir).alert,
            metrics.clone(),
        ));
        Self {
            dir,
            config: Arc::new(config),
            metrics,
            alerts,
        }
    }

    pub fn files(&self) -> DataFiles {
        DataFiles::new(&self.config.data_dir)
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::load(&self.files()).unwrap()
    }

    pub fn http(&self, transport: Arc<dyn HttpTransport>) -> HttpClient {
        self.http_with_policy(transport, self.config.retry_policy())
    }

    pub fn http_with_policy(&self, transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> HttpClient {
        HttpClient::new(transport, policy, self.metrics.clone(), self.alerts.clone())
    }

    pub fn indexer(&self, transport: Arc<dyn HttpTransport>) -> IndexerClient {
        IndexerClient::new(self.http(transport), self.config.clone())
    }

    pub fn rpc(&self, transport: Arc<dyn HttpTransport>) -> RpcClient {
        RpcClient::new(self.http(transport), self.config.clone())
    }

    pub fn accumulator(&self, transport: Arc<dyn HttpTransport>) -> VolumeAccumulator {
        let http = self.http(transport);
        VolumeAccumulator::new(
            self.config.clone(),
            IndexerClient::new(http.clone(), self.config.clone()),
            RpcClient::new(http, self.config.clone()),
            self.alerts.clone(),
        )
    }

    /// Write a JSON document into the data directory
    pub fn seed(&self, path: &std::path::Path, value: Value) {
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    pub fn read(&self, path: &std::path::Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }
}
