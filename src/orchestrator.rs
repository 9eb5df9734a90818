//! Orchestrator - one sequential pass over every configured pool
//!
//! Per-pool failures are contained here; only store I/O errors end the run.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use crate::accumulator::{PoolFailure, PoolOutcome, VolumeAccumulator};
use crate::chain::{Chain, IndexerClient, RpcClient};
use crate::config::Config;
use crate::error::VolumeError;
use crate::metrics::RunMetrics;
use crate::net::{HttpClient, HttpTransport};
use crate::store::{AlertLog, AlertRecord, Checkpoint, DataFiles, Ledger};

/// Deterministic start delay for a pool: `(h * 31 + byte)` over the address,
/// modulo `max + 1`. Spreads load; not a source of randomness.
pub fn pool_jitter_secs(address: &str, max_jitter_secs: u64) -> u64 {
    if max_jitter_secs == 0 {
        return 0;
    }
    let hash = address
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    u64::from(hash) % (max_jitter_secs + 1)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub apply_jitter: bool,
    /// Restrict the run to these pools (all when empty)
    pub only_pools: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub pools_seen: usize,
    pub accumulated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub plan_restricted: usize,
    pub volume_added: f64,
    pub alert: AlertRecord,
}

pub struct Orchestrator {
    config: Arc<Config>,
    files: DataFiles,
    accumulator: VolumeAccumulator,
    alerts: Arc<AlertLog>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, transport: Arc<dyn HttpTransport>) -> Self {
        let files = DataFiles::new(&config.data_dir);
        let metrics = Arc::new(RunMetrics::new());
        let alerts = Arc::new(AlertLog::new(files.alert.clone(), metrics.clone()));
        let http = HttpClient::new(transport, config.retry_policy(), metrics, alerts.clone());

        let accumulator = VolumeAccumulator::new(
            config.clone(),
            IndexerClient::new(http.clone(), config.clone()),
            RpcClient::new(http, config.clone()),
            alerts.clone(),
        );

        Self {
            config,
            files,
            accumulator,
            alerts,
        }
    }

    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary, VolumeError> {
        let mut ledger = Ledger::load(&self.files)?;
        self.alerts.reset();

        let filter: Vec<String> = options.only_pools.iter().map(|p| p.to_lowercase()).collect();
        let addresses: Vec<String> = ledger
            .pools
            .addresses()
            .into_iter()
            .filter(|a| filter.is_empty() || filter.contains(a))
            .collect();
        info!(
            "Processing {} of {} pool(s) from {}",
            addresses.len(),
            ledger.pools.len(),
            self.files.pools.display()
        );

        let mut summary = RunSummary::default();
        for address in addresses {
            summary.pools_seen += 1;

            let jitter = pool_jitter_secs(&address, self.config.max_jitter_secs);
            if options.apply_jitter && jitter > 0 {
                info!("Sleeping {}s before {}", jitter, address);
                tokio::time::sleep(Duration::from_secs(jitter)).await;
            }

            let chain = ledger
                .pools
                .get(&address)
                .map(|p| self.accumulator.pool_chain(p))
                .unwrap_or(self.config.default_chain);
            let span = info_span!("pool", address = %address, chain = %chain);
            let now = Utc::now().timestamp();

            match self
                .accumulator
                .process(&address, &mut ledger, now)
                .instrument(span)
                .await
            {
                Ok(PoolOutcome::Accumulated { volume, .. }) => {
                    summary.accumulated += 1;
                    summary.volume_added += volume;
                }
                Ok(PoolOutcome::Skipped(_)) => summary.skipped += 1,
                Err(failure) => {
                    if failure.error.is_store() {
                        error!("Store failure while processing {}: {}", address, failure.error);
                        return Err(failure.error);
                    }
                    if failure.error.is_plan_restricted() {
                        summary.plan_restricted += 1;
                        self.handle_plan_restricted(&address, &mut ledger, &failure)?;
                    } else {
                        summary.failed += 1;
                        error!("Pool {} on {} failed: {}", address, failure.chain, failure.error);
                        self.alerts.raise(format!(
                            "pool-error: pool={} chain={} code={} msg={}",
                            address,
                            failure.chain,
                            failure.error.code(),
                            failure.error
                        ));
                    }
                }
            }
        }

        summary.alert = self.alerts.finalize();
        Ok(summary)
    }

    /// Downgrade to a warning; seed a checkpoint so a later backfill knows
    /// where this pool's unprocessed history begins
    fn handle_plan_restricted(
        &self,
        address: &str,
        ledger: &mut Ledger,
        failure: &PoolFailure,
    ) -> Result<(), VolumeError> {
        let chain: Chain = failure.chain;
        warn!(
            "Indexer plan does not cover {} for {}; configure {} or upgrade ETHERSCAN_API_KEY",
            chain,
            address,
            chain.key_env()
        );
        self.alerts.note(format!(
            "unsupported-chain-plan: pool={} chain={}; configure {} or upgrade ETHERSCAN_API_KEY",
            address,
            chain,
            chain.key_env()
        ));

        if let Some(start_ts) = failure.start_ts {
            if !ledger.checkpoints.contains(address, chain) {
                ledger.checkpoints.advance(
                    address,
                    chain,
                    Checkpoint {
                        last_timestamp: Some(start_ts),
                        last_block: None,
                    },
                );
                ledger.checkpoints.save()?;
            }
        }
        Ok(())
    }
}
