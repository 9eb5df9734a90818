//! Volume Accumulator - per-pool reconciliation pass
//!
//! ```text
//! Idle -> WindowDetermined -> BlockRangeResolved -> VolumeSummed -> Persisted
//!               |                     |
//!               +-> Skipped           +-> Failed
//! ```
//!
//! The indexer is tried first. A plan-restricted answer switches the whole
//! window (block lookup and summation) to the RPC path. Stores are written
//! as soon as the pool completes so a crash later in the run keeps progress.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{
    is_valid_address, Chain, DataSource, IndexerClient, RpcClient, TransferQuery,
};
use crate::config::Config;
use crate::error::{ErrorCode, VolumeError};
use crate::store::{AlertLog, Checkpoint, Ledger, PoolRecord, RunEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStage {
    Idle,
    WindowDetermined,
    BlockRangeResolved,
    VolumeSummed,
    Persisted,
    Skipped,
    Failed,
}

/// `[start_ts, end_ts)` in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.start_ts >= self.end_ts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyWindow,
    InvalidAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolOutcome {
    Accumulated {
        window: Window,
        start_block: u64,
        end_block: u64,
        volume: f64,
        source: DataSource,
    },
    Skipped(SkipReason),
}

#[derive(Debug)]
pub struct PoolFailure {
    pub chain: Chain,
    /// Window start, when one was determined
    pub start_ts: Option<i64>,
    pub error: VolumeError,
}

struct Resolved {
    start_block: u64,
    end_block: u64,
    volume: f64,
    source: DataSource,
}

/// Tracks the stage of one pool's pass for logging
struct PoolRun<'a> {
    address: &'a str,
    chain: Chain,
    stage: PoolStage,
}

impl<'a> PoolRun<'a> {
    fn advance(&mut self, stage: PoolStage) {
        debug!("{} [{}]: {:?} -> {:?}", self.address, self.chain, self.stage, stage);
        self.stage = stage;
    }

    fn fail(&mut self, start_ts: Option<i64>, error: VolumeError) -> PoolFailure {
        self.advance(PoolStage::Failed);
        PoolFailure {
            chain: self.chain,
            start_ts,
            error,
        }
    }
}

pub struct VolumeAccumulator {
    config: Arc<Config>,
    indexer: IndexerClient,
    rpc: RpcClient,
    alerts: Arc<AlertLog>,
}

impl VolumeAccumulator {
    pub fn new(
        config: Arc<Config>,
        indexer: IndexerClient,
        rpc: RpcClient,
        alerts: Arc<AlertLog>,
    ) -> Self {
        Self {
            config,
            indexer,
            rpc,
            alerts,
        }
    }

    /// Chain named by the record, else the configured default
    pub fn pool_chain(&self, pool: &PoolRecord) -> Chain {
        match pool.chain.as_deref().map(str::parse::<Chain>) {
            Some(Ok(chain)) => chain,
            Some(Err(e)) => {
                warn!("{}; using default chain {}", e, self.config.default_chain);
                self.config.default_chain
            }
            None => self.config.default_chain,
        }
    }

    /// Run one reconciliation pass for `address` at time `now`
    pub async fn process(
        &self,
        address: &str,
        ledger: &mut Ledger,
        now: i64,
    ) -> Result<PoolOutcome, PoolFailure> {
        let address = address.to_lowercase();
        let pool = ledger.pools.get(&address).cloned().unwrap_or_default();
        let chain = self.pool_chain(&pool);
        let mut run = PoolRun {
            address: &address,
            chain,
            stage: PoolStage::Idle,
        };

        let checkpoint = ledger.checkpoints.get(&address, chain);
        let window = Window {
            start_ts: checkpoint
                .and_then(|c| c.last_timestamp)
                .or_else(|| pool.last_updated_secs())
                .unwrap_or(now - self.config.window_seconds),
            end_ts: now,
        };
        run.advance(PoolStage::WindowDetermined);

        if window.is_empty() {
            info!(
                "Skipping {}: window start {} is not before {}",
                address, window.start_ts, window.end_ts
            );
            let last_block = checkpoint.and_then(|c| c.last_block);
            self.skip_to(ledger, &mut run, window, last_block)?;
            return Ok(PoolOutcome::Skipped(SkipReason::EmptyWindow));
        }

        let pair = pool.address.as_deref().unwrap_or(&address).to_lowercase();
        let token = pool
            .usdc
            .as_deref()
            .unwrap_or(&self.config.default_stable_token)
            .to_lowercase();
        if !is_valid_address(&pair) || !is_valid_address(&token) {
            warn!("Skipping {}: invalid address (pair={}, usdc={})", address, pair, token);
            self.alerts.note(format!(
                "invalid-address: pool={} chain={} pair={} usdc={}",
                address, chain, pair, token
            ));
            self.skip_to(ledger, &mut run, window, None)?;
            return Ok(PoolOutcome::Skipped(SkipReason::InvalidAddress));
        }

        let query = TransferQuery {
            chain,
            pair,
            token,
            start_block: 0,
            end_block: 0,
        };
        let decimals = pool.stable_decimals().unwrap_or(self.config.stable_decimals);

        let resolved = match self.resolve_via_indexer(&mut run, window, &query).await {
            Ok(resolved) => Ok(resolved),
            Err(err) if err.is_plan_restricted() && self.config.rpc_fallback_enabled => {
                warn!("Indexer plan does not cover {}; falling back to RPC", chain);
                self.alerts.note(format!(
                    "indexer-fallback-rpc: pool={} chain={} reason={}",
                    address, chain, err
                ));
                self.resolve_via_rpc(&mut run, window, &query, decimals).await
            }
            Err(err) => Err(err),
        };

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                if err.code() == ErrorCode::Validation {
                    // a permanently bad window must not be retried forever
                    self.skip_to(ledger, &mut run, window, None)?;
                }
                return Err(run.fail(Some(window.start_ts), err));
            }
        };

        self.persist(ledger, &mut run, window, &resolved)?;
        Ok(PoolOutcome::Accumulated {
            window,
            start_block: resolved.start_block,
            end_block: resolved.end_block,
            volume: resolved.volume,
            source: resolved.source,
        })
    }

    async fn resolve_via_indexer(
        &self,
        run: &mut PoolRun<'_>,
        window: Window,
        query: &TransferQuery,
    ) -> Result<Resolved, VolumeError> {
        let start_block = self.indexer.block_by_timestamp(window.start_ts, query.chain).await?;
        let end_block = self.indexer.block_by_timestamp(window.end_ts, query.chain).await?;
        check_range(start_block, end_block)?;
        run.advance(PoolStage::BlockRangeResolved);

        let query = TransferQuery {
            start_block,
            end_block,
            ..query.clone()
        };
        let volume = self.indexer.sum_transfers(&query).await?;
        run.advance(PoolStage::VolumeSummed);

        Ok(Resolved {
            start_block,
            end_block,
            volume,
            source: DataSource::Indexer,
        })
    }

    async fn resolve_via_rpc(
        &self,
        run: &mut PoolRun<'_>,
        window: Window,
        query: &TransferQuery,
        decimals: u8,
    ) -> Result<Resolved, VolumeError> {
        let start_block = self.rpc.block_by_timestamp(window.start_ts, query.chain).await?;
        let end_block = self.rpc.block_by_timestamp(window.end_ts, query.chain).await?;
        check_range(start_block, end_block)?;
        run.advance(PoolStage::BlockRangeResolved);

        let query = TransferQuery {
            start_block,
            end_block,
            ..query.clone()
        };
        let volume = self.rpc.sum_transfer_logs(&query, decimals).await?;
        run.advance(PoolStage::VolumeSummed);

        Ok(Resolved {
            start_block,
            end_block,
            volume,
            source: DataSource::RpcFallback,
        })
    }

    /// Advance the checkpoint past `window` without touching the total
    fn skip_to(
        &self,
        ledger: &mut Ledger,
        run: &mut PoolRun<'_>,
        window: Window,
        last_block: Option<u64>,
    ) -> Result<(), PoolFailure> {
        ledger.checkpoints.advance(
            run.address,
            run.chain,
            Checkpoint {
                last_timestamp: Some(window.end_ts),
                last_block,
            },
        );
        ledger
            .checkpoints
            .save()
            .map_err(|e| run.fail(Some(window.start_ts), e))?;
        if run.stage != PoolStage::Failed {
            run.advance(PoolStage::Skipped);
        }
        Ok(())
    }

    fn persist(
        &self,
        ledger: &mut Ledger,
        run: &mut PoolRun<'_>,
        window: Window,
        resolved: &Resolved,
    ) -> Result<(), PoolFailure> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let increment = if resolved.volume.is_finite() && resolved.volume > 0.0 {
            resolved.volume
        } else {
            0.0
        };

        let record = ledger.pools.entry(run.address);
        let total = record.total_usd.unwrap_or(0.0) + increment;
        record.total_usd = Some(total);
        record.last_updated = Some(Value::String(stamp.clone()));

        let entry = RunEntry {
            pool: run.address.to_string(),
            start_ts: window.start_ts,
            end_ts: window.end_ts,
            start_block: resolved.start_block,
            end_block: resolved.end_block,
            total_usd: resolved.volume,
            source: resolved.source,
            ts: stamp,
        };
        ledger.checkpoints.advance(
            run.address,
            run.chain,
            Checkpoint {
                last_timestamp: Some(window.end_ts),
                last_block: Some(resolved.end_block),
            },
        );

        let written = ledger
            .runs
            .append(&entry)
            .and_then(|_| ledger.pools.save())
            .and_then(|_| ledger.runs.save())
            .and_then(|_| ledger.checkpoints.save());
        written.map_err(|e| run.fail(Some(window.start_ts), e))?;

        run.advance(PoolStage::Persisted);
        info!(
            "{} [{}]: +{:.6} via {} (blocks {}-{}), total {:.6}",
            run.address,
            run.chain,
            resolved.volume,
            resolved.source,
            resolved.start_block,
            resolved.end_block,
            total
        );
        Ok(())
    }
}

fn check_range(start_block: u64, end_block: u64) -> Result<(), VolumeError> {
    if end_block < start_block {
        return Err(VolumeError::InvalidBlockRange {
            start: start_block,
            end: end_block,
        });
    }
    Ok(())
}
