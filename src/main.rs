//! Pool Volume - hourly USD volume reconciliation for stablecoin pools
//!
//! Run with: cargo run -- run
//!
//! Each invocation is one batch pass: every pool's volume since its last
//! checkpoint is summed (indexer first, node RPC when the indexer plan does
//! not cover the chain) and added to the pool's running total.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod accumulator;
mod chain;
mod config;
mod error;
mod metrics;
mod net;
mod orchestrator;
mod report;
mod store;

#[cfg(test)]
mod testing;

use config::Config;
use net::ReqwestTransport;
use orchestrator::{Orchestrator, RunOptions, RunSummary};
use store::PoolBook;

#[derive(Debug, Parser)]
#[command(name = "pool-volume", version, about = "Stablecoin pool volume reconciliation")]
struct Cli {
    /// TOML configuration file (environment / .env when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory holding the JSON stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile every pool once
    Run {
        /// Skip the per-pool start delay
        #[arg(long)]
        no_jitter: bool,

        /// Only process these pool addresses
        #[arg(long = "pool", value_name = "ADDR")]
        pools: Vec<String>,
    },
    /// Print the current pool totals
    Report,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 📊 POOL VOLUME - Stablecoin Volume Reconciliation").cyan().bold()
    );
    println!(
        "{}",
        style("    Indexer first | RPC fallback | Checkpointed").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn print_summary(summary: &RunSummary, elapsed: Duration) {
    println!();
    println!("{}", style("═══ RUN SUMMARY ═══").green().bold());
    println!("   Pools seen:       {}", summary.pools_seen);
    println!("   Accumulated:      {}", style(summary.accumulated).green());
    println!("   Skipped:          {}", summary.skipped);
    println!("   Plan restricted:  {}", style(summary.plan_restricted).yellow());
    println!("   Failed:           {}", style(summary.failed).red());
    println!("   Volume added:     {:.6} USD", summary.volume_added);
    println!(
        "   API calls:        {} ({} retries)",
        summary.alert.api_call_count, summary.alert.retry_count
    );
    println!("   Elapsed:          {:.1}s", elapsed.as_secs_f64());

    if summary.alert.alert {
        println!();
        println!("{}", style("⚠️  ALERT RAISED").red().bold());
        for reason in &summary.alert.reasons {
            println!("   • {}", reason);
        }
    } else if !summary.alert.reasons.is_empty() {
        println!();
        println!("{}", style("Notes:").yellow());
        for reason in &summary.alert.reasons {
            println!("   • {}", reason);
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config file {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

async fn run(config: Config, options: RunOptions) -> Result<()> {
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file");
        return Err(e);
    }
    config.print_summary();

    let transport = ReqwestTransport::new(Duration::from_secs(config.http_timeout_secs))
        .wrap_err("failed to build HTTP client")?;
    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(transport));

    let started = Instant::now();
    let summary = orchestrator
        .run(&options)
        .await
        .wrap_err("run aborted on store failure")?;
    info!(
        "Run complete: {} accumulated, {} failed, alert={}",
        summary.accumulated, summary.failed, summary.alert.alert
    );
    print_summary(&summary, started.elapsed());
    Ok(())
}

fn show_report(config: &Config) -> Result<()> {
    let files = store::DataFiles::new(&config.data_dir);
    let book = PoolBook::load(&files.pools)?;
    let rows = report::build_report(&book, &config.default_chain.to_string());
    report::print_report(&rows);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pool_volume=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run { no_jitter, pools } => {
            print_banner();
            let options = RunOptions {
                apply_jitter: !no_jitter,
                only_pools: pools,
            };
            run(config, options).await
        }
        Command::Report => show_report(&config),
    }
}
