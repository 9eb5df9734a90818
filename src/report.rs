//! Read model over the pool document, for `pool-volume report`

use chrono::{DateTime, SecondsFormat, Utc};
use console::style;

use crate::store::PoolBook;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub address: String,
    pub chain: String,
    /// `None` when the pool has never been reconciled
    pub total_usd: Option<f64>,
    pub last_updated: Option<String>,
}

impl ReportRow {
    pub fn total_display(&self) -> String {
        match self.total_usd {
            Some(total) => format!("{:.2}", total),
            None => "N/A".to_string(),
        }
    }
}

/// One row per pool, in document order
pub fn build_report(book: &PoolBook, default_chain: &str) -> Vec<ReportRow> {
    book.iter()
        .map(|(address, pool)| ReportRow {
            address: address.clone(),
            chain: pool.chain.clone().unwrap_or_else(|| default_chain.to_string()),
            total_usd: pool.total_usd.filter(|t| t.is_finite()),
            last_updated: pool
                .last_updated_secs()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        })
        .collect()
}

pub fn print_report(rows: &[ReportRow]) {
    println!();
    println!(
        "{}",
        style("═══ POOL VOLUME ═══").cyan().bold()
    );
    if rows.is_empty() {
        println!("   No pools configured");
        return;
    }

    println!(
        "   {:<44} {:<10} {:>18}  {}",
        style("POOL").bold(),
        style("CHAIN").bold(),
        style("TOTAL (USD)").bold(),
        style("LAST UPDATED").bold()
    );
    for row in rows {
        let total = match row.total_usd {
            Some(_) => style(row.total_display()).green(),
            None => style(row.total_display()).dim(),
        };
        println!(
            "   {:<44} {:<10} {:>18}  {}",
            row.address,
            row.chain,
            total,
            row.last_updated.as_deref().unwrap_or("-")
        );
    }

    let known: Vec<f64> = rows.iter().filter_map(|r| r.total_usd).collect();
    println!();
    println!(
        "   {} pool(s), {} with volume, combined {:.2} USD",
        rows.len(),
        known.len(),
        known.iter().sum::<f64>()
    );
}
