// Stale-order backfill worker.
// Usage:
//   DATABASE_URL=postgres://... backfill --batch=50 --concurrency=4 --maxMisses=10
//   backfill --dry-run --provider=etsy
//
// Selects open orders whose last provider sync is older than the staleness
// window, refetches authoritative state, and upserts status transitions.
// Exits 0 on normal completion, non-zero on fatal setup errors.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use marketsync::providers::etsy::EtsyProvider;
use marketsync::providers::shopify::ShopifyProvider;
use marketsync::store::db::Db;
use marketsync::sync::backfill::{
    self, BackfillConfig, DEFAULT_BATCH, DEFAULT_CONCURRENCY, DEFAULT_MAX_MISSES,
    DEFAULT_STALE_HOURS,
};
use marketsync::sync::Marketplace;
use marketsync::util::env::{db_url, env_parse, init_env};
use marketsync::util::tracing::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Refresh stale local orders from their marketplaces")]
struct Args {
    /// Prepare and log every decision without writing to the store
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Orders selected per batch
    #[arg(long, default_value_t = DEFAULT_BATCH)]
    batch: i64,

    /// Concurrent provider fetches within a batch
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Consecutive still-pending orders before a pass halts
    #[arg(long = "maxMisses", default_value_t = DEFAULT_MAX_MISSES)]
    max_misses: u32,

    /// Only this marketplace (etsy|shopify); default is both
    #[arg(long)]
    provider: Option<String>,

    /// Staleness window in hours
    #[arg(long = "stale-hours", default_value_t = DEFAULT_STALE_HOURS)]
    stale_hours: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info,sqlx=warn")?;
    let args = Args::parse();

    let markets = match &args.provider {
        Some(p) => vec![p.parse::<Marketplace>()?],
        None => vec![Marketplace::Etsy, Marketplace::Shopify],
    };

    let db = Db::connect(&db_url()?, env_parse("DB_MAX_CONNECTIONS", 5)).await?;
    let cfg = BackfillConfig {
        batch: args.batch,
        concurrency: args.concurrency,
        max_misses: args.max_misses,
        stale_hours: args.stale_hours,
        dry_run: args.dry_run,
    };

    for market in markets {
        let summary = match market {
            Marketplace::Etsy => {
                let provider = EtsyProvider::from_env(db.clone())?;
                backfill::run(&db, &provider, &cfg).await?
            }
            Marketplace::Shopify => {
                let provider = ShopifyProvider::from_env()?;
                backfill::run(&db, &provider, &cfg).await?
            }
        };
        info!(
            marketplace = %market,
            selected = summary.selected,
            fetched = summary.fetched,
            fetch_errors = summary.fetch_errors,
            inserted = summary.written.inserted,
            updated = summary.written.updated,
            halted_by_misses = summary.halted_by_misses,
            dry_run = cfg.dry_run,
            "backfill summary"
        );
    }

    Ok(())
}
