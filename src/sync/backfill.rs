//! Stale-order backfill driver.
//!
//! Orders the marketplaces consider settled don't show up in the regular
//! order feeds forever, so local rows go stale. This driver batches through
//! open orders whose last provider sync is older than the staleness window,
//! refetches authoritative state through the gate/retry stack, and upserts
//! the result. The feed is date-sorted oldest-first: once a run of
//! still-pending orders (misses) exceeds the threshold we've reached the
//! still-pending head and stop the pass early.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use crate::reconcile::orders::{
    derived_status_of, normalize_etsy_receipt, normalize_shopify_order,
};
use crate::store::db::{Db, UpsertCounts};
use crate::store::orders::{self, OrderUpsert, StaleOrder};
use crate::sync::error::SyncError;

pub const DEFAULT_BATCH: i64 = 50;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_MISSES: u32 = 10;
pub const DEFAULT_STALE_HOURS: i64 = 24;

/// Authoritative single-order fetch, one impl per marketplace.
#[async_trait]
pub trait OrderFetcher: Send + Sync {
    fn provider(&self) -> &'static str;
    async fn fetch_order(&self, provider_order_id: &str) -> Result<Value, SyncError>;
}

#[async_trait]
impl OrderFetcher for crate::providers::etsy::EtsyProvider {
    fn provider(&self) -> &'static str {
        "etsy"
    }
    async fn fetch_order(&self, provider_order_id: &str) -> Result<Value, SyncError> {
        self.get_receipt(provider_order_id).await
    }
}

#[async_trait]
impl OrderFetcher for crate::providers::shopify::ShopifyProvider {
    fn provider(&self) -> &'static str {
        "shopify"
    }
    async fn fetch_order(&self, provider_order_id: &str) -> Result<Value, SyncError> {
        self.get_order(provider_order_id).await
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub batch: i64,
    pub concurrency: usize,
    pub max_misses: u32,
    pub stale_hours: i64,
    pub dry_run: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            concurrency: DEFAULT_CONCURRENCY,
            max_misses: DEFAULT_MAX_MISSES,
            stale_hours: DEFAULT_STALE_HOURS,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub prepared: Vec<OrderUpsert>,
    pub fetched: usize,
    pub fetch_errors: usize,
    pub halted: bool,
}

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub selected: usize,
    pub fetched: usize,
    pub fetch_errors: usize,
    pub written: UpsertCounts,
    pub batches: usize,
    pub halted_by_misses: bool,
}

/// Refetch one batch and prepare upserts, consuming results in feed order so
/// the consecutive-miss streak is well-defined under concurrency. The streak
/// carries across batches via `miss_streak`; exceeding `max_misses` halts —
/// the rest of the batch is never fetched.
pub async fn process_batch(
    fetcher: &dyn OrderFetcher,
    batch: &[StaleOrder],
    concurrency: usize,
    max_misses: u32,
    miss_streak: &mut u32,
) -> BatchOutcome {
    let now = Utc::now();
    let provider = fetcher.provider();
    let mut outcome = BatchOutcome::default();

    let mut results = futures::stream::iter(batch.iter().map(|order| async move {
        let fetched = fetcher.fetch_order(&order.provider_order_id).await;
        (order, fetched)
    }))
    .buffered(concurrency.max(1));

    while let Some((order, fetched)) = results.next().await {
        let raw = match fetched {
            Ok(v) => {
                outcome.fetched += 1;
                v
            }
            Err(e) => {
                outcome.fetch_errors += 1;
                warn!(order_key = %order.order_key, error = %e, "backfill fetch failed; skipping");
                continue;
            }
        };
        let row = match provider {
            "etsy" => normalize_etsy_receipt(&raw, now),
            _ => normalize_shopify_order(&raw, now),
        };
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                outcome.fetch_errors += 1;
                warn!(order_key = %order.order_key, error = %e, "backfill payload malformed; skipping");
                continue;
            }
        };

        if derived_status_of(&row).is_resolved() {
            *miss_streak = 0;
        } else {
            *miss_streak += 1;
        }
        if row.status != order.status {
            info!(
                order_key = %row.order_key,
                from = %order.status,
                to = %row.status,
                "backfill status change"
            );
        }
        outcome.prepared.push(row);

        if *miss_streak > max_misses {
            info!(
                miss_streak = *miss_streak,
                max_misses, "consecutive still-pending orders; halting pass"
            );
            outcome.halted = true;
            break;
        }
    }
    outcome
}

/// Run the driver for one provider until a stop condition fires.
pub async fn run(db: &Db, fetcher: &dyn OrderFetcher, cfg: &BackfillConfig) -> anyhow::Result<BackfillSummary> {
    let provider = fetcher.provider();
    let cutoff = Utc::now() - chrono::Duration::hours(cfg.stale_hours);
    let mut summary = BackfillSummary::default();
    let mut miss_streak = 0u32;
    // Dry-run never bumps last_synced_at, so forward progress comes from an
    // in-memory visited set instead.
    let mut visited: HashSet<String> = HashSet::new();

    info!(provider, ?cfg, "backfill starting");
    loop {
        let exclude: Vec<String> = visited.iter().cloned().collect();
        let batch = orders::select_stale(db, provider, cutoff, cfg.batch, &exclude).await?;
        if batch.is_empty() {
            info!(provider, "no stale orders selected; stopping");
            break;
        }
        summary.selected += batch.len();
        summary.batches += 1;

        let outcome =
            process_batch(fetcher, &batch, cfg.concurrency, cfg.max_misses, &mut miss_streak).await;
        summary.fetched += outcome.fetched;
        summary.fetch_errors += outcome.fetch_errors;

        if outcome.prepared.is_empty() {
            info!(provider, "no updates prepared; stopping");
            break;
        }

        if cfg.dry_run {
            for row in &outcome.prepared {
                info!(order_key = %row.order_key, status = %row.status, "dry-run: would upsert");
            }
            visited.extend(batch.iter().map(|o| o.order_key.clone()));
        } else {
            summary.written.absorb(orders::bulk_upsert(db, &outcome.prepared).await?);
        }

        if outcome.halted {
            summary.halted_by_misses = true;
            break;
        }
    }

    info!(provider, ?summary, "backfill finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Synthetic feed: order ids map to canned Shopify payloads.
    struct FeedFetcher {
        resolved_prefix: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderFetcher for FeedFetcher {
        fn provider(&self) -> &'static str {
            "shopify"
        }
        async fn fetch_order(&self, provider_order_id: &str) -> Result<Value, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let idx: usize = provider_order_id.parse().unwrap();
            if idx < self.resolved_prefix {
                Ok(json!({
                    "id": idx,
                    "fulfillment_status": "fulfilled",
                    "fulfillments": [{"created_at": "2024-04-01T00:00:00Z"}]
                }))
            } else {
                Ok(json!({"id": idx, "fulfillment_status": null}))
            }
        }
    }

    fn stale(idx: usize) -> StaleOrder {
        StaleOrder {
            order_key: format!("shopify:{idx}"),
            provider: "shopify".to_string(),
            provider_order_id: idx.to_string(),
            status: "pending".to_string(),
        }
    }

    #[tokio::test]
    async fn miss_streak_halts_before_the_seventh_pending_order() {
        // Entirely still-pending feed, maxMisses = 5: the 6th consecutive
        // pending order trips the halt; orders 7+ are never fetched.
        let fetcher = FeedFetcher {
            resolved_prefix: 0,
            calls: AtomicUsize::new(0),
        };
        let batch: Vec<StaleOrder> = (0..20).map(stale).collect();
        let mut streak = 0;
        let outcome = process_batch(&fetcher, &batch, 1, 5, &mut streak).await;

        assert!(outcome.halted);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
        assert_eq!(outcome.prepared.len(), 6);
        assert_eq!(streak, 6);
    }

    #[tokio::test]
    async fn resolved_orders_reset_the_streak() {
        // 4 resolved then pending: the streak only starts at the pending head.
        let fetcher = FeedFetcher {
            resolved_prefix: 4,
            calls: AtomicUsize::new(0),
        };
        let batch: Vec<StaleOrder> = (0..12).map(stale).collect();
        let mut streak = 0;
        let outcome = process_batch(&fetcher, &batch, 1, 5, &mut streak).await;

        assert!(outcome.halted);
        // 4 resolved + 6 pending before the halt.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 10);
        assert_eq!(outcome.prepared.len(), 10);
        assert_eq!(
            outcome
                .prepared
                .iter()
                .filter(|r| r.status == "shipped")
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn streak_survives_batch_boundaries() {
        let fetcher = FeedFetcher {
            resolved_prefix: 0,
            calls: AtomicUsize::new(0),
        };
        let mut streak = 0;
        let first: Vec<StaleOrder> = (0..3).map(stale).collect();
        let outcome = process_batch(&fetcher, &first, 1, 5, &mut streak).await;
        assert!(!outcome.halted);
        assert_eq!(streak, 3);

        let second: Vec<StaleOrder> = (3..9).map(stale).collect();
        let outcome = process_batch(&fetcher, &second, 1, 5, &mut streak).await;
        assert!(outcome.halted);
        // Only 3 more fetches needed to cross the threshold.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    }

    struct FailingFetcher;

    #[async_trait]
    impl OrderFetcher for FailingFetcher {
        fn provider(&self) -> &'static str {
            "shopify"
        }
        async fn fetch_order(&self, _id: &str) -> Result<Value, SyncError> {
            Err(SyncError::Http {
                status: 500,
                body: "".into(),
            })
        }
    }

    #[tokio::test]
    async fn fetch_errors_skip_without_touching_the_streak() {
        let batch: Vec<StaleOrder> = (0..4).map(stale).collect();
        let mut streak = 0;
        let outcome = process_batch(&FailingFetcher, &batch, 2, 5, &mut streak).await;
        assert!(outcome.prepared.is_empty());
        assert_eq!(outcome.fetch_errors, 4);
        assert_eq!(streak, 0);
        assert!(!outcome.halted);
    }

    #[tokio::test]
    async fn prepared_rows_refresh_even_pending_orders() {
        // Pending orders still get an upsert so a live run bumps their
        // last_synced_at and the next pass moves on.
        let fetcher = FeedFetcher {
            resolved_prefix: 1,
            calls: AtomicUsize::new(0),
        };
        let batch: Vec<StaleOrder> = (0..3).map(stale).collect();
        let mut streak = 0;
        let outcome = process_batch(&fetcher, &batch, 1, 10, &mut streak).await;
        assert_eq!(outcome.prepared.len(), 3);
        assert_eq!(outcome.prepared[0].status, "shipped");
        assert_eq!(outcome.prepared[1].status, "pending");
    }
}
