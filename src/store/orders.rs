//! Order rows keyed by provider-prefixed id (`etsy:123`, `shopify:456`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, QueryBuilder, Row};
use tracing::{error, info};

use crate::store::db::{Db, UpsertCounts};

const UPSERT_CHUNK: usize = 1000;

pub fn order_key(provider: &str, provider_order_id: &str) -> String {
    format!("{provider}:{provider_order_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpsert {
    pub order_key: String,
    pub provider: String,
    pub provider_order_id: String,
    pub status: String,
    pub buyer_name: Option<String>,
    pub total_minor: Option<i64>,
    pub currency: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
}

/// A stale order as selected for the backfill driver.
#[derive(Debug, Clone, FromRow)]
pub struct StaleOrder {
    pub order_key: String,
    pub provider: String,
    pub provider_order_id: String,
    pub status: String,
}

/// Chunked idempotent upsert by order key. A failed chunk is logged and
/// skipped so it doesn't block its siblings.
pub async fn bulk_upsert(db: &Db, rows: &[OrderUpsert]) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    if rows.is_empty() {
        return Ok(counts);
    }

    // One row per key within a statement, or ON CONFLICT refuses to touch
    // the same row twice. Last occurrence wins.
    use std::collections::HashMap;
    let mut latest: HashMap<&str, &OrderUpsert> = HashMap::new();
    for r in rows {
        latest.insert(r.order_key.as_str(), r);
    }
    let uniques: Vec<&OrderUpsert> = latest.into_values().collect();

    for chunk in uniques.chunks(UPSERT_CHUNK) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO orders (order_key, provider, provider_order_id, status, buyer_name, \
             total_minor, currency, placed_at, shipped_at, cancelled_at, last_synced_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(&r.order_key)
                .push_bind(&r.provider)
                .push_bind(&r.provider_order_id)
                .push_bind(&r.status)
                .push_bind(&r.buyer_name)
                .push_bind(r.total_minor)
                .push_bind(&r.currency)
                .push_bind(r.placed_at)
                .push_bind(r.shipped_at)
                .push_bind(r.cancelled_at)
                .push_bind(r.last_synced_at);
        });
        qb.push(
            " ON CONFLICT (order_key) DO UPDATE SET \
               status = EXCLUDED.status, \
               buyer_name = EXCLUDED.buyer_name, \
               total_minor = EXCLUDED.total_minor, \
               currency = EXCLUDED.currency, \
               placed_at = EXCLUDED.placed_at, \
               shipped_at = EXCLUDED.shipped_at, \
               cancelled_at = EXCLUDED.cancelled_at, \
               last_synced_at = EXCLUDED.last_synced_at, \
               updated_at = now() \
             RETURNING (xmax = 0) AS inserted",
        );

        match qb.build().fetch_all(&db.pool).await {
            Ok(rows) => {
                for row in rows {
                    if row.try_get::<bool, _>("inserted")? {
                        counts.inserted += 1;
                    } else {
                        counts.updated += 1;
                    }
                }
            }
            Err(e) => {
                error!(chunk_len = chunk.len(), error = %e, "order upsert chunk failed; continuing");
            }
        }
    }

    info!(
        inserted = counts.inserted,
        updated = counts.updated,
        total = rows.len(),
        "order upsert complete"
    );
    Ok(counts)
}

/// Select up to `batch` open orders whose last provider sync is older than
/// the cutoff (or absent), oldest placed first. `exclude` carries the
/// dry-run visited set so that pass still makes forward progress.
pub async fn select_stale(
    db: &Db,
    provider: &str,
    cutoff: DateTime<Utc>,
    batch: i64,
    exclude: &[String],
) -> Result<Vec<StaleOrder>> {
    let rows = sqlx::query_as::<_, StaleOrder>(
        "SELECT order_key, provider, provider_order_id, status
         FROM orders
         WHERE provider = $1
           AND status NOT IN ('shipped', 'cancelled')
           AND (last_synced_at IS NULL OR last_synced_at < $2)
           AND NOT (order_key = ANY($3))
         ORDER BY placed_at ASC NULLS FIRST
         LIMIT $4",
    )
    .bind(provider)
    .bind(cutoff)
    .bind(exclude)
    .bind(batch)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}
