//! Product rows keyed by SKU, the product natural key.
//!
//! All provider-sourced writes go through `bulk_upsert`; deletes only
//! through the safety-gated cleanup in `reconcile::products`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{error, info};

use crate::store::db::{Db, UpsertCounts};

// Keeps each statement well under the Postgres bind limit.
const UPSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ProductUpsert {
    pub sku: String,
    pub provider: String,
    pub provider_product_id: Option<String>,
    pub title: Option<String>,
    pub vendor: Option<String>,
    pub price_minor: Option<i64>,
    pub currency: Option<String>,
    pub quantity: i32,
    pub status: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

/// Chunked idempotent upsert by SKU. `committed_quantity` is seeded from the
/// incoming quantity on insert and never touched again. A failed chunk is
/// logged and skipped so it doesn't block its siblings.
pub async fn bulk_upsert(db: &Db, rows: &[ProductUpsert]) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    if rows.is_empty() {
        return Ok(counts);
    }

    // One row per SKU within a statement, or ON CONFLICT refuses to touch
    // the same row twice. Last occurrence wins.
    use std::collections::HashMap;
    let mut latest: HashMap<&str, &ProductUpsert> = HashMap::new();
    for r in rows {
        latest.insert(r.sku.as_str(), r);
    }
    let uniques: Vec<&ProductUpsert> = latest.into_values().collect();

    for chunk in uniques.chunks(UPSERT_CHUNK) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO products (sku, provider, provider_product_id, title, vendor, \
             price_minor, currency, quantity, committed_quantity, status, last_synced_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(&r.sku)
                .push_bind(&r.provider)
                .push_bind(&r.provider_product_id)
                .push_bind(&r.title)
                .push_bind(&r.vendor)
                .push_bind(r.price_minor)
                .push_bind(&r.currency)
                .push_bind(r.quantity)
                .push_bind(r.quantity) // committed_quantity baseline, insert-only
                .push_bind(&r.status)
                .push_bind(r.last_synced_at);
        });
        qb.push(
            " ON CONFLICT (sku) DO UPDATE SET \
               provider = EXCLUDED.provider, \
               provider_product_id = EXCLUDED.provider_product_id, \
               title = EXCLUDED.title, \
               vendor = EXCLUDED.vendor, \
               price_minor = EXCLUDED.price_minor, \
               currency = EXCLUDED.currency, \
               quantity = EXCLUDED.quantity, \
               status = EXCLUDED.status, \
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
                error!(chunk_len = chunk.len(), error = %e, "product upsert chunk failed; continuing");
            }
        }
    }

    info!(
        inserted = counts.inserted,
        updated = counts.updated,
        total = rows.len(),
        "product upsert complete"
    );
    Ok(counts)
}

/// All SKUs the store currently holds for one provider.
pub async fn provider_skus(db: &Db, provider: &str) -> Result<Vec<String>> {
    let skus = sqlx::query_scalar("SELECT sku FROM products WHERE provider = $1")
        .bind(provider)
        .fetch_all(&db.pool)
        .await?;
    Ok(skus)
}

pub async fn delete_skus(db: &Db, skus: &[String]) -> Result<u64> {
    if skus.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query("DELETE FROM products WHERE sku = ANY($1)")
        .bind(skus)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
}
