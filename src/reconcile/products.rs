//! Product normalization and the safety-gated cleanup pass.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::providers::shopify::bulk::AssembledProduct;
use crate::reconcile::{etsy_money_minor, v_i64, v_str};
use crate::store::db::Db;
use crate::store::products::{self, ProductUpsert};
use crate::sync::error::SyncError;

/// Fraction of a provider's local population the cleanup pass may delete
/// before it refuses to act.
pub const CLEANUP_MAX_RATIO: f64 = 0.5;

/// Etsy listing → one row per SKU (a listing with no SKUs falls back to a
/// synthetic `etsy-<listing_id>` key so it still has exactly one row).
pub fn normalize_etsy_listing(
    v: &Value,
    now: DateTime<Utc>,
) -> Result<Vec<ProductUpsert>, SyncError> {
    let listing_id = v_i64(v, "listing_id")
        .ok_or_else(|| SyncError::ProviderData("listing without listing_id".into()))?;

    let (price_minor, currency) = v
        .get("price")
        .and_then(etsy_money_minor)
        .map(|(m, c)| (Some(m), Some(c)))
        .unwrap_or((None, None));
    let quantity = v_i64(v, "quantity").unwrap_or(0) as i32;
    let title = v_str(v, "title").map(|s| s.to_string());
    let status = v_str(v, "state").map(|s| s.to_string());

    let mut skus: Vec<String> = v
        .get("skus")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    skus.sort();
    skus.dedup();
    if skus.is_empty() {
        skus.push(format!("etsy-{listing_id}"));
    }

    Ok(skus
        .into_iter()
        .map(|sku| ProductUpsert {
            sku,
            provider: "etsy".to_string(),
            provider_product_id: Some(listing_id.to_string()),
            title: title.clone(),
            vendor: None,
            price_minor,
            currency: currency.clone(),
            quantity,
            status: status.clone(),
            last_synced_at: now,
        })
        .collect())
}

/// Assembled Shopify bulk product → one row per variant SKU. Parents the
/// allow-list marked irrelevant produce no rows.
pub fn from_bulk_product(p: &AssembledProduct, now: DateTime<Utc>) -> Vec<ProductUpsert> {
    if !p.relevant {
        return Vec::new();
    }
    p.variants
        .iter()
        .map(|var| ProductUpsert {
            sku: var
                .sku
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("shopify-{}", var.variant_id)),
            provider: "shopify".to_string(),
            provider_product_id: Some(p.product_id.clone()),
            title: p.title.clone(),
            vendor: p.vendor.clone(),
            price_minor: var.price_minor,
            currency: None,
            quantity: var.quantity.unwrap_or(0),
            status: p.status.clone(),
            last_synced_at: now,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub deleted: u64,
    pub candidates: usize,
    pub population: usize,
    pub aborted: bool,
}

/// Pure decision: may `candidates` of `population` local records be deleted?
pub fn cleanup_allowed(candidates: usize, population: usize) -> bool {
    if candidates == 0 {
        return true;
    }
    if population == 0 || candidates == population {
        return false;
    }
    (candidates as f64 / population as f64) <= CLEANUP_MAX_RATIO
}

/// Delete local products for `provider` whose SKU did not survive the
/// allow-list filter this sync (`kept` is the surviving provider
/// population). Refuses to act when the deletion ratio is suspicious.
pub async fn run_cleanup(
    db: &Db,
    provider: &str,
    kept: &HashSet<String>,
) -> anyhow::Result<CleanupOutcome> {
    let local = products::provider_skus(db, provider).await?;
    let population = local.len();
    let candidates: Vec<String> = local.into_iter().filter(|sku| !kept.contains(sku)).collect();

    if candidates.is_empty() {
        return Ok(CleanupOutcome {
            deleted: 0,
            candidates: 0,
            population,
            aborted: false,
        });
    }

    if !cleanup_allowed(candidates.len(), population) {
        let err = SyncError::SafetyAbort {
            would_delete: candidates.len(),
            population,
        };
        warn!(provider, %err, "cleanup safety gate tripped; nothing deleted");
        return Ok(CleanupOutcome {
            deleted: 0,
            candidates: candidates.len(),
            population,
            aborted: true,
        });
    }

    let deleted = products::delete_skus(db, &candidates).await?;
    info!(provider, deleted, population, "cleanup pass removed filtered products");
    Ok(CleanupOutcome {
        deleted,
        candidates: candidates.len(),
        population,
        aborted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listing_with_multiple_skus_fans_out() {
        let rows = normalize_etsy_listing(
            &json!({
                "listing_id": 77,
                "title": "Hitch Pin",
                "state": "active",
                "quantity": 12,
                "price": {"amount": 1250, "divisor": 100, "currency_code": "USD"},
                "skus": ["HP-1", "HP-2", "HP-1"]
            }),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sku, "HP-1");
        assert_eq!(rows[1].sku, "HP-2");
        assert!(rows.iter().all(|r| r.provider_product_id.as_deref() == Some("77")));
        assert!(rows.iter().all(|r| r.price_minor == Some(1250)));
    }

    #[test]
    fn listing_without_skus_gets_synthetic_key() {
        let rows =
            normalize_etsy_listing(&json!({"listing_id": 8, "quantity": 1}), Utc::now()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sku, "etsy-8");
    }

    #[test]
    fn cleanup_gate_blocks_majority_and_total_deletes() {
        // 60 of 100 matched records would go: refuse.
        assert!(!cleanup_allowed(60, 100));
        // Literally all of them: refuse even below any ratio check.
        assert!(!cleanup_allowed(5, 5));
        // A sane minority passes.
        assert!(cleanup_allowed(10, 100));
        assert!(cleanup_allowed(50, 100));
        // Nothing to delete is trivially allowed.
        assert!(cleanup_allowed(0, 0));
    }

    #[test]
    fn identical_listing_normalizes_identically() {
        let payload = json!({
            "listing_id": 5,
            "title": "Bolt",
            "quantity": 3,
            "skus": ["B-1"],
            "price": {"amount": 500, "divisor": 100, "currency_code": "USD"}
        });
        let now = Utc::now();
        assert_eq!(
            normalize_etsy_listing(&payload, now).unwrap(),
            normalize_etsy_listing(&payload, now).unwrap()
        );
    }
}
