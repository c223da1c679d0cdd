//! Etsy v3 client and sync entry points.
//!
//! Receipts and listings are offset-paginated with an authoritative `count`
//! on every page. Etsy enforces a hard per-second ceiling on top of its
//! concurrency limit, so this provider's gate carries minimum inter-request
//! spacing as well.

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::providers::etsy::auth::EtsyAuth;
use crate::reconcile::{orders as order_rules, products as product_rules};
use crate::store::db::Db;
use crate::store::settings::set_last_sync;
use crate::store::{orders, products};
use crate::sync::error::SyncError;
use crate::sync::gate::{RequestGate, DEFAULT_MAX_CONCURRENT};
use crate::sync::offset::{self, OffsetPage};
use crate::sync::retry::{AuthSession, RetryPolicy};
use crate::sync::status::StatusRegistry;
use crate::util::env::{env_opt, env_parse, env_req};

const DEFAULT_BASE_URL: &str = "https://openapi.etsy.com/v3/application";
const DEFAULT_MIN_SPACING_MS: u64 = 100;
const PAGE_SIZE: u32 = 100;
const DEFAULT_SYNC_DAYS: i64 = 90;

#[derive(Clone)]
pub struct EtsyProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    shop_id: String,
    auth: Arc<EtsyAuth>,
    gate: RequestGate,
    retry: RetryPolicy,
}

/// `{count, results}` page envelope shared by receipts and listings.
fn parse_offset_page(v: Value) -> Result<OffsetPage<Value>, SyncError> {
    let items = match v.get("results") {
        Some(Value::Array(arr)) => arr.clone(),
        _ => {
            return Err(SyncError::ProviderData(
                "etsy page missing 'results' array".into(),
            ))
        }
    };
    let total = v.get("count").and_then(|c| c.as_u64());
    Ok(OffsetPage { items, total })
}

impl EtsyProvider {
    pub fn new(
        db: Db,
        base_url: String,
        api_key: String,
        shop_id: String,
        max_concurrent: usize,
        min_spacing: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(SyncError::from)?;
        let auth = Arc::new(EtsyAuth::new(db, api_key.clone())?);
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            shop_id,
            auth,
            gate: RequestGate::new("etsy", max_concurrent).with_min_spacing(min_spacing),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_env(db: Db) -> anyhow::Result<Self> {
        let api_key = env_req("ETSY_KEYSTRING")?;
        let shop_id = env_req("ETSY_SHOP_ID")?;
        let base_url = env_opt("ETSY_API_BASE").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let max_concurrent = env_parse("ETSY_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT);
        let spacing = Duration::from_millis(env_parse("ETSY_MIN_SPACING_MS", DEFAULT_MIN_SPACING_MS));
        Ok(Self::new(db, base_url, api_key, shop_id, max_concurrent, spacing)?)
    }

    /// One gated, retried, authenticated GET returning the JSON body.
    async fn get_value(&self, label: &str, path_and_query: &str) -> Result<Value, SyncError> {
        let url = format!("{}/{}", self.base_url, path_and_query);
        let resp = self
            .retry
            .execute(label, Some(self.auth.as_ref()), || {
                let url = url.clone();
                async move {
                    let token = self
                        .auth
                        .access_token()
                        .await?
                        .ok_or_else(|| SyncError::Auth("no Etsy access token stored".into()))?;
                    self.gate
                        .run(label, || async {
                            Ok(self
                                .http
                                .get(&url)
                                .header("x-api-key", &self.api_key)
                                .bearer_auth(&token)
                                .header("Accept", "application/json")
                                .send()
                                .await?)
                        })
                        .await
                }
            })
            .await?;
        resp.json::<Value>()
            .await
            .map_err(|e| SyncError::ProviderData(format!("{label}: body decode failed: {e}")))
    }

    pub async fn get_receipts(
        &self,
        limit: u32,
        offset: u64,
        min_created: i64,
    ) -> Result<OffsetPage<Value>, SyncError> {
        let path = format!(
            "shops/{}/receipts?limit={limit}&offset={offset}&min_created={min_created}",
            self.shop_id
        );
        parse_offset_page(self.get_value("etsy receipts", &path).await?)
    }

    pub async fn get_listings(&self, limit: u32, offset: u64) -> Result<OffsetPage<Value>, SyncError> {
        let path = format!(
            "shops/{}/listings/active?limit={limit}&offset={offset}",
            self.shop_id
        );
        parse_offset_page(self.get_value("etsy listings", &path).await?)
    }

    /// Authoritative state of one receipt, for the backfill driver.
    pub async fn get_receipt(&self, receipt_id: &str) -> Result<Value, SyncError> {
        let path = format!("shops/{}/receipts/{receipt_id}", self.shop_id);
        self.get_value("etsy receipt", &path).await
    }

    /// Pull the receipt horizon and reconcile orders.
    pub async fn sync_orders(
        &self,
        db: &Db,
        registry: &StatusRegistry,
        sync_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let sync_days = crate::store::settings::get_setting::<i64>(db, "etsy_sync_days")
            .await?
            .unwrap_or(DEFAULT_SYNC_DAYS);
        let min_created = (now - chrono::Duration::days(sync_days)).timestamp();

        registry.update(sync_id, |op| {
            op.phase = "fetching".to_string();
            op.progress = 5;
        });

        let provider = self.clone();
        let reg = registry.clone();
        let sid = sync_id.to_string();
        let outcome = offset::fetch_all(
            "etsy receipts",
            env_parse("ETSY_PAGE_SIZE", PAGE_SIZE),
            env_parse("ETSY_FETCH_WORKERS", offset::DEFAULT_WORKERS),
            move |limit, page_offset| {
                let p = provider.clone();
                async move { p.get_receipts(limit, page_offset, min_created).await }
            },
            move |fetched, total| {
                reg.update(&sid, |op| {
                    op.processed = fetched as i64;
                    op.total_estimate = Some(total as i64);
                    op.progress = (5 + (fetched as u64 * 75 / total.max(1)).min(75)) as u8;
                });
            },
        )
        .await?;

        let mut rows = Vec::with_capacity(outcome.items.len());
        let mut skipped = 0i64;
        for v in &outcome.items {
            match order_rules::normalize_etsy_receipt(v, now) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed receipt");
                }
            }
        }

        registry.update(sync_id, |op| {
            op.phase = "reconciling".to_string();
            op.progress = 85;
        });
        let counts = orders::bulk_upsert(db, &rows).await?;
        let failed_pages = outcome.failed_offsets.len() as i64;

        registry.update(sync_id, |op| {
            op.counts
                .insert("orders_added".to_string(), counts.inserted as i64);
            op.counts
                .insert("orders_updated".to_string(), counts.updated as i64);
            op.counts.insert("records_skipped".to_string(), skipped);
            op.counts.insert("pages_failed".to_string(), failed_pages);
            op.processed = rows.len() as i64;
            op.progress = 95;
        });

        set_last_sync(db, "etsy", "orders", now).await?;
        info!(
            fetched = outcome.items.len(),
            upserted = rows.len(),
            skipped,
            failed_pages,
            "etsy order sync reconciled"
        );
        Ok(())
    }

    /// Pull active listings and reconcile products.
    pub async fn sync_products(
        &self,
        db: &Db,
        registry: &StatusRegistry,
        sync_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        registry.update(sync_id, |op| {
            op.phase = "fetching".to_string();
            op.progress = 5;
        });

        let provider = self.clone();
        let reg = registry.clone();
        let sid = sync_id.to_string();
        let outcome = offset::fetch_all(
            "etsy listings",
            env_parse("ETSY_PAGE_SIZE", PAGE_SIZE),
            env_parse("ETSY_FETCH_WORKERS", offset::DEFAULT_WORKERS),
            move |limit, page_offset| {
                let p = provider.clone();
                async move { p.get_listings(limit, page_offset).await }
            },
            move |fetched, total| {
                reg.update(&sid, |op| {
                    op.processed = fetched as i64;
                    op.total_estimate = Some(total as i64);
                    op.progress = (5 + (fetched as u64 * 75 / total.max(1)).min(75)) as u8;
                });
            },
        )
        .await?;

        let mut rows = Vec::new();
        let mut skipped = 0i64;
        for v in &outcome.items {
            match product_rules::normalize_etsy_listing(v, now) {
                Ok(mut fanned) => rows.append(&mut fanned),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed listing");
                }
            }
        }

        registry.update(sync_id, |op| {
            op.phase = "reconciling".to_string();
            op.progress = 85;
        });
        let counts = products::bulk_upsert(db, &rows).await?;
        let failed_pages = outcome.failed_offsets.len() as i64;

        registry.update(sync_id, |op| {
            op.counts
                .insert("products_added".to_string(), counts.inserted as i64);
            op.counts
                .insert("products_updated".to_string(), counts.updated as i64);
            op.counts.insert("records_skipped".to_string(), skipped);
            op.counts.insert("pages_failed".to_string(), failed_pages);
            op.processed = rows.len() as i64;
            op.progress = 95;
        });

        set_last_sync(db, "etsy", "products", now).await?;
        info!(
            listings = outcome.items.len(),
            rows = rows.len(),
            skipped,
            failed_pages,
            "etsy product sync reconciled"
        );
        Ok(())
    }
}
