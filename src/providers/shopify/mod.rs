//! Shopify admin client and sync entry points.
//!
//! Orders come from the REST API with since_id cursor paging; products come
//! from the asynchronous GraphQL bulk export. The admin token is static, so
//! no refresh hook is wired into the retry policy here.

pub mod bulk;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::providers::shopify::bulk::{BulkCatalog, BulkJobStatus};
use crate::reconcile::{orders as order_rules, products as product_rules, v_str};
use crate::store::db::Db;
use crate::store::settings::{get_setting, set_last_sync};
use crate::store::{orders, products};
use crate::sync::error::{truncate_for_log, SyncError};
use crate::sync::gate::{RequestGate, DEFAULT_MAX_CONCURRENT};
use crate::sync::retry::RetryPolicy;
use crate::sync::status::StatusRegistry;
use crate::util::env::{env_opt, env_parse, env_req};

const DEFAULT_API_VERSION: &str = "2024-01";
const ORDER_PAGE_LIMIT: u32 = 250;

#[derive(Clone)]
pub struct ShopifyProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    gate: RequestGate,
    retry: RetryPolicy,
}

impl ShopifyProvider {
    pub fn new(
        base_url: String,
        access_token: String,
        max_concurrent: usize,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(SyncError::from)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            gate: RequestGate::new("shopify", max_concurrent),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let shop = env_req("SHOPIFY_SHOP")?;
        let token = env_req("SHOPIFY_ACCESS_TOKEN")?;
        let version =
            env_opt("SHOPIFY_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
        let base_url = format!("https://{shop}.myshopify.com/admin/api/{version}");
        let max_concurrent = env_parse("SHOPIFY_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT);
        Ok(Self::new(base_url, token, max_concurrent)?)
    }

    async fn get_value(&self, label: &str, path_and_query: &str) -> Result<Value, SyncError> {
        let url = format!("{}/{}", self.base_url, path_and_query);
        let resp = self
            .retry
            .execute(label, None, || {
                let url = url.clone();
                async move {
                    self.gate
                        .run(label, || async {
                            Ok(self
                                .http
                                .get(&url)
                                .header("X-Shopify-Access-Token", &self.access_token)
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

    /// One gated, retried GraphQL call. GraphQL transport errors arrive as
    /// 200s with an `errors` array, which is a provider-data failure here.
    async fn graphql(&self, label: &str, payload: Value) -> Result<Value, SyncError> {
        let url = format!("{}/graphql.json", self.base_url);
        let resp = self
            .retry
            .execute(label, None, || {
                let url = url.clone();
                let payload = payload.clone();
                async move {
                    self.gate
                        .run(label, || async {
                            Ok(self
                                .http
                                .post(&url)
                                .header("X-Shopify-Access-Token", &self.access_token)
                                .json(&payload)
                                .send()
                                .await?)
                        })
                        .await
                }
            })
            .await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::ProviderData(format!("{label}: body decode failed: {e}")))?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(SyncError::ProviderData(format!(
                "{label}: graphql errors: {}",
                truncate_for_log(errors.to_string(), 400)
            )));
        }
        Ok(body)
    }

    pub async fn get_orders(
        &self,
        limit: u32,
        since_id: Option<u64>,
        created_at_min: Option<&str>,
    ) -> Result<Vec<Value>, SyncError> {
        let mut path = format!("orders.json?status=any&limit={limit}");
        if let Some(id) = since_id {
            path.push_str(&format!("&since_id={id}"));
        }
        if let Some(min) = created_at_min {
            path.push_str(&format!("&created_at_min={min}"));
        }
        let body = self.get_value("shopify orders", &path).await?;
        match body.get("orders") {
            Some(Value::Array(arr)) => Ok(arr.clone()),
            _ => Err(SyncError::ProviderData(
                "orders response missing 'orders' array".into(),
            )),
        }
    }

    /// Authoritative state of one order, for the backfill driver.
    pub async fn get_order(&self, order_id: &str) -> Result<Value, SyncError> {
        let body = self
            .get_value("shopify order", &format!("orders/{order_id}.json"))
            .await?;
        body.get("order")
            .cloned()
            .ok_or_else(|| SyncError::ProviderData("order response missing 'order'".into()))
    }

    /// Submit the product bulk export; returns the job gid.
    pub async fn submit_bulk_export(&self) -> Result<String, SyncError> {
        let mutation = r#"mutation bulkRun($query: String!) {
            bulkOperationRunQuery(query: $query) {
                bulkOperation { id status }
                userErrors { field message }
            }
        }"#;
        let body = self
            .graphql(
                "shopify bulk submit",
                json!({
                    "query": mutation,
                    "variables": {"query": bulk::PRODUCTS_BULK_QUERY}
                }),
            )
            .await?;
        let run = body
            .pointer("/data/bulkOperationRunQuery")
            .ok_or_else(|| SyncError::ProviderData("bulk submit response missing payload".into()))?;
        if let Some(errs) = run.get("userErrors").and_then(|e| e.as_array()) {
            if !errs.is_empty() {
                return Err(SyncError::ProviderData(format!(
                    "bulk submit rejected: {}",
                    truncate_for_log(Value::Array(errs.clone()).to_string(), 400)
                )));
            }
        }
        run.pointer("/bulkOperation/id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| SyncError::ProviderData("bulk submit returned no job id".into()))
    }

    /// Poll the current bulk operation to a terminal state. COMPLETED with
    /// no URL means the export matched nothing.
    pub async fn poll_bulk_export(
        &self,
        job_id: &str,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Option<String>, SyncError> {
        let query = r#"{ currentBulkOperation { id status errorCode objectCount url } }"#;
        for attempt in 1..=max_attempts {
            let body = self
                .graphql("shopify bulk poll", json!({"query": query}))
                .await?;
            let op = body
                .pointer("/data/currentBulkOperation")
                .filter(|v| !v.is_null())
                .ok_or_else(|| {
                    SyncError::ProviderData("no current bulk operation reported".into())
                })?;
            if v_str(op, "id").is_some_and(|id| id != job_id) {
                return Err(SyncError::ProviderData(format!(
                    "bulk operation superseded (expected {job_id})"
                )));
            }
            match bulk::job_status_of(op) {
                BulkJobStatus::Completed { url } => {
                    info!(job_id, attempt, "bulk export completed");
                    return Ok(url);
                }
                BulkJobStatus::Failed { code } => {
                    return Err(SyncError::ProviderData(format!(
                        "bulk export failed: {code}"
                    )))
                }
                BulkJobStatus::Canceled => {
                    return Err(SyncError::ProviderData("bulk export canceled".into()))
                }
                BulkJobStatus::Running => {
                    tokio::time::sleep(interval).await;
                }
            }
        }
        Err(SyncError::Timeout(format!(
            "bulk export still running after {max_attempts} polls"
        )))
    }

    /// Run (or reuse) the product export and parse it into a catalog.
    async fn export_catalog(
        &self,
        allowed_vendors: Option<HashSet<String>>,
        registry: &StatusRegistry,
        sync_id: &str,
    ) -> anyhow::Result<BulkCatalog> {
        let path = bulk::default_export_path();
        let max_age =
            Duration::from_secs(env_parse("SHOPIFY_EXPORT_MAX_AGE_SECS", bulk::EXPORT_MAX_AGE.as_secs()));

        if bulk::export_is_fresh(&path, max_age) {
            info!(path = %path.display(), "reusing fresh bulk export");
        } else {
            registry.update(sync_id, |op| {
                op.phase = "exporting".to_string();
                op.progress = 10;
            });
            let job_id = self.submit_bulk_export().await?;
            info!(job_id, "bulk export submitted");

            registry.update(sync_id, |op| {
                op.phase = "polling".to_string();
                op.progress = 20;
            });
            let url = self
                .poll_bulk_export(
                    &job_id,
                    Duration::from_secs(env_parse("SHOPIFY_POLL_INTERVAL_SECS", 5u64)),
                    env_parse("SHOPIFY_POLL_MAX_ATTEMPTS", bulk::MAX_POLL_ATTEMPTS),
                )
                .await?;
            match url {
                Some(url) => {
                    registry.update(sync_id, |op| {
                        op.phase = "downloading".to_string();
                        op.progress = 45;
                    });
                    bulk::download_export(&self.http, &url, &path).await?;
                }
                None => {
                    info!("bulk export matched no products");
                    return Ok(BulkCatalog::default());
                }
            }
        }

        registry.update(sync_id, |op| {
            op.phase = "parsing".to_string();
            op.progress = 60;
        });
        bulk::parse_export_file(&path, allowed_vendors).await
    }

    /// Product sync: bulk export → assemble → reconcile → gated cleanup.
    pub async fn sync_products(
        &self,
        db: &Db,
        registry: &StatusRegistry,
        sync_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let allowed_vendors = get_setting::<Vec<String>>(db, "shopify_vendor_allowlist")
            .await?
            .map(|v| v.into_iter().collect::<HashSet<_>>());

        let catalog = self.export_catalog(allowed_vendors, registry, sync_id).await?;

        let mut rows = Vec::new();
        let mut kept: HashSet<String> = HashSet::new();
        let mut filtered = 0i64;
        for p in &catalog.products {
            if !p.relevant {
                filtered += 1;
                continue;
            }
            for row in product_rules::from_bulk_product(p, now) {
                kept.insert(row.sku.clone());
                rows.push(row);
            }
        }

        registry.update(sync_id, |op| {
            op.phase = "reconciling".to_string();
            op.progress = 75;
            op.total_estimate = Some(catalog.products.len() as i64);
        });
        let counts = products::bulk_upsert(db, &rows).await?;

        registry.update(sync_id, |op| {
            op.phase = "cleanup".to_string();
            op.progress = 90;
        });
        let cleanup = product_rules::run_cleanup(db, "shopify", &kept).await?;
        if cleanup.aborted {
            warn!(
                candidates = cleanup.candidates,
                population = cleanup.population,
                "shopify cleanup aborted by safety gate"
            );
        }

        registry.update(sync_id, |op| {
            op.counts
                .insert("products_added".to_string(), counts.inserted as i64);
            op.counts
                .insert("products_updated".to_string(), counts.updated as i64);
            op.counts
                .insert("products_deleted".to_string(), cleanup.deleted as i64);
            op.counts
                .insert("products_filtered".to_string(), filtered);
            op.counts
                .insert("lines_skipped".to_string(), (catalog.orphans + catalog.malformed) as i64);
            op.processed = rows.len() as i64;
            op.progress = 95;
        });

        set_last_sync(db, "shopify", "products", now).await?;
        info!(
            products = catalog.products.len(),
            rows = rows.len(),
            filtered,
            deleted = cleanup.deleted,
            cleanup_aborted = cleanup.aborted,
            "shopify product sync reconciled"
        );
        Ok(())
    }

    /// Order sync: since_id cursor over the REST order feed.
    pub async fn sync_orders(
        &self,
        db: &Db,
        registry: &StatusRegistry,
        sync_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let sync_days = get_setting::<i64>(db, "shopify_sync_days")
            .await?
            .unwrap_or(90);
        // Z suffix keeps the value query-string safe (a +00:00 offset would
        // decode as a space).
        let created_at_min = (now - chrono::Duration::days(sync_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        registry.update(sync_id, |op| {
            op.phase = "fetching".to_string();
            op.progress = 5;
        });

        let reg = registry.clone();
        let sid = sync_id.to_string();
        let items = crate::sync::cursor::fetch_all(
            "shopify orders",
            env_parse("SHOPIFY_ORDER_PAGE_LIMIT", ORDER_PAGE_LIMIT),
            |limit, since_id| {
                let min = created_at_min.clone();
                async move { self.get_orders(limit, since_id, Some(&min)).await }
            },
            |v| v.get("id").and_then(|x| x.as_u64()),
            move |fetched| {
                reg.update(&sid, |op| {
                    op.processed = fetched as i64;
                    // No authoritative total on a cursor feed; creep toward
                    // the reconcile phase instead of pretending to know.
                    op.progress = op.progress.max((5 + (fetched / 100).min(75)) as u8);
                });
            },
        )
        .await?;

        let mut rows = Vec::with_capacity(items.len());
        let mut skipped = 0i64;
        for v in &items {
            match order_rules::normalize_shopify_order(v, now) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed order");
                }
            }
        }

        registry.update(sync_id, |op| {
            op.phase = "reconciling".to_string();
            op.progress = 85;
        });
        let counts = orders::bulk_upsert(db, &rows).await?;

        registry.update(sync_id, |op| {
            op.counts
                .insert("orders_added".to_string(), counts.inserted as i64);
            op.counts
                .insert("orders_updated".to_string(), counts.updated as i64);
            op.counts.insert("records_skipped".to_string(), skipped);
            op.processed = rows.len() as i64;
            op.progress = 95;
        });

        set_last_sync(db, "shopify", "orders", now).await?;
        info!(
            fetched = items.len(),
            upserted = rows.len(),
            skipped,
            "shopify order sync reconciled"
        );
        Ok(())
    }
}
