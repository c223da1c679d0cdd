//! Sync orchestration: trigger → registry lease → paginate → reconcile →
//! terminal state.

pub mod backfill;
pub mod cursor;
pub mod error;
pub mod gate;
pub mod offset;
pub mod retry;
pub mod status;

use std::str::FromStr;

use tracing::error;

use crate::providers::etsy::EtsyProvider;
use crate::providers::shopify::ShopifyProvider;
use crate::store::db::Db;
use crate::sync::status::{StatusRegistry, SyncAlreadyRunning};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marketplace {
    Etsy,
    Shopify,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Etsy => "etsy",
            Marketplace::Shopify => "shopify",
        }
    }
}

impl FromStr for Marketplace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etsy" => Ok(Marketplace::Etsy),
            "shopify" => Ok(Marketplace::Shopify),
            other => Err(anyhow::anyhow!("unknown marketplace '{other}'")),
        }
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a sync needs, cloned into each background task.
#[derive(Clone)]
pub struct SyncContext {
    pub db: Db,
    pub registry: StatusRegistry,
    pub etsy: EtsyProvider,
    pub shopify: ShopifyProvider,
}

impl SyncContext {
    pub fn from_env(db: Db) -> anyhow::Result<Self> {
        Ok(Self {
            etsy: EtsyProvider::from_env(db.clone())?,
            shopify: ShopifyProvider::from_env()?,
            registry: StatusRegistry::default(),
            db,
        })
    }

    /// Start a product sync in the background; returns the sync id at once.
    pub fn spawn_product_sync(&self, market: Marketplace) -> Result<String, SyncAlreadyRunning> {
        let op = self.registry.begin(market.as_str(), "products")?;
        let sync_id = op.sync_id.clone();
        let ctx = self.clone();
        let id = sync_id.clone();
        tokio::spawn(async move {
            let result = match market {
                Marketplace::Etsy => ctx.etsy.sync_products(&ctx.db, &ctx.registry, &id).await,
                Marketplace::Shopify => {
                    ctx.shopify.sync_products(&ctx.db, &ctx.registry, &id).await
                }
            };
            finish(&ctx.registry, &id, market, "products", result);
        });
        Ok(sync_id)
    }

    /// Start an order sync in the background; returns the sync id at once.
    pub fn spawn_order_sync(&self, market: Marketplace) -> Result<String, SyncAlreadyRunning> {
        let op = self.registry.begin(market.as_str(), "orders")?;
        let sync_id = op.sync_id.clone();
        let ctx = self.clone();
        let id = sync_id.clone();
        tokio::spawn(async move {
            let result = match market {
                Marketplace::Etsy => ctx.etsy.sync_orders(&ctx.db, &ctx.registry, &id).await,
                Marketplace::Shopify => ctx.shopify.sync_orders(&ctx.db, &ctx.registry, &id).await,
            };
            finish(&ctx.registry, &id, market, "orders", result);
        });
        Ok(sync_id)
    }
}

/// Catch-all terminal transition: a failed background sync marks its
/// operation failed instead of crashing anything.
fn finish(
    registry: &StatusRegistry,
    sync_id: &str,
    market: Marketplace,
    resource: &str,
    result: anyhow::Result<()>,
) {
    match result {
        Ok(()) => registry.complete(sync_id, None),
        Err(e) => {
            error!(sync_id, %market, resource, error = %format!("{e:#}"), "sync failed");
            registry.complete(sync_id, Some(format!("{e:#}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marketplace_parses_known_values_only() {
        assert_eq!("etsy".parse::<Marketplace>().unwrap(), Marketplace::Etsy);
        assert_eq!(
            " Shopify ".parse::<Marketplace>().unwrap(),
            Marketplace::Shopify
        );
        assert!("amazon".parse::<Marketplace>().is_err());
        assert!("".parse::<Marketplace>().is_err());
    }
}
