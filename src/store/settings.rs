//! JSONB key/value settings: provider tokens, tunables, last-sync stamps.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::store::db::Db;

pub async fn get_setting<T: DeserializeOwned>(db: &Db, key: &str) -> Result<Option<T>> {
    let raw: Option<Value> = sqlx::query_scalar("SELECT value FROM app_settings WHERE key = $1")
        .bind(key)
        .fetch_optional(&db.pool)
        .await?;
    match raw {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub async fn set_setting<T: Serialize>(db: &Db, key: &str, value: &T) -> Result<()> {
    sqlx::query(
        "INSERT INTO app_settings (key, value, updated_at) VALUES ($1, $2, now())
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
    )
    .bind(key)
    .bind(serde_json::to_value(value)?)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Per-provider/resource last-sync stamp, e.g. `etsy_orders_last_sync`.
pub fn last_sync_key(provider: &str, resource: &str) -> String {
    format!("{provider}_{resource}_last_sync")
}

pub async fn get_last_sync(db: &Db, provider: &str, resource: &str) -> Result<Option<DateTime<Utc>>> {
    get_setting(db, &last_sync_key(provider, resource)).await
}

pub async fn set_last_sync(db: &Db, provider: &str, resource: &str, at: DateTime<Utc>) -> Result<()> {
    set_setting(db, &last_sync_key(provider, resource), &at).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_sync_keys_are_stable() {
        assert_eq!(last_sync_key("etsy", "orders"), "etsy_orders_last_sync");
        assert_eq!(
            last_sync_key("shopify", "products"),
            "shopify_products_last_sync"
        );
    }
}
