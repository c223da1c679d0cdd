//! Order normalization and state derivation for both marketplaces.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::reconcile::{decimal_minor, etsy_money_minor, v_bool, v_epoch, v_i64, v_rfc3339, v_str};
use crate::store::orders::{order_key, OrderUpsert};
use crate::sync::error::SyncError;

/// Local order lifecycle derived from provider state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedStatus {
    Shipped,
    Cancelled,
    Pending,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Shipped => "shipped",
            DerivedStatus::Cancelled => "cancelled",
            DerivedStatus::Pending => "pending",
        }
    }

    /// Still-pending orders count toward the backfill miss streak.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DerivedStatus::Pending)
    }
}

/// Etsy receipt → canonical order row.
///
/// Shipped is taken from the shipment notification timestamps (with
/// `is_shipped` as a fallback marker), cancelled from the receipt status.
pub fn normalize_etsy_receipt(v: &Value, now: DateTime<Utc>) -> Result<OrderUpsert, SyncError> {
    let receipt_id = v_i64(v, "receipt_id")
        .ok_or_else(|| SyncError::ProviderData("receipt without receipt_id".into()))?;
    let id = receipt_id.to_string();

    let shipped_at = v
        .get("shipments")
        .and_then(|s| s.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter_map(|s| v_epoch(s, "shipment_notification_timestamp"))
                .min()
        })
        .or_else(|| {
            if v_bool(v, "is_shipped").unwrap_or(false) {
                Some(now)
            } else {
                None
            }
        });
    let cancelled = v_str(v, "status")
        .map(|s| s.eq_ignore_ascii_case("canceled") || s.eq_ignore_ascii_case("cancelled"))
        .unwrap_or(false);

    let status = if cancelled {
        DerivedStatus::Cancelled
    } else if shipped_at.is_some() {
        DerivedStatus::Shipped
    } else {
        DerivedStatus::Pending
    };

    let (total_minor, currency) = v
        .get("grandtotal")
        .and_then(etsy_money_minor)
        .map(|(m, c)| (Some(m), Some(c)))
        .unwrap_or((None, None));

    Ok(OrderUpsert {
        order_key: order_key("etsy", &id),
        provider: "etsy".to_string(),
        provider_order_id: id,
        status: status.as_str().to_string(),
        buyer_name: v_str(v, "name").map(|s| s.to_string()),
        total_minor,
        currency,
        placed_at: v_epoch(v, "create_timestamp").or_else(|| v_epoch(v, "created_timestamp")),
        shipped_at,
        cancelled_at: if cancelled {
            v_epoch(v, "update_timestamp").or(Some(now))
        } else {
            None
        },
        last_synced_at: now,
    })
}

/// Shopify order → canonical order row.
///
/// Cancelled comes from `cancelled_at`, shipped from the fulfillment display
/// status with the earliest fulfillment timestamp.
pub fn normalize_shopify_order(v: &Value, now: DateTime<Utc>) -> Result<OrderUpsert, SyncError> {
    let order_id = v_i64(v, "id")
        .ok_or_else(|| SyncError::ProviderData("order without id".into()))?;
    let id = order_id.to_string();

    let cancelled_at = v_rfc3339(v, "cancelled_at");
    let fulfilled = v_str(v, "fulfillment_status")
        .map(|s| s.eq_ignore_ascii_case("fulfilled"))
        .unwrap_or(false);
    let shipped_at = v
        .get("fulfillments")
        .and_then(|f| f.as_array())
        .and_then(|arr| arr.iter().filter_map(|f| v_rfc3339(f, "created_at")).min())
        .or_else(|| if fulfilled { Some(now) } else { None });

    let status = if cancelled_at.is_some() {
        DerivedStatus::Cancelled
    } else if fulfilled || shipped_at.is_some() {
        DerivedStatus::Shipped
    } else {
        DerivedStatus::Pending
    };

    let buyer_name = v.get("customer").map(|c| {
        let first = v_str(c, "first_name").unwrap_or_default();
        let last = v_str(c, "last_name").unwrap_or_default();
        format!("{first} {last}").trim().to_string()
    });

    Ok(OrderUpsert {
        order_key: order_key("shopify", &id),
        provider: "shopify".to_string(),
        provider_order_id: id,
        status: status.as_str().to_string(),
        buyer_name: buyer_name.filter(|s| !s.is_empty()),
        total_minor: v_str(v, "total_price").and_then(decimal_minor),
        currency: v_str(v, "currency").map(|s| s.to_string()),
        placed_at: v_rfc3339(v, "created_at"),
        shipped_at: if status == DerivedStatus::Shipped {
            shipped_at
        } else {
            None
        },
        cancelled_at,
        last_synced_at: now,
    })
}

pub fn derived_status_of(row: &OrderUpsert) -> DerivedStatus {
    match row.status.as_str() {
        "shipped" => DerivedStatus::Shipped,
        "cancelled" => DerivedStatus::Cancelled,
        _ => DerivedStatus::Pending,
    }
}
