// API request/response models (DTOs)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::status::SyncOperation;

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub uptime_seconds: u64,
}

/// Accepted sync trigger
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStartResponse {
    pub sync_id: String,
    pub provider: String,
    pub resource: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderSyncQuery {
    pub marketplace: String,
}

/// SyncOperation snapshot with processed/total normalized from the raw
/// counts map for clients that only want the two headline numbers.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    pub sync_id: String,
    pub provider: String,
    pub resource: String,
    pub phase: String,
    pub progress: u8,
    pub counts: HashMap<String, i64>,
    pub processed_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub complete: bool,
}

impl From<SyncOperation> for SyncStatusResponse {
    fn from(op: SyncOperation) -> Self {
        let processed_count = if op.processed > 0 {
            op.processed
        } else {
            op.counts.values().sum()
        };
        Self {
            sync_id: op.sync_id,
            provider: op.provider,
            resource: op.resource,
            phase: op.phase,
            progress: op.progress,
            counts: op.counts,
            processed_count,
            total_count: op.total_estimate,
            started_at: op.started_at,
            completed_at: op.completed_at,
            error: op.error,
            complete: op.complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_normalizes_processed_from_counts() {
        let reg = crate::sync::status::StatusRegistry::default();
        let op = reg.begin("etsy", "orders").unwrap();
        reg.update(&op.sync_id, |o| {
            o.counts.insert("orders_added".into(), 12);
            o.counts.insert("orders_updated".into(), 30);
        });
        let resp = SyncStatusResponse::from(reg.get(&op.sync_id));
        assert_eq!(resp.processed_count, 42);

        reg.update(&op.sync_id, |o| o.processed = 99);
        let resp = SyncStatusResponse::from(reg.get(&op.sync_id));
        assert_eq!(resp.processed_count, 99);
    }
}
