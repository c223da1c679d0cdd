//! In-memory sync status registry.
//!
//! One record per running or recently finished sync, keyed by a uuid sync
//! id. `begin` doubles as the per-provider/resource lease: a second sync for
//! the same pair is refused while the first is incomplete. Completed records
//! linger for a TTL so pollers can read the terminal state, then a
//! background sweep drops them.
//!
//! Updates are last-write-wins on the whole record; concurrent workers must
//! only touch fields they own. Progress is clamped monotonic and a completed
//! record is frozen.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct SyncOperation {
    pub sync_id: String,
    pub provider: String,
    pub resource: String,
    pub phase: String,
    pub progress: u8,
    pub counts: HashMap<String, i64>,
    pub processed: i64,
    pub total_estimate: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub complete: bool,
    #[serde(skip)]
    pub last_updated: DateTime<Utc>,
}

impl SyncOperation {
    fn unknown(sync_id: &str) -> Self {
        let now = Utc::now();
        Self {
            sync_id: sync_id.to_string(),
            provider: String::new(),
            resource: String::new(),
            phase: "unknown".to_string(),
            progress: 0,
            counts: HashMap::new(),
            processed: 0,
            total_estimate: None,
            started_at: now,
            completed_at: None,
            error: None,
            complete: false,
            last_updated: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a {resource} sync for {provider} is already running ({sync_id})")]
pub struct SyncAlreadyRunning {
    pub provider: String,
    pub resource: String,
    pub sync_id: String,
}

#[derive(Clone)]
pub struct StatusRegistry {
    inner: Arc<RwLock<HashMap<String, SyncOperation>>>,
    retention: Duration,
}

impl StatusRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Create a new operation, acquiring the provider/resource lease.
    pub fn begin(&self, provider: &str, resource: &str) -> Result<SyncOperation, SyncAlreadyRunning> {
        let mut map = self.inner.write().expect("status registry poisoned");
        if let Some(running) = map
            .values()
            .find(|op| !op.complete && op.provider == provider && op.resource == resource)
        {
            return Err(SyncAlreadyRunning {
                provider: provider.to_string(),
                resource: resource.to_string(),
                sync_id: running.sync_id.clone(),
            });
        }
        let now = Utc::now();
        let op = SyncOperation {
            sync_id: uuid::Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            resource: resource.to_string(),
            phase: "initialized".to_string(),
            progress: 0,
            counts: HashMap::new(),
            processed: 0,
            total_estimate: None,
            started_at: now,
            completed_at: None,
            error: None,
            complete: false,
            last_updated: now,
        };
        info!(sync_id = %op.sync_id, provider, resource, "sync initialized");
        map.insert(op.sync_id.clone(), op.clone());
        Ok(op)
    }

    /// Apply a mutation to a running operation. No-op for unknown ids and
    /// frozen (complete) records. Progress never decreases.
    pub fn update<F>(&self, sync_id: &str, mutate: F)
    where
        F: FnOnce(&mut SyncOperation),
    {
        let mut map = self.inner.write().expect("status registry poisoned");
        if let Some(op) = map.get_mut(sync_id) {
            if op.complete {
                return;
            }
            let floor = op.progress;
            mutate(op);
            op.progress = op.progress.max(floor).min(100);
            op.last_updated = Utc::now();
        }
    }

    /// Terminal transition; the record is frozen afterwards.
    pub fn complete(&self, sync_id: &str, error: Option<String>) {
        let mut map = self.inner.write().expect("status registry poisoned");
        if let Some(op) = map.get_mut(sync_id) {
            if op.complete {
                return;
            }
            if error.is_none() {
                op.progress = 100;
                op.phase = "complete".to_string();
            } else {
                op.phase = "failed".to_string();
            }
            op.error = error;
            op.complete = true;
            op.completed_at = Some(Utc::now());
            op.last_updated = Utc::now();
            info!(sync_id, phase = %op.phase, "sync finished");
        }
    }

    /// Snapshot for pollers. Unknown or expired ids get a zeroed default
    /// rather than an absence error.
    pub fn get(&self, sync_id: &str) -> SyncOperation {
        let map = self.inner.read().expect("status registry poisoned");
        map.get(sync_id)
            .cloned()
            .unwrap_or_else(|| SyncOperation::unknown(sync_id))
    }

    /// Currently running operations.
    pub fn active(&self) -> Vec<SyncOperation> {
        let map = self.inner.read().expect("status registry poisoned");
        map.values().filter(|op| !op.complete).cloned().collect()
    }

    /// Drop completed records older than the retention window. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let mut map = self.inner.write().expect("status registry poisoned");
        let before = map.len();
        map.retain(|_, op| !(op.complete && op.last_updated < cutoff));
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, "swept expired sync records");
        }
        removed
    }

    /// Background expiry sweep; runs for the life of the process.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.sweep();
            }
        })
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_and_frozen_after_complete() {
        let reg = StatusRegistry::default();
        let op = reg.begin("etsy", "products").unwrap();
        let id = op.sync_id.clone();

        reg.update(&id, |op| op.progress = 40);
        reg.update(&id, |op| op.progress = 25);
        assert_eq!(reg.get(&id).progress, 40);

        reg.complete(&id, None);
        let done = reg.get(&id);
        assert!(done.complete);
        assert_eq!(done.progress, 100);

        reg.update(&id, |op| {
            op.progress = 10;
            op.phase = "zombie".to_string();
        });
        let after = reg.get(&id);
        assert_eq!(after.progress, 100);
        assert_eq!(after.phase, "complete");
    }

    #[test]
    fn lease_refuses_duplicate_sync() {
        let reg = StatusRegistry::default();
        let first = reg.begin("shopify", "products").unwrap();
        let err = reg.begin("shopify", "products").unwrap_err();
        assert_eq!(err.sync_id, first.sync_id);

        // A different resource for the same provider is fine.
        reg.begin("shopify", "orders").unwrap();

        // Completion releases the lease.
        reg.complete(&first.sync_id, None);
        reg.begin("shopify", "products").unwrap();
    }

    #[test]
    fn unknown_id_yields_zeroed_default() {
        let reg = StatusRegistry::default();
        let op = reg.get("no-such-sync");
        assert_eq!(op.sync_id, "no-such-sync");
        assert_eq!(op.progress, 0);
        assert!(!op.complete);
        assert!(op.counts.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_completed_records() {
        let reg = StatusRegistry::new(Duration::from_secs(0));
        let done = reg.begin("etsy", "orders").unwrap();
        let running = reg.begin("etsy", "products").unwrap();
        reg.complete(&done.sync_id, Some("boom".into()));

        // Zero retention: the completed record is immediately expired.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(reg.sweep(), 1);
        assert_eq!(reg.get(&done.sync_id).provider, "");
        assert_eq!(reg.get(&running.sync_id).provider, "etsy");
    }

    #[test]
    fn failed_sync_records_error_for_pollers() {
        let reg = StatusRegistry::default();
        let op = reg.begin("shopify", "orders").unwrap();
        reg.complete(&op.sync_id, Some("first page failed".into()));
        let done = reg.get(&op.sync_id);
        assert!(done.complete);
        assert_eq!(done.phase, "failed");
        assert_eq!(done.error.as_deref(), Some("first page failed"));
        assert!(done.progress < 100);
    }
}
