//! Per-provider request gate: bounded concurrency plus optional minimum
//! inter-dispatch spacing for providers with a hard per-second ceiling.
//!
//! Admission is FIFO (tokio's semaphore queues fairly); completion order is
//! whatever the network gives us. There is no cancellation once a task has
//! queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sync::error::SyncError;

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

#[derive(Clone)]
pub struct RequestGate {
    provider: &'static str,
    permits: Arc<Semaphore>,
    pacer: Option<Arc<Mutex<Pacer>>>,
}

struct Pacer {
    min_gap: Duration,
    next_slot: Instant,
}

impl RequestGate {
    pub fn new(provider: &'static str, max_concurrent: usize) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pacer: None,
        }
    }

    /// Enforce a minimum gap between dispatches, ahead of gate admission.
    pub fn with_min_spacing(mut self, min_gap: Duration) -> Self {
        self.pacer = Some(Arc::new(Mutex::new(Pacer {
            min_gap,
            next_slot: Instant::now(),
        })));
        self
    }

    /// Run one task through the gate. Pacing (if configured) happens before
    /// a permit is requested so slow tasks don't stretch the dispatch rate.
    pub async fn run<T, F, Fut>(&self, label: &str, task: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        if let Some(pacer) = &self.pacer {
            let wait = {
                let mut p = pacer.lock().await;
                let now = Instant::now();
                let slot = p.next_slot.max(now);
                p.next_slot = slot + p.min_gap;
                slot - now
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore closed");

        let started = Instant::now();
        debug!(provider = self.provider, label, "gate admit");
        let result = task().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(provider = self.provider, label, elapsed_ms, "gate done"),
            Err(e) => warn!(provider = self.provider, label, elapsed_ms, error = %e, "gate task failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let gate = RequestGate::new("test", 3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(&format!("task-{i}"), || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, SyncError>(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn min_spacing_paces_dispatch() {
        let gate = RequestGate::new("test", 5).with_min_spacing(Duration::from_millis(20));
        let started = Instant::now();
        for i in 0..4 {
            gate.run(&format!("paced-{i}"), || async { Ok::<_, SyncError>(()) })
                .await
                .unwrap();
        }
        // 4 dispatches with a 20ms gap need at least 3 gaps.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let gate = RequestGate::new("test", 1);
        let err = gate
            .run("failing", || async {
                Err::<(), _>(SyncError::Network("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }
}
