//! Offset-counted paginator.
//!
//! Page 1 is fetched alone so its authoritative total can be validated
//! before any fan-out. The remaining offsets go onto a shared queue drained
//! by a fixed worker pool; each page is independently gated/retried by the
//! fetcher the caller supplies. A failed later page contributes zero records
//! and is recorded, never fatal. Termination is exact: every computed offset
//! is attempted once.
//!
//! The page-1 total is trusted for the whole fetch. If the provider dataset
//! mutates mid-fetch, records can be missed or double-counted; that is an
//! accepted approximation, not a guaranteed snapshot.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::sync::error::SyncError;

pub const DEFAULT_WORKERS: usize = 5;
pub const MAX_PAGE_COUNT: u64 = 10_000;

/// One provider page: the raw records plus the authoritative total (present
/// at least on the first page for offset-counted providers).
#[derive(Debug)]
pub struct OffsetPage<T> {
    pub items: Vec<T>,
    pub total: Option<u64>,
}

#[derive(Debug)]
pub struct OffsetOutcome<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub failed_offsets: Vec<u64>,
}

/// Drain every page of an offset-paginated resource.
///
/// `fetch` receives `(limit, offset)` and is expected to route through the
/// request gate and retry wrapper internally. `on_page` observes cumulative
/// progress as `(fetched_so_far, total)` in completion order.
pub async fn fetch_all<T, F, Fut>(
    label: &str,
    page_size: u32,
    workers: usize,
    fetch: F,
    on_page: impl Fn(usize, u64) + Send + Sync + 'static,
) -> Result<OffsetOutcome<T>, SyncError>
where
    T: Send + 'static,
    F: Fn(u32, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OffsetPage<T>, SyncError>> + Send + 'static,
{
    let page_size = page_size.max(1);

    // First page is fatal on failure and carries the total.
    let first = fetch(page_size, 0).await?;
    let total = match first.total {
        Some(t) => t,
        None => {
            return Err(SyncError::ProviderData(format!(
                "{label}: first page carried no total count"
            )))
        }
    };
    let page_count = total.div_ceil(page_size as u64);
    if page_count > MAX_PAGE_COUNT {
        return Err(SyncError::ProviderData(format!(
            "{label}: total {total} implies {page_count} pages (ceiling {MAX_PAGE_COUNT}); refusing corrupted pagination"
        )));
    }

    let mut items = first.items;
    on_page(items.len(), total);
    if total <= page_size as u64 {
        info!(label, total, pages = 1, "offset fetch complete");
        return Ok(OffsetOutcome {
            items,
            total,
            failed_offsets: Vec::new(),
        });
    }

    let queue: Arc<Mutex<VecDeque<u64>>> = Arc::new(Mutex::new(
        (1..page_count).map(|p| p * page_size as u64).collect(),
    ));
    let gathered: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(items.drain(..).collect()));
    let failed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let fetch = Arc::new(fetch);
    let on_page = Arc::new(on_page);
    let label_owned = label.to_string();

    let workers = workers.max(1).min(page_count as usize);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let gathered = gathered.clone();
        let failed = failed.clone();
        let fetch = fetch.clone();
        let on_page = on_page.clone();
        let label = label_owned.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let offset = match queue.lock().await.pop_front() {
                    Some(o) => o,
                    None => break,
                };
                match fetch(page_size, offset).await {
                    Ok(page) => {
                        let mut all = gathered.lock().await;
                        all.extend(page.items);
                        on_page(all.len(), total);
                    }
                    Err(e) => {
                        // Partial result: this page's records are lost but
                        // the sync continues.
                        warn!(label = %label, offset, error = %e, "page failed after retries; continuing without it");
                        failed.lock().await.push(offset);
                    }
                }
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let items = Arc::try_unwrap(gathered)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    let mut failed_offsets = Arc::try_unwrap(failed)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    failed_offsets.sort_unstable();
    if !failed_offsets.is_empty() {
        warn!(
            label,
            offsets = %failed_offsets.iter().join(","),
            "offsets lost to exhausted retries"
        );
    }
    info!(
        label,
        total,
        pages = page_count,
        fetched = items.len(),
        failed_pages = failed_offsets.len(),
        "offset fetch complete"
    );
    Ok(OffsetOutcome {
        items,
        total,
        failed_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn synthetic_page(limit: u32, offset: u64, total: u64) -> OffsetPage<u64> {
        let end = total.min(offset + limit as u64);
        OffsetPage {
            items: (offset..end).collect(),
            total: Some(total),
        }
    }

    #[tokio::test]
    async fn total_327_page_100_fetches_exactly_4_pages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let out = fetch_all(
            "receipts",
            100,
            5,
            move |limit, offset| {
                let calls = calls_c.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(synthetic_page(limit, offset, 327))
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(out.total, 327);
        assert_eq!(out.items.len(), 327);
        let mut distinct = out.items.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 327);
        assert!(out.failed_offsets.is_empty());
    }

    #[tokio::test]
    async fn first_page_failure_is_fatal() {
        let err = fetch_all(
            "receipts",
            100,
            5,
            |_, _| async { Err::<OffsetPage<u64>, _>(SyncError::Http { status: 500, body: "".into() }) },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn later_page_failure_yields_partial_result() {
        let out = fetch_all(
            "receipts",
            100,
            2,
            move |limit, offset| async move {
                if offset == 200 {
                    Err(SyncError::RateLimited { attempts: 4 })
                } else {
                    Ok(synthetic_page(limit, offset, 327))
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(out.items.len(), 227);
        assert_eq!(out.failed_offsets, vec![200]);
    }

    #[tokio::test]
    async fn absurd_total_aborts_as_corrupted() {
        let err = fetch_all(
            "receipts",
            10,
            5,
            |limit, offset| async move {
                Ok(synthetic_page(limit, offset, 10 * MAX_PAGE_COUNT + 1))
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));
    }

    #[tokio::test]
    async fn missing_total_aborts() {
        let err = fetch_all(
            "receipts",
            10,
            5,
            |_, _| async {
                Ok(OffsetPage::<u64> {
                    items: vec![],
                    total: None,
                })
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));
    }

    #[tokio::test]
    async fn empty_total_is_a_valid_empty_result() {
        let out = fetch_all(
            "receipts",
            10,
            5,
            |_, _| async {
                Ok(OffsetPage::<u64> {
                    items: vec![],
                    total: Some(0),
                })
            },
            |_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(out.total, 0);
        assert!(out.items.is_empty());
    }
}
