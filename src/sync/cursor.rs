//! Cursor ("since_id") paginator.
//!
//! No authoritative total exists for these feeds: we page forward from the
//! last seen id and a short page signals exhaustion. Progress reporting is
//! therefore heuristic (count so far).

use std::future::Future;

use tracing::info;

use crate::sync::error::SyncError;

/// Drain a since_id-paginated resource.
///
/// `fetch` receives `(limit, since_id)` and routes through the gate/retry
/// internally; `id_of` extracts the cursor from a record. A page shorter
/// than `limit` ends the loop.
pub async fn fetch_all<T, F, Fut>(
    label: &str,
    limit: u32,
    fetch: F,
    id_of: impl Fn(&T) -> Option<u64>,
    on_page: impl Fn(usize),
) -> Result<Vec<T>, SyncError>
where
    F: Fn(u32, Option<u64>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, SyncError>>,
{
    let limit = limit.max(1);
    let mut items: Vec<T> = Vec::new();
    let mut since_id: Option<u64> = None;
    let mut pages = 0u32;

    loop {
        let page = fetch(limit, since_id).await?;
        pages += 1;
        let page_len = page.len();
        since_id = page.last().and_then(&id_of);
        items.extend(page);
        on_page(items.len());

        if page_len < limit as usize {
            break;
        }
        if since_id.is_none() {
            // A full page whose last record has no id would loop forever.
            return Err(SyncError::ProviderData(format!(
                "{label}: full page without a cursor id"
            )));
        }
    }

    info!(label, pages, fetched = items.len(), "cursor fetch complete");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn short_page_terminates_after_three_requests() {
        // Pages of 250, 250, 130 with limit 250: no 4th request.
        let sizes = [250usize, 250, 130];
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();

        let items = fetch_all(
            "orders",
            250,
            move |_limit, since_id| {
                let calls = calls_c.clone();
                async move {
                    let page_idx = calls.fetch_add(1, Ordering::SeqCst);
                    assert!(page_idx < 3, "issued a 4th request");
                    if page_idx > 0 {
                        assert!(since_id.is_some());
                    }
                    let base = (page_idx as u64) * 1000;
                    Ok((0..sizes[page_idx] as u64).map(|i| base + i).collect())
                }
            },
            |id| Some(*id),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(items.len(), 630);
    }

    #[tokio::test]
    async fn empty_first_page_is_one_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let items: Vec<u64> = fetch_all(
            "orders",
            250,
            move |_, _| {
                let calls = calls_c.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
            },
            |id| Some(*id),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn cursor_advances_from_last_record() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        let _ = fetch_all(
            "orders",
            2,
            move |_, since_id| {
                let seen = seen_c.clone();
                async move {
                    seen.lock().unwrap().push(since_id);
                    match since_id {
                        None => Ok(vec![10u64, 20]),
                        Some(20) => Ok(vec![30, 40]),
                        Some(40) => Ok(vec![50]),
                        other => panic!("unexpected cursor {other:?}"),
                    }
                }
            },
            |id| Some(*id),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![None, Some(20), Some(40)]);
    }
}
