use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{PortalClient, RawInvoice};
use crate::error::{Error, Result};
use crate::sync::retry::{self, retry_api, ErrorClass};
use crate::sync::{SyncProgress, SyncSnapshot};

/// Safety cap on pages per scan, over and above the declared total.
pub const MAX_PAGES: u32 = 200;

/// Consecutive failed pages (each already past its own retry budget)
/// before the scan gives up and returns what it has.
pub const MAX_CONSECUTIVE_PAGE_ERRORS: u32 = 3;

/// Everything a listing scan accumulated, plus how it ended.
#[derive(Debug)]
pub struct PageScan {
    pub records: Vec<RawInvoice>,
    pub total_declared: i64,
    pub pages_fetched: u32,
    /// True only for clean exhaustion: cursor absent or declared total
    /// reached. False after the circuit breaker, the page cap, or a
    /// cancellation.
    pub complete: bool,
    pub errors: Vec<String>,
}

/// Pause between successful page fetches. Larger result sets get longer
/// pauses, and every page failure seen so far in the run adds a second;
/// the portal throttles harder the more load it is under.
fn page_delay(total_declared: i64, run_errors: u32) -> Duration {
    let base: u64 = if total_declared > 1000 {
        2000
    } else if total_declared > 500 {
        1500
    } else {
        1000
    };
    Duration::from_millis(base + 1000 * run_errors as u64)
}

fn percent(processed: usize, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    ((processed as i64).saturating_mul(100) / total).clamp(0, 100) as u8
}

/// Drive the cursor-resume loop against the listing endpoint until
/// exhaustion, the declared total, the page cap, the circuit breaker, or
/// cancellation. A failed page is retried on the same cursor; the scan
/// never skips past a page it could not fetch.
///
/// Returns an error only when the very first call fails with a
/// non-retryable class: nothing was accumulated, so there is nothing to
/// salvage. Every later failure degrades into a partial `PageScan`.
pub async fn collect_pages(
    client: &PortalClient,
    token: &str,
    search: &str,
    cancel: &AtomicBool,
    snapshot: &Mutex<SyncSnapshot>,
    progress: &dyn SyncProgress,
) -> Result<PageScan> {
    let mut records: Vec<RawInvoice> = Vec::new();
    let mut total_declared: i64 = 0;
    let mut state = None;
    let mut page: u32 = 1;
    let mut pages_fetched: u32 = 0;
    let mut consecutive_errors: u32 = 0;
    let mut run_errors: u32 = 0;
    let mut errors: Vec<String> = Vec::new();
    let mut complete = false;

    loop {
        if cancel.load(Ordering::SeqCst) {
            log::info!("Listing scan cancelled at page {page}");
            errors.push("sync cancelled during listing scan".to_string());
            break;
        }

        match retry_api!(client.fetch_page(token, search, page, state.as_ref())) {
            Ok(listing) => {
                consecutive_errors = 0;
                total_declared = listing.total;
                records.extend(listing.datas);
                state = listing.state;
                pages_fetched += 1;

                {
                    let mut snap = snapshot.lock().unwrap();
                    snap.total_discovered = total_declared;
                    snap.processed = records.len();
                    snap.current_page = page;
                    snap.total_pages = total_pages(total_declared, client.page_size());
                }
                progress.on_page(
                    records.len(),
                    total_declared,
                    percent(records.len(), total_declared),
                );

                if state.is_none() || records.len() as i64 >= total_declared {
                    complete = true;
                    break;
                }
                if pages_fetched >= MAX_PAGES {
                    log::warn!(
                        "Listing scan hit the {MAX_PAGES}-page cap with {} of {total_declared} records",
                        records.len()
                    );
                    break;
                }

                tokio::time::sleep(page_delay(total_declared, run_errors)).await;
                page += 1;
            }
            Err(e) => {
                let class = retry::classify(&e);

                // Nothing accumulated and nothing retryable: abort the run.
                if pages_fetched == 0 && !retry::is_retryable(class) {
                    return Err(Error::Api(e));
                }

                consecutive_errors += 1;
                run_errors += 1;
                let entry = format!("page {page}: {e}");
                log::warn!(
                    "Listing page failed ({consecutive_errors}/{MAX_CONSECUTIVE_PAGE_ERRORS} consecutive): {e}"
                );
                errors.push(entry.clone());
                snapshot.lock().unwrap().errors.push(entry);
                progress.on_page(
                    records.len(),
                    total_declared,
                    percent(records.len(), total_declared),
                );

                if consecutive_errors >= MAX_CONSECUTIVE_PAGE_ERRORS {
                    log::error!(
                        "Listing scan aborted after {consecutive_errors} consecutive page failures; keeping {} records",
                        records.len()
                    );
                    break;
                }

                // Wait, then retry the same cursor. Non-retryable classes
                // borrow the rate-limit schedule for the driver-level wait.
                let wait_class = if retry::is_retryable(class) {
                    class
                } else {
                    ErrorClass::RateLimited
                };
                tokio::time::sleep(retry::backoff_delay(wait_class, consecutive_errors - 1)).await;
            }
        }
    }

    Ok(PageScan {
        records,
        total_declared,
        pages_fetched,
        complete,
        errors,
    })
}

fn total_pages(total_declared: i64, page_size: u32) -> u32 {
    if total_declared <= 0 || page_size == 0 {
        return 0;
    }
    ((total_declared + page_size as i64 - 1) / page_size as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::mock::MockTransport;
    use crate::sync::NoopProgress;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const LISTING: &str = "/api/query/invoices/purchase";

    fn client_with(mock: &MockTransport) -> PortalClient {
        PortalClient::with_transport("https://portal.example/api", Arc::new(mock.clone()))
            .unwrap()
            .with_min_interval(Duration::from_millis(0))
    }

    fn page_json(count: usize, start: usize, total: i64, state: Option<&str>) -> String {
        let datas: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"sellerTaxId": "0100233488", "seriesCode": "C24T",
                        "documentNumber": "{}", "templateCode": "1"}}"#,
                    start + i
                )
            })
            .collect();
        match state {
            Some(s) => format!(
                r#"{{"datas": [{}], "total": {total}, "state": "{s}"}}"#,
                datas.join(",")
            ),
            None => format!(r#"{{"datas": [{}], "total": {total}}}"#, datas.join(",")),
        }
    }

    async fn scan(mock: &MockTransport) -> Result<PageScan> {
        let client = client_with(mock);
        let cancel = AtomicBool::new(false);
        let snapshot = Mutex::new(SyncSnapshot::default());
        collect_pages(&client, "tok", "search", &cancel, &snapshot, &NoopProgress).await
    }

    #[tokio::test(start_paused = true)]
    async fn single_page_when_total_fits_in_one_page() {
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(30, 0, 30, Some("tok1")));

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 30);
        assert_eq!(result.pages_fetched, 1);
        assert!(result.complete);
        assert!(result.errors.is_empty());

        // The returned cursor is never dereferenced.
        let reqs = mock.requests();
        assert_eq!(reqs.len(), 1);
        assert!(!reqs[0].url.contains("state="));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_chain_is_followed_until_exhaustion() {
        // Scenario: 180 records across 4 pages, tok1 -> tok2 -> tok3 -> absent.
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(50, 0, 180, Some("tok1")));
        mock.push_json(LISTING, 200, &page_json(50, 50, 180, Some("tok2")));
        mock.push_json(LISTING, 200, &page_json(50, 100, 180, Some("tok3")));
        mock.push_json(LISTING, 200, &page_json(30, 150, 180, None));

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 180);
        assert_eq!(result.total_declared, 180);
        assert_eq!(result.pages_fetched, 4);
        assert!(result.complete);

        let reqs = mock.requests();
        assert_eq!(reqs.len(), 4);
        assert!(!reqs[0].url.contains("state="));
        assert!(reqs[1].url.contains("state=tok1"));
        assert!(reqs[2].url.contains("state=tok2"));
        assert!(reqs[3].url.contains("state=tok3"));
    }

    #[tokio::test(start_paused = true)]
    async fn declared_total_ends_the_scan_even_with_a_cursor_present() {
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(50, 0, 80, Some("tok1")));
        mock.push_json(LISTING, 200, &page_json(30, 50, 80, Some("tok2")));

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 80);
        assert!(result.complete);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_is_retried_on_the_same_cursor() {
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(50, 0, 100, Some("tok1")));
        mock.push_status(LISTING, 500);
        mock.push_json(LISTING, 200, &page_json(50, 50, 100, None));

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 100);
        assert!(result.complete);
        assert_eq!(result.errors.len(), 1);

        let reqs = mock.requests();
        assert_eq!(reqs.len(), 3);
        // The failed fetch and its driver-level retry both carry tok1.
        assert!(reqs[1].url.contains("state=tok1"));
        assert!(reqs[2].url.contains("state=tok1"));
        assert!(reqs[1].url.contains("page=2"));
        assert!(reqs[2].url.contains("page=2"));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_keeps_accumulated_records() {
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(50, 0, 200, Some("tok1")));
        mock.push_status(LISTING, 500);
        mock.push_status(LISTING, 500);
        mock.push_status(LISTING, 500);

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 50);
        assert!(!result.complete);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(mock.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_succeeds_within_the_retry_budget() {
        // Scenario: 429 on attempts 1 and 2, success on attempt 3. Total
        // elapsed time must cover the first two backoff delays (2s + 5s).
        let mock = MockTransport::new();
        mock.push_status(LISTING, 429);
        mock.push_status(LISTING, 429);
        mock.push_json(LISTING, 200, &page_json(20, 0, 20, None));

        let start = Instant::now();
        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 20);
        assert!(result.complete);
        assert!(result.errors.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_on_the_first_call_aborts_the_run() {
        let mock = MockTransport::new();
        mock.push_status(LISTING, 401);

        let err = scan(&mock).await.unwrap_err();
        match err {
            Error::Api(crate::api::ApiError::Status { status, .. }) => assert_eq!(status, 401),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_after_progress_degrades_to_partial() {
        let mock = MockTransport::new();
        mock.push_json(LISTING, 200, &page_json(50, 0, 200, Some("tok1")));
        mock.push_status(LISTING, 401);
        mock.push_status(LISTING, 401);
        mock.push_status(LISTING, 401);

        let result = scan(&mock).await.unwrap();
        assert_eq!(result.records.len(), 50);
        assert!(!result.complete);
        assert_eq!(result.errors.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_the_next_fetch() {
        let mock = MockTransport::new();
        let client = client_with(&mock);
        let cancel = AtomicBool::new(true);
        let snapshot = Mutex::new(SyncSnapshot::default());

        let result = collect_pages(&client, "tok", "s", &cancel, &snapshot, &NoopProgress)
            .await
            .unwrap();
        assert!(result.records.is_empty());
        assert!(!result.complete);
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn page_delay_scales_with_volume_and_errors() {
        assert_eq!(page_delay(100, 0), Duration::from_millis(1000));
        assert_eq!(page_delay(501, 0), Duration::from_millis(1500));
        assert_eq!(page_delay(1001, 0), Duration::from_millis(2000));
        assert_eq!(page_delay(100, 2), Duration::from_millis(3000));
        assert_eq!(page_delay(1001, 3), Duration::from_millis(5000));
    }

    #[test]
    fn percent_is_clamped_and_zero_safe() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
        assert_eq!(percent(10, -1), 0);
    }
}
