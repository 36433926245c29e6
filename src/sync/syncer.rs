use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{InvoiceKey, PortalClient};
use crate::date_util::format_ddmmyyyy;
use crate::error::{Error, Result};
use crate::query::{identity_query, SyncFilter};
use crate::storage::{repository, Database};
use crate::sync::{
    paginator, retry, writer, NoopProgress, SyncOptions, SyncProgress, SyncReport, SyncSnapshot,
    SyncStatus,
};

/// Attempt cap for the single-invoice retry path.
const SINGLE_RETRY_ATTEMPTS: u32 = 3;
const SINGLE_RETRY_BASE_MS: u64 = 1_000;

/// Run one full sync: scan the listing, dedup, persist in batches with
/// inline enrichment, and record the run in `sync_jobs`.
///
/// Stages run strictly in sequence. The scan finishes (or gives up)
/// before the first write; a scan that aborted partway still feeds
/// whatever it accumulated into the write stage.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    db: &Database,
    client: &PortalClient,
    token: &str,
    filter: &SyncFilter,
    options: &SyncOptions,
    cancel: &AtomicBool,
    snapshot: &Mutex<SyncSnapshot>,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    *snapshot.lock().unwrap() = SyncSnapshot::default();

    let search = filter.to_query()?;
    let (from, to) = filter.date_range()?;
    log::info!("Starting sync for {search}");

    let job_id = db
        .writer()
        .call({
            let search = search.clone();
            let start = format_ddmmyyyy(from);
            let end = format_ddmmyyyy(to);
            move |conn| repository::insert_sync_job(conn, &search, Some(&start), Some(&end))
        })
        .await?;

    let scan =
        match paginator::collect_pages(client, token, &search, cancel, snapshot, progress).await {
            Ok(scan) => scan,
            Err(e) => {
                // Nothing was accumulated; the run dies on the spot.
                let message = e.to_string();
                let _ = db
                    .writer()
                    .call(move |conn| {
                        repository::update_sync_job(conn, job_id, "failed", 0, 0, 0, 0, Some(&message))
                    })
                    .await;
                snapshot.lock().unwrap().complete = true;
                return Err(e);
            }
        };

    progress.on_records_fetched(scan.records.len());
    log::info!(
        "Fetched {} of {} declared invoices across {} pages (complete: {})",
        scan.records.len(),
        scan.total_declared,
        scan.pages_fetched,
        scan.complete
    );

    let outcome = writer::write_in_batches(
        db, client, token, &scan.records, options, cancel, snapshot, progress,
    )
    .await;

    let mut errors = scan.errors;
    errors.extend(outcome.errors);
    let report = SyncReport::from_counts(
        outcome.saved,
        outcome.details_saved,
        outcome.batches_completed,
        outcome.batches_total,
        errors,
        scan.records.len(),
        scan.complete,
    );

    let job_status = match report.status {
        SyncStatus::Success => "completed",
        SyncStatus::PartialFailure => "partial_failure",
        SyncStatus::Failed => "failed",
    };
    let error_text = if report.errors.is_empty() {
        None
    } else {
        Some(report.errors.join("; "))
    };
    db.writer()
        .call({
            let report = report.clone();
            let job_status = job_status.to_string();
            move |conn| {
                repository::update_sync_job(
                    conn,
                    job_id,
                    &job_status,
                    report.invoices_saved,
                    report.details_saved,
                    report.batches_completed,
                    report.batches_total,
                    error_text.as_deref(),
                )
            }
        })
        .await?;

    snapshot.lock().unwrap().complete = true;
    progress.on_complete(&report);
    Ok(report)
}

/// Re-sync one invoice by its full identity, with its own bounded
/// exponential backoff (1s, 2s between attempts), decoupled from the
/// bulk pipeline's schedules. The record is refreshed unconditionally;
/// `skip_existing` does not apply to a manual retry.
pub async fn retry_invoice(
    db: &Database,
    client: &PortalClient,
    token: &str,
    key: &InvoiceKey,
    options: &SyncOptions,
) -> Result<SyncReport> {
    if !key.is_complete() {
        return Err(Error::InvalidIdentifier(format!(
            "incomplete invoice identity: {key}"
        )));
    }

    let search = identity_query(key);
    let mut attempt: u32 = 0;
    loop {
        match sync_single(db, client, token, &search, key, options).await {
            Ok(report) => return Ok(report),
            Err(e) => {
                let transient = match &e {
                    Error::Api(api) => retry::is_retryable(retry::classify(api)),
                    Error::NotFound(_) => false,
                    Error::Database(_) => true,
                    _ => false,
                };
                attempt += 1;
                if !transient || attempt >= SINGLE_RETRY_ATTEMPTS {
                    return Err(e);
                }
                let wait = Duration::from_millis(SINGLE_RETRY_BASE_MS << (attempt - 1));
                log::warn!(
                    "Single-invoice sync attempt {attempt}/{SINGLE_RETRY_ATTEMPTS} failed ({e}), retrying in {}ms",
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

async fn sync_single(
    db: &Database,
    client: &PortalClient,
    token: &str,
    search: &str,
    key: &InvoiceKey,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let page = client
        .fetch_page(token, search, 1, None)
        .await
        .map_err(Error::Api)?;
    let record = page.datas.into_iter().next().ok_or_else(|| {
        Error::NotFound(format!("invoice {key} not found on the portal"))
    })?;

    let forced = SyncOptions {
        skip_existing: false,
        ..options.clone()
    };
    let cancel = AtomicBool::new(false);
    let snapshot = Mutex::new(SyncSnapshot::default());
    let outcome = writer::write_in_batches(
        db,
        client,
        token,
        std::slice::from_ref(&record),
        &forced,
        &cancel,
        &snapshot,
        &NoopProgress,
    )
    .await;

    if outcome.saved == 0 {
        return Err(Error::Sync(
            outcome
                .errors
                .first()
                .cloned()
                .unwrap_or_else(|| format!("invoice {key} was not saved")),
        ));
    }

    Ok(SyncReport::from_counts(
        outcome.saved,
        outcome.details_saved,
        outcome.batches_completed,
        outcome.batches_total,
        outcome.errors,
        1,
        true,
    ))
}
