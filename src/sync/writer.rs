use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::api::{InvoiceKey, PortalClient, RawInvoice};
use crate::storage::{repository, Database};
use crate::sync::retry::retry_api;
use crate::sync::{SyncOptions, SyncProgress, SyncSnapshot};

/// What the write stage accomplished.
#[derive(Debug, Default)]
pub(crate) struct WriteOutcome {
    pub saved: u64,
    pub details_saved: u64,
    pub batches_completed: u32,
    pub batches_total: u32,
    pub errors: Vec<String>,
}

/// Persist accepted records in bounded batches: dedup against storage,
/// one writer transaction per batch, inline detail enrichment for each
/// saved invoice, and a fixed pause between batches as backpressure on
/// the write path (the read-side scheduler throttles the detail fetches
/// independently).
pub(crate) async fn write_in_batches(
    db: &Database,
    client: &PortalClient,
    token: &str,
    records: &[RawInvoice],
    options: &SyncOptions,
    cancel: &AtomicBool,
    snapshot: &Mutex<SyncSnapshot>,
    progress: &dyn SyncProgress,
) -> WriteOutcome {
    let batch_size = options.batch_size.max(1);
    let batches_total = records.len().div_ceil(batch_size) as u32;
    let mut outcome = WriteOutcome {
        batches_total,
        ..Default::default()
    };

    for (index, batch) in records.chunks(batch_size).enumerate() {
        if cancel.load(Ordering::SeqCst) {
            log::info!("Write stage cancelled before batch {}", index + 1);
            push_error(
                &mut outcome,
                snapshot,
                format!("sync cancelled before batch {}", index + 1),
            );
            break;
        }

        let accepted = filter_existing(db, batch, options, &mut outcome, snapshot).await;

        match save_batch(db, &accepted).await {
            Ok(saved) => {
                outcome.saved += saved.len() as u64;
                outcome.batches_completed += 1;
                snapshot.lock().unwrap().saved = outcome.saved;

                if options.include_details {
                    for (invoice_id, key) in &saved {
                        match enrich_invoice(db, client, token, *invoice_id, key).await {
                            Ok(count) => {
                                outcome.details_saved += count as u64;
                                snapshot.lock().unwrap().details_saved = outcome.details_saved;
                            }
                            Err(msg) => {
                                // The parent row stays; only the run's
                                // error list records the miss.
                                log::warn!("{msg}");
                                push_error(&mut outcome, snapshot, msg);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Batch {} failed to persist: {e}", index + 1);
                push_error(&mut outcome, snapshot, format!("batch {}: {e}", index + 1));
            }
        }

        let percent = ((index as u64 + 1) * 100 / batches_total.max(1) as u64).min(100) as u8;
        progress.on_batch(index + 1, batches_total as usize, percent);

        if index + 1 < batches_total as usize {
            tokio::time::sleep(options.batch_delay).await;
        }
    }

    outcome
}

fn push_error(outcome: &mut WriteOutcome, snapshot: &Mutex<SyncSnapshot>, message: String) {
    snapshot.lock().unwrap().errors.push(message.clone());
    outcome.errors.push(message);
}

/// Drop records that already exist locally. Incomplete identities are
/// never checked: the write goes through and the UNIQUE constraint over
/// the identity tuple arbitrates. A failed check is treated the same
/// way, recorded as an error.
async fn filter_existing(
    db: &Database,
    batch: &[RawInvoice],
    options: &SyncOptions,
    outcome: &mut WriteOutcome,
    snapshot: &Mutex<SyncSnapshot>,
) -> Vec<RawInvoice> {
    let mut accepted = Vec::with_capacity(batch.len());
    for record in batch {
        let key = record.key();
        if options.skip_existing && key.is_complete() {
            let check = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| repository::invoice_exists(conn, &key)
                })
                .await;
            match check {
                Ok(true) => {
                    log::debug!("Skipping existing invoice {key}");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    push_error(
                        outcome,
                        snapshot,
                        format!("existence check for {key}: {e}"),
                    );
                }
            }
        }
        accepted.push(record.clone());
    }
    accepted
}

/// Write one batch inside a single transaction, returning the local row
/// id and identity of every saved invoice.
async fn save_batch(
    db: &Database,
    accepted: &[RawInvoice],
) -> Result<Vec<(i64, InvoiceKey)>, crate::error::Error> {
    if accepted.is_empty() {
        return Ok(Vec::new());
    }
    let accepted = accepted.to_vec();
    let saved = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut out = Vec::with_capacity(accepted.len());
            for record in &accepted {
                let id = repository::upsert_invoice(&tx, record)?;
                out.push((id, record.key()));
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(out)
        })
        .await?;
    Ok(saved)
}

/// Fetch and store line items for one saved invoice. Incomplete identity
/// and an empty remote result are both a clean zero, not an error.
async fn enrich_invoice(
    db: &Database,
    client: &PortalClient,
    token: &str,
    invoice_id: i64,
    key: &InvoiceKey,
) -> Result<usize, String> {
    if !key.is_complete() {
        log::debug!("Invoice {invoice_id} has an incomplete identity, skipping detail fetch");
        return Ok(0);
    }

    let details = retry_api!(client.fetch_details(token, key))
        .map_err(|e| format!("detail fetch for {key}: {e}"))?;
    if details.is_empty() {
        return Ok(0);
    }

    let count = details.len();
    db.writer()
        .call(move |conn| repository::replace_invoice_details(conn, invoice_id, &details))
        .await
        .map_err(|e| format!("saving details for {key}: {e}"))?;
    Ok(count)
}
