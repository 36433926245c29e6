pub mod api;
pub mod date_util;
pub mod error;
pub mod query;
pub mod storage;
pub mod sync;

pub use api::{ApiError, DetailRecord, InvoiceKey, PortalClient, RawInvoice};
pub use error::{Error, Result};
pub use query::SyncFilter;
pub use storage::Database;
pub use sync::{
    NoopProgress, SyncOptions, SyncProgress, SyncReport, SyncSnapshot, SyncStatus,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use storage::repository;
use sync::syncer;

/// Main entry point for the invoice warehouse.
///
/// Owns the single-flight guard, the cancellation flag and the progress
/// snapshot as explicit instance state; one `InvoiceDW` per process (or
/// injected as a shared service) replaces any notion of global mutable
/// sync state.
pub struct InvoiceDW {
    db: Database,
    client: PortalClient,
    running: AtomicBool,
    cancel: Arc<AtomicBool>,
    snapshot: Arc<Mutex<SyncSnapshot>>,
}

impl InvoiceDW {
    pub fn new(db: Database, client: PortalClient) -> Self {
        Self {
            db,
            client,
            running: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(Mutex::new(SyncSnapshot::default())),
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run one sync. Returns [`Error::SyncInProgress`] instead of queuing
    /// when another run (bulk or single-record) is still active.
    pub async fn sync(
        &self,
        token: &str,
        filter: &SyncFilter,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        let _guard = self.acquire_run_slot()?;
        self.cancel.store(false, Ordering::SeqCst);

        syncer::run_sync(
            &self.db,
            &self.client,
            token,
            filter,
            options,
            &self.cancel,
            &self.snapshot,
            progress,
        )
        .await
    }

    /// Re-sync a single invoice by identity, outside the bulk pipeline.
    pub async fn retry_invoice(
        &self,
        token: &str,
        key: &InvoiceKey,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        let _guard = self.acquire_run_slot()?;
        syncer::retry_invoice(&self.db, &self.client, token, key, options).await
    }

    /// Snapshot of the current (or last) run's progress.
    pub fn progress(&self) -> SyncSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    /// Ask a running sync to stop at its next page or batch boundary.
    /// In-flight calls always run to completion.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn acquire_run_slot(&self) -> Result<RunSlot<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SyncInProgress);
        }
        Ok(RunSlot {
            running: &self.running,
        })
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

/// Releases the single-flight slot when a run finishes, error paths
/// included.
struct RunSlot<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
