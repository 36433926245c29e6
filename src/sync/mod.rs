pub mod paginator;
pub mod retry;
pub mod scheduler;
pub mod syncer;
pub mod writer;

use std::time::Duration;

use serde::Serialize;

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Drop records that already exist locally before the write stage.
    pub skip_existing: bool,
    /// Fetch and store line items for each saved invoice.
    pub include_details: bool,
    /// Invoices per write batch.
    pub batch_size: usize,
    /// Pause between write batches, independent of the request scheduler.
    pub batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
            include_details: true,
            batch_size: 10,
            batch_delay: Duration::from_millis(1000),
        }
    }
}

/// Callbacks fired while a sync run advances. All methods default to
/// no-ops so implementors only override what they report.
pub trait SyncProgress: Send + Sync {
    /// After every listing page attempt, success or failure.
    fn on_page(&self, _processed: usize, _total: i64, _percent: u8) {}

    /// Once pagination finishes, with the full accumulated count.
    fn on_records_fetched(&self, _count: usize) {}

    /// After every write batch.
    fn on_batch(&self, _batch: usize, _total_batches: usize, _percent: u8) {}

    /// When the run completes and the report is final.
    fn on_complete(&self, _report: &SyncReport) {}
}

/// Progress reporter that reports nothing.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Run-scoped progress state, updated by the run's own sequential flow
/// and readable from outside through a polling accessor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSnapshot {
    pub total_discovered: i64,
    pub processed: usize,
    pub saved: u64,
    pub details_saved: u64,
    pub errors: Vec<String>,
    pub current_page: u32,
    pub total_pages: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Summary returned when a sync run completes.
///
/// A run that lost pages to the circuit breaker or recorded per-item
/// errors still reports whatever it saved; accumulated work is never
/// discarded with the failure.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub invoices_saved: u64,
    pub details_saved: u64,
    pub batches_completed: u32,
    pub batches_total: u32,
    pub errors: Vec<String>,
    pub message: String,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.status == SyncStatus::Success
    }

    /// Build a report from run counts. `fetch_complete` is false when
    /// pagination stopped early (circuit breaker, safety cap, or
    /// cancellation), which caps the status at PartialFailure even if no
    /// individual error was recorded.
    pub fn from_counts(
        invoices_saved: u64,
        details_saved: u64,
        batches_completed: u32,
        batches_total: u32,
        errors: Vec<String>,
        fetched: usize,
        fetch_complete: bool,
    ) -> Self {
        let status = if errors.is_empty() && fetch_complete {
            SyncStatus::Success
        } else if invoices_saved > 0 || fetched > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };

        let mut message = format!(
            "Saved {invoices_saved} of {fetched} fetched invoices ({details_saved} detail lines) in {batches_completed}/{batches_total} batches"
        );
        if !fetch_complete {
            message.push_str("; listing scan stopped early");
        }
        if !errors.is_empty() {
            message.push_str(&format!("; {} errors", errors.len()));
        }

        Self {
            status,
            invoices_saved,
            details_saved,
            batches_completed,
            batches_total,
            errors,
            message,
        }
    }
}
