use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::api::{DetailRecord, InvoiceKey, RawInvoice};

// ── Invoices ───────────────────────────────────────────────────────

/// Upsert one invoice and return its local row id.
///
/// The UNIQUE constraint over the identity 4-tuple is the authoritative
/// dedup guard: records whose remote existence check was skipped or
/// failed still land exactly once.
pub fn upsert_invoice(conn: &Connection, invoice: &RawInvoice) -> Result<i64, rusqlite::Error> {
    let payload =
        serde_json::to_string(&invoice.payload).unwrap_or_else(|_| "{}".to_string());

    conn.query_row(
        "INSERT INTO fact_invoices (
            seller_tax_id, series_code, document_number, template_code,
            issue_date, seller_name, buyer_name, buyer_tax_id,
            total_amount, status, payload, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
        ON CONFLICT(seller_tax_id, series_code, document_number, template_code) DO UPDATE SET
            issue_date=excluded.issue_date, seller_name=excluded.seller_name,
            buyer_name=excluded.buyer_name, buyer_tax_id=excluded.buyer_tax_id,
            total_amount=excluded.total_amount, status=excluded.status,
            payload=excluded.payload, cached_at=excluded.cached_at
        RETURNING invoice_id",
        params![
            invoice.seller_tax_id,
            invoice.series_code,
            invoice.document_number,
            invoice.template_code,
            invoice.payload_str("issueDate"),
            invoice.payload_str("sellerName"),
            invoice.payload_str("buyerName"),
            invoice.payload_str("buyerTaxId"),
            invoice.payload_f64("totalAmount"),
            invoice.payload_i64("status"),
            payload,
        ],
        |row| row.get(0),
    )
}

/// Check whether an invoice with this identity is already stored.
pub fn invoice_exists(conn: &Connection, key: &InvoiceKey) -> Result<bool, rusqlite::Error> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT invoice_id FROM fact_invoices
             WHERE seller_tax_id = ?1 AND series_code = ?2
               AND document_number = ?3 AND template_code = ?4",
            params![
                key.seller_tax_id,
                key.series_code,
                key.document_number,
                key.template_code
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.is_some())
}

pub fn find_invoice_id(
    conn: &Connection,
    key: &InvoiceKey,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT invoice_id FROM fact_invoices
         WHERE seller_tax_id = ?1 AND series_code = ?2
           AND document_number = ?3 AND template_code = ?4",
        params![
            key.seller_tax_id,
            key.series_code,
            key.document_number,
            key.template_code
        ],
        |row| row.get(0),
    )
    .optional()
}

// ── Invoice details ────────────────────────────────────────────────

/// Replace the stored line items of one invoice. Delete-then-insert keeps
/// re-enrichment idempotent when an invoice is synced again.
pub fn replace_invoice_details(
    conn: &Connection,
    invoice_id: i64,
    details: &[DetailRecord],
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM fact_invoice_details WHERE invoice_id = ?1",
        params![invoice_id],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO fact_invoice_details (
            invoice_id, line_number, item_name, quantity, unit_price, amount, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for detail in details {
        let payload =
            serde_json::to_string(&detail.payload).unwrap_or_else(|_| "{}".to_string());
        stmt.execute(params![
            invoice_id,
            detail.line_number,
            detail.item_name,
            detail.payload_f64("quantity"),
            detail.payload_f64("unitPrice"),
            detail.payload_f64("amount"),
            payload,
        ])?;
    }
    Ok(details.len())
}

// ── Warehouse queries ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRow {
    pub invoice_id: i64,
    pub seller_tax_id: String,
    pub series_code: String,
    pub document_number: String,
    pub template_code: String,
    pub issue_date: Option<String>,
    pub seller_name: Option<String>,
    pub buyer_name: Option<String>,
    pub total_amount: Option<f64>,
    pub status: Option<i64>,
}

/// List stored invoices, optionally filtered by seller tax id and month
/// (`mm/yyyy`, matched against the dd/mm/yyyy issue date).
pub fn list_invoices(
    conn: &Connection,
    seller_tax_id: Option<&str>,
    month: Option<&str>,
    limit: u32,
) -> Result<Vec<InvoiceRow>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT invoice_id, seller_tax_id, series_code, document_number, template_code,
                issue_date, seller_name, buyer_name, total_amount, status
         FROM fact_invoices WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(seller) = seller_tax_id {
        sql.push_str(&format!(" AND seller_tax_id = ?{}", args.len() + 1));
        args.push(Box::new(seller.to_string()));
    }
    if let Some(month) = month {
        sql.push_str(&format!(" AND substr(issue_date, 4, 7) = ?{}", args.len() + 1));
        args.push(Box::new(month.to_string()));
    }
    sql.push_str(&format!(" ORDER BY invoice_id DESC LIMIT ?{}", args.len() + 1));
    args.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let rows = stmt.query_map(&params[..], |row| {
        Ok(InvoiceRow {
            invoice_id: row.get(0)?,
            seller_tax_id: row.get(1)?,
            series_code: row.get(2)?,
            document_number: row.get(3)?,
            template_code: row.get(4)?,
            issue_date: row.get(5)?,
            seller_name: row.get(6)?,
            buyer_name: row.get(7)?,
            total_amount: row.get(8)?,
            status: row.get(9)?,
        })
    })?;
    rows.collect()
}

pub fn count_invoices(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM fact_invoices", [], |row| row.get(0))
}

pub fn count_details(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM fact_invoice_details", [], |row| {
        row.get(0)
    })
}

// ── Sync jobs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SyncJobRow {
    pub job_id: i64,
    pub search_query: String,
    pub status: String,
    pub invoices_saved: u64,
    pub details_saved: u64,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

pub fn insert_sync_job(
    conn: &Connection,
    search_query: &str,
    range_start: Option<&str>,
    range_end: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (search_query, range_start, range_end, status, started_at)
         VALUES (?1, ?2, ?3, 'running', datetime('now'))",
        params![search_query, range_start, range_end],
    )?;
    Ok(conn.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub fn update_sync_job(
    conn: &Connection,
    job_id: i64,
    status: &str,
    invoices_saved: u64,
    details_saved: u64,
    batches_completed: u32,
    batches_total: u32,
    error: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?2, invoices_saved = ?3, details_saved = ?4,
            batches_completed = ?5, batches_total = ?6, error = ?7,
            finished_at = datetime('now')
         WHERE job_id = ?1",
        params![
            job_id,
            status,
            invoices_saved,
            details_saved,
            batches_completed,
            batches_total,
            error
        ],
    )?;
    Ok(())
}

pub fn list_recent_jobs(conn: &Connection, limit: u32) -> Result<Vec<SyncJobRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT job_id, search_query, status, invoices_saved, details_saved,
                error, started_at, finished_at
         FROM sync_jobs ORDER BY job_id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncJobRow {
            job_id: row.get(0)?,
            search_query: row.get(1)?,
            status: row.get(2)?,
            invoices_saved: row.get(3)?,
            details_saved: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
        })
    })?;
    rows.collect()
}

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}
