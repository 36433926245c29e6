use chrono::{Datelike, NaiveDate};

use crate::api::InvoiceKey;
use crate::date_util::{format_ddmmyyyy, last_day_of_month};
use crate::error::{Error, Result};

/// Query criteria for a sync run, translated into the portal's search
/// DSL: `field=op=value` segments joined by `;` (AND), with a
/// parenthesized `;`-joined group for the OR across searchable columns.
///
/// Built once, then only read; the builder consumes and returns `self`,
/// so a constructed filter is never mutated.
#[derive(Debug, Clone, Default)]
pub struct SyncFilter {
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    month: Option<(i32, u32)>,
    search: Option<String>,
    status: Option<i64>,
    min_total: Option<f64>,
}

impl SyncFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_date(mut self, date: NaiveDate) -> Self {
        self.from_date = Some(date);
        self
    }

    pub fn to_date(mut self, date: NaiveDate) -> Self {
        self.to_date = Some(date);
        self
    }

    /// Sync a whole calendar month. Takes precedence over explicit dates.
    pub fn month(mut self, year: i32, month: u32) -> Self {
        self.month = Some((year, month));
        self
    }

    /// Free-text search across seller name, buyer name and document number.
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn status(mut self, status: i64) -> Self {
        self.status = Some(status);
        self
    }

    pub fn min_total(mut self, amount: f64) -> Self {
        self.min_total = Some(amount);
        self
    }

    /// The date range this filter covers. Defaults to the current month
    /// so a bare `sync` always has a bounded scan window.
    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate)> {
        if let Some((year, month)) = self.month {
            if !(1..=12).contains(&month) {
                return Err(Error::InvalidFilter(format!("month out of range: {month}")));
            }
            let first = NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or_else(|| Error::InvalidFilter(format!("invalid month: {month}/{year}")))?;
            return Ok((first, last_day_of_month(year, month)));
        }

        let today = chrono::Local::now().date_naive();
        let (from, to) = match (self.from_date, self.to_date) {
            (Some(from), Some(to)) => (from, to),
            (Some(from), None) => (from, today),
            (None, Some(to)) => (to.with_day(1).unwrap_or(to), to),
            (None, None) => (today.with_day(1).unwrap_or(today), today),
        };

        if from > to {
            return Err(Error::InvalidFilter(format!(
                "date range is inverted: {} > {}",
                format_ddmmyyyy(from),
                format_ddmmyyyy(to)
            )));
        }
        Ok((from, to))
    }

    /// Render the portal search string.
    pub fn to_query(&self) -> Result<String> {
        let (from, to) = self.date_range()?;

        let mut segments = vec![
            format!("issueDate=ge={}T00:00:00", format_ddmmyyyy(from)),
            format!("issueDate=le={}T23:59:59", format_ddmmyyyy(to)),
        ];

        if let Some(status) = self.status {
            segments.push(format!("status=eq={status}"));
        }
        if let Some(min_total) = self.min_total {
            segments.push(format!("totalAmount=ge={min_total}"));
        }
        if let Some(text) = &self.search {
            let text = text.trim();
            if text.is_empty() {
                return Err(Error::InvalidFilter("search text is empty".into()));
            }
            if text.contains([';', '(', ')', '=']) {
                return Err(Error::InvalidFilter(
                    "search text may not contain ';', '(', ')' or '='".into(),
                ));
            }
            segments.push(format!(
                "(sellerName=like={text};buyerName=like={text};documentNumber=like={text})"
            ));
        }

        Ok(segments.join(";"))
    }
}

/// Search string selecting exactly one invoice by its full identity.
/// Used by the single-record retry path.
pub fn identity_query(key: &InvoiceKey) -> String {
    format!(
        "sellerTaxId=eq={};seriesCode=eq={};documentNumber=eq={};templateCode=eq={}",
        key.seller_tax_id, key.series_code, key.document_number, key.template_code
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn explicit_date_range_renders_bounds() {
        let query = SyncFilter::new()
            .from_date(d(2024, 1, 1))
            .to_date(d(2024, 1, 31))
            .to_query()
            .unwrap();
        assert_eq!(
            query,
            "issueDate=ge=01/01/2024T00:00:00;issueDate=le=31/01/2024T23:59:59"
        );
    }

    #[test]
    fn month_expands_to_full_calendar_month() {
        let query = SyncFilter::new().month(2024, 2).to_query().unwrap();
        assert_eq!(
            query,
            "issueDate=ge=01/02/2024T00:00:00;issueDate=le=29/02/2024T23:59:59"
        );
    }

    #[test]
    fn status_and_min_total_append_and_segments() {
        let query = SyncFilter::new()
            .month(2024, 1)
            .status(1)
            .min_total(500000.0)
            .to_query()
            .unwrap();
        assert!(query.contains(";status=eq=1"));
        assert!(query.contains(";totalAmount=ge=500000"));
    }

    #[test]
    fn free_text_search_becomes_an_or_group() {
        let query = SyncFilter::new()
            .month(2024, 1)
            .search("ACME")
            .to_query()
            .unwrap();
        assert!(query
            .ends_with("(sellerName=like=ACME;buyerName=like=ACME;documentNumber=like=ACME)"));
    }

    #[test]
    fn default_range_is_the_current_month() {
        let query = SyncFilter::new().to_query().unwrap();
        assert!(query.starts_with("issueDate=ge=01/"));
        let (from, to) = SyncFilter::new().date_range().unwrap();
        assert_eq!(from.day(), 1);
        assert!(from <= to);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = SyncFilter::new()
            .from_date(d(2024, 2, 1))
            .to_date(d(2024, 1, 1))
            .to_query()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    #[test]
    fn out_of_range_month_is_rejected() {
        let err = SyncFilter::new().month(2024, 13).to_query().unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    #[test]
    fn search_text_with_dsl_characters_is_rejected() {
        let err = SyncFilter::new()
            .month(2024, 1)
            .search("a;b")
            .to_query()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    #[test]
    fn identity_query_pins_all_four_fields() {
        let key = InvoiceKey::new("0123456789", "C24T", "123", "01");
        assert_eq!(
            identity_query(&key),
            "sellerTaxId=eq=0123456789;seriesCode=eq=C24T;documentNumber=eq=123;templateCode=eq=01"
        );
    }
}
