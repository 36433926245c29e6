use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque pagination token returned by the listing endpoint.
///
/// The portal resumes a listing scan from this value. Callers must not
/// parse or fabricate it; it only travels back into the `state` query
/// parameter of the next page request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One page from the listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub datas: Vec<RawInvoice>,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub state: Option<PageToken>,
}

/// An invoice as returned by the listing endpoint: four typed identity
/// fields plus whatever business fields the portal attaches.
///
/// The portal payload varies by invoice template, so everything beyond
/// the identity is kept as an open map rather than a fixed struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInvoice {
    #[serde(default)]
    pub seller_tax_id: String,
    #[serde(default)]
    pub series_code: String,
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub template_code: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RawInvoice {
    pub fn key(&self) -> InvoiceKey {
        InvoiceKey {
            seller_tax_id: self.seller_tax_id.clone(),
            series_code: self.series_code.clone(),
            document_number: self.document_number.clone(),
            template_code: self.template_code.clone(),
        }
    }

    /// String payload field, if present and non-null.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Numeric payload field. The portal serializes amounts both as JSON
    /// numbers and as numeric strings, so accept either.
    pub fn payload_f64(&self, field: &str) -> Option<f64> {
        match self.payload.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn payload_i64(&self, field: &str) -> Option<i64> {
        match self.payload.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// The 4-tuple identifying an invoice both on the portal and locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceKey {
    pub seller_tax_id: String,
    pub series_code: String,
    pub document_number: String,
    pub template_code: String,
}

impl InvoiceKey {
    pub fn new(
        seller_tax_id: impl Into<String>,
        series_code: impl Into<String>,
        document_number: impl Into<String>,
        template_code: impl Into<String>,
    ) -> Self {
        Self {
            seller_tax_id: seller_tax_id.into(),
            series_code: series_code.into(),
            document_number: document_number.into(),
            template_code: template_code.into(),
        }
    }

    /// A key is complete only when all four fields are non-empty.
    /// Incomplete keys cannot be used for detail fetches or remote
    /// existence checks; the local uniqueness constraint still applies.
    pub fn is_complete(&self) -> bool {
        !self.seller_tax_id.is_empty()
            && !self.series_code.is_empty()
            && !self.document_number.is_empty()
            && !self.template_code.is_empty()
    }
}

impl fmt::Display for InvoiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}/{}",
            self.seller_tax_id, self.template_code, self.series_code, self.document_number
        )
    }
}

/// One line item belonging to an invoice, from the detail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailRecord {
    #[serde(default)]
    pub line_number: Option<i64>,
    #[serde(default)]
    pub item_name: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl DetailRecord {
    pub fn payload_f64(&self, field: &str) -> Option<f64> {
        match self.payload.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Response envelope of the detail endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DetailResponse {
    #[serde(default)]
    pub datas: Vec<DetailRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_page_deserializes_with_and_without_state() {
        let with_state = r#"{
            "datas": [{"sellerTaxId": "0100233488", "seriesCode": "C24T",
                       "documentNumber": "123", "templateCode": "1",
                       "totalAmount": 1500000, "sellerName": "ACME Co"}],
            "total": 180,
            "state": "tok1"
        }"#;
        let page: ListingPage = serde_json::from_str(with_state).unwrap();
        assert_eq!(page.datas.len(), 1);
        assert_eq!(page.total, 180);
        assert_eq!(page.state.as_ref().unwrap().as_str(), "tok1");
        assert_eq!(page.datas[0].payload_f64("totalAmount"), Some(1_500_000.0));
        assert_eq!(page.datas[0].payload_str("sellerName"), Some("ACME Co"));

        let last_page = r#"{"datas": [], "total": 180}"#;
        let page: ListingPage = serde_json::from_str(last_page).unwrap();
        assert!(page.state.is_none());
    }

    #[test]
    fn missing_identity_fields_default_to_empty() {
        let body = r#"{"sellerTaxId": "0100233488", "documentNumber": "9"}"#;
        let inv: RawInvoice = serde_json::from_str(body).unwrap();
        assert_eq!(inv.series_code, "");
        assert_eq!(inv.template_code, "");
        assert!(!inv.key().is_complete());
    }

    #[test]
    fn key_completeness_requires_all_four_fields() {
        let complete = InvoiceKey::new("0123456789", "C24T", "123", "01");
        assert!(complete.is_complete());

        let missing_series = InvoiceKey::new("0123456789", "", "123", "01");
        assert!(!missing_series.is_complete());
    }

    #[test]
    fn payload_numbers_accept_numeric_strings() {
        let body = r#"{"sellerTaxId": "1", "seriesCode": "A", "documentNumber": "2",
                       "templateCode": "1", "totalAmount": "2500.50", "status": 3}"#;
        let inv: RawInvoice = serde_json::from_str(body).unwrap();
        assert_eq!(inv.payload_f64("totalAmount"), Some(2500.50));
        assert_eq!(inv.payload_i64("status"), Some(3));
        assert_eq!(inv.payload_i64("missing"), None);
    }
}
