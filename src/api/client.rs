use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::api::transport::{HttpRequest, HttpTransport, ReqwestTransport, TransportError};
use crate::api::types::{DetailRecord, DetailResponse, InvoiceKey, ListingPage, PageToken};
use crate::sync::scheduler::RequestScheduler;

/// Fixed timeout applied to every portal call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_PAGE_SIZE: u32 = 50;
const LISTING_PATH: &str = "query/invoices/purchase";
const DETAIL_PATH: &str = "query/invoices/detail";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("invalid portal URL: {0}")]
    Url(String),
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => ApiError::Timeout,
            TransportError::Transport(msg) => ApiError::Transport(msg),
            #[cfg(test)]
            TransportError::NoMockResponse(path) => {
                ApiError::Transport(format!("no mock response for {path}"))
            }
        }
    }
}

/// Client for the tax portal's invoice endpoints.
///
/// All calls go through one [`RequestScheduler`] lane, so listing and
/// detail fetches never exceed the portal's tolerated request rate no
/// matter which pipeline stage issues them. The bearer token is a per-call
/// argument: callers may rotate tokens between runs without rebuilding
/// the client.
pub struct PortalClient {
    transport: Arc<dyn HttpTransport>,
    scheduler: RequestScheduler,
    base_url: Url,
    page_size: u32,
}

impl PortalClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(DEFAULT_TIMEOUT)?;
        Self::with_transport(base_url, Arc::new(transport))
    }

    pub fn with_transport(
        base_url: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ApiError> {
        // A trailing slash keeps Url::join from eating the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|e| ApiError::Url(e.to_string()))?;
        Ok(Self {
            transport,
            scheduler: RequestScheduler::new(),
            base_url,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.scheduler = RequestScheduler::with_interval(interval);
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one listing page. The first page of a scan passes no state
    /// token; later pages resume from the token the previous page returned.
    pub async fn fetch_page(
        &self,
        token: &str,
        search: &str,
        page: u32,
        state: Option<&PageToken>,
    ) -> Result<ListingPage, ApiError> {
        let mut params: Vec<(&str, String)> = vec![
            ("sort", "issueDate:desc".to_string()),
            ("size", self.page_size.to_string()),
            ("page", page.to_string()),
            ("search", search.to_string()),
        ];
        if let Some(state) = state {
            params.push(("state", state.as_str().to_string()));
        }
        self.get_json(token, LISTING_PATH, &params).await
    }

    /// Fetch line items for one invoice, keyed by its full identity.
    pub async fn fetch_details(
        &self,
        token: &str,
        key: &InvoiceKey,
    ) -> Result<Vec<DetailRecord>, ApiError> {
        let params: Vec<(&str, String)> = vec![
            ("sellerTaxId", key.seller_tax_id.clone()),
            ("seriesCode", key.series_code.clone()),
            ("documentNumber", key.document_number.clone()),
            ("templateCode", key.template_code.clone()),
        ];
        let resp: DetailResponse = self.get_json(token, DETAIL_PATH, &params).await?;
        Ok(resp.datas)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::Url(e.to_string()))?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));

        // Throttle every attempt, retries included: the last-dispatch
        // timestamp must reflect what actually went out on the wire.
        self.scheduler.throttle().await;

        let request = HttpRequest {
            url: url.into(),
            headers: vec![("Authorization".to_string(), format!("Bearer {token}"))],
        };
        let resp = self.transport.send(request).await?;

        if resp.status >= 400 {
            return Err(ApiError::Status {
                status: resp.status,
                message: body_snippet(&resp.body),
            });
        }

        serde_json::from_slice(&resp.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let snippet: String = trimmed.chars().take(200).collect();
        format!("{snippet}...")
    } else {
        trimmed.to_string()
    }
}
