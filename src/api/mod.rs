pub mod client;
pub mod transport;
pub mod types;

pub use client::{ApiError, PortalClient};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
pub use types::{DetailRecord, InvoiceKey, ListingPage, PageToken, RawInvoice};
