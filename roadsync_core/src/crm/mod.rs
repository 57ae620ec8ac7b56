//! HubSpot CRM access: the HTTP seam and the retrying client built on it.

pub mod client;
pub mod transport;

pub use client::{CrmClient, MAX_RETRIES, backoff_delay};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestBody, ReqwestTransport,
};
