use crate::crm::transport::{HttpMethod, HttpRequest, HttpTransport, RequestBody};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Extra attempts after the first 429.
pub const MAX_RETRIES: u32 = 3;

/// Delay before retry `attempt` (0-indexed): 1s, 2s, 4s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

/// Authenticated JSON calls against the CRM API with 429 backoff.
///
/// Knows nothing about what is fetched; callers pass a path relative to the
/// API base and get the parsed body back.
#[derive(Clone)]
pub struct CrmClient {
    transport: Arc<dyn HttpTransport>,
    api_base: String,
}

impl CrmClient {
    pub fn new(transport: Arc<dyn HttpTransport>, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            transport,
            api_base,
        }
    }

    pub async fn get(&self, token: &str, path: &str) -> Result<serde_json::Value> {
        self.request(token, HttpMethod::Get, path, None).await
    }

    pub async fn post(
        &self,
        token: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(token, HttpMethod::Post, path, Some(body)).await
    }

    #[tracing::instrument(level = "debug", skip(self, token, body))]
    pub async fn request(
        &self,
        token: &str,
        method: HttpMethod,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let request = HttpRequest {
            method,
            url,
            bearer: Some(token.to_string()),
            body: body.map(RequestBody::Json),
        };

        for attempt in 0..=MAX_RETRIES {
            let resp = self.transport.send(request.clone()).await?;

            if resp.status == 429 {
                if attempt == MAX_RETRIES {
                    break;
                }
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "crm rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !resp.is_success() {
                return Err(Error::Remote {
                    status: resp.status,
                    body: resp.body,
                });
            }

            if resp.body.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            return serde_json::from_str(&resp.body)
                .map_err(|e| Error::backend("parse crm json", e));
        }

        Err(Error::RateLimited(format!(
            "crm still rate limited after {MAX_RETRIES} retries: {path}"
        )))
    }
}
