//! Batch live-value reads over HTTP.
//!
//! Used for one-shot reads and as the degraded polling path while the push
//! channel is down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::{
    error::{PvLinkError, Result},
    models::{ApiResponse, PvValue},
};

/// Default path of the batch live-values endpoint.
pub const DEFAULT_LIVE_VALUES_PATH: &str = "/api/v1/pvs/live";

/// Fetches current values for a list of PV names.
#[derive(Clone)]
pub struct LiveValuesFetcher {
    url: String,
    http_client: reqwest::Client,
    max_retries: u32,
}

impl LiveValuesFetcher {
    pub fn new(base_url: &str, path: &str, http_client: reqwest::Client) -> Self {
        Self {
            url: join_url(base_url, path),
            http_client,
            max_retries: 3,
        }
    }

    /// Retries after timeouts and connection failures. Default 3.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the current values of `pv_names`.
    ///
    /// Names the backend does not know are simply absent from the result.
    pub async fn fetch(&self, pv_names: &[String]) -> Result<HashMap<String, PvValue>> {
        if pv_names.is_empty() {
            return Ok(HashMap::new());
        }
        let query: Vec<(&str, &str)> = pv_names.iter().map(|name| ("pv_names", name.as_str())).collect();

        let mut retries = 0;
        let overall_start = Instant::now();
        loop {
            let attempt_start = Instant::now();
            debug!(
                "[LIVE_VALUES] GET {} for {} PV(s) (attempt {}/{})",
                self.url,
                pv_names.len(),
                retries + 1,
                self.max_retries + 1
            );

            match self.http_client.get(&self.url).query(&query).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await?;
                    debug!(
                        "[LIVE_VALUES] Response: status={} bytes={} duration_ms={}",
                        status,
                        body.len(),
                        attempt_start.elapsed().as_millis()
                    );
                    return Self::decode(status, &body);
                },
                Err(e) if retries < self.max_retries && Self::is_retriable(&e) => {
                    warn!(
                        "[LIVE_VALUES] Retriable error (attempt {}/{}): {}",
                        retries + 1,
                        self.max_retries + 1,
                        e
                    );
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * retries as u64)).await;
                },
                Err(e) => {
                    warn!(
                        "[LIVE_VALUES] Request failed: {} total_ms={}",
                        e,
                        overall_start.elapsed().as_millis()
                    );
                    return Err(e.into());
                },
            }
        }
    }

    fn decode(status: reqwest::StatusCode, body: &str) -> Result<HashMap<String, PvValue>> {
        // Error responses usually still carry the envelope; prefer its message.
        let envelope = serde_json::from_str::<ApiResponse<HashMap<String, JsonValue>>>(body);
        if !status.is_success() {
            let message = match &envelope {
                Ok(envelope) if !envelope.is_success() => envelope.error_text(),
                _ if body.trim().is_empty() => status.to_string(),
                _ => body.to_string(),
            };
            warn!("[LIVE_VALUES] Server error: status={} message=\"{}\"", status, message);
            return Err(PvLinkError::ServerError {
                status_code: status.as_u16(),
                message,
            });
        }

        let envelope = envelope?;
        if !envelope.is_success() {
            return Err(PvLinkError::ServerError {
                status_code: status.as_u16(),
                message: envelope.error_text(),
            });
        }
        // One bad sample must not hide the others.
        Ok(PvValue::decode_batch(envelope.payload.unwrap_or_default())
            .into_iter()
            .collect())
    }

    fn is_retriable(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

/// Join a base URL and an endpoint path with exactly one slash.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
