use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use storm_core::errors::ProviderError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client(request_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build tuned HTTP client, using defaults");
            Client::new()
        })
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Send a JSON request and classify every failure mode.
pub(crate) async fn send_json(req: RequestBuilder, timeout: Duration) -> Result<Value, ProviderError> {
    let response = req.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::NetworkError(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(match ProviderError::from_status(status.as_u16(), body) {
            ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
            other => other,
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::MalformedResponse(e.to_string()))
}
