//! HTTP layer: status mapping and retry.
//!
//! This is the ONLY place for status code handling. client/mod.rs never
//! interprets status codes.

use std::time::Duration;

use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{ResilienceError, ResilienceResult};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// HTTP backend for config requests (holds reqwest client and retry budget).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) max_retries: u32,
}

impl HttpBackend {
    /// GET `url` and decode the JSON body, retrying transient failures.
    pub(crate) async fn get_json(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> ResilienceResult<serde_json::Value> {
        let response = self.request(url, token).await?;
        response
            .json()
            .await
            .map_err(|e| ResilienceError::InvalidResponse {
                message: format!("failed to decode config body: {}", e),
            })
    }

    async fn request(&self, url: &str, token: Option<&str>) -> ResilienceResult<reqwest::Response> {
        let mut attempt = 0;

        loop {
            let err = match self.request_once(url, token).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }

            attempt += 1;
            let delay = backoff_for(&err, attempt);
            warn!(
                url,
                error = %err,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "config request failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn request_once(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> ResilienceResult<reqwest::Response> {
        let mut request = self.client.get(url);

        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("UpToken {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "config response");

        match status {
            s if s.is_success() => Ok(response),

            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ResilienceError::Unauthorized {
                message: "invalid or expired upload token".to_string(),
            }),

            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);

                Err(ResilienceError::RateLimited { retry_after })
            }

            _ => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                let message: String = message.chars().take(200).collect();
                Err(ResilienceError::Network {
                    message: format!("HTTP {}: {}", status.as_u16(), message),
                })
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// A server-provided `Retry-After` is honoured within +/-10%, capped at
/// `MAX_BACKOFF`. Otherwise full jitter over an exponential window.
fn backoff_for(err: &ResilienceError, attempt: u32) -> Duration {
    let mut rng = rand::thread_rng();

    if let ResilienceError::RateLimited {
        retry_after: Some(retry_after),
    } = err
    {
        let hinted = (*retry_after).min(MAX_BACKOFF).as_millis() as f64;
        let ms = (hinted * rng.gen_range(0.9_f64..=1.1_f64)).round() as u64;
        return Duration::from_millis(ms.max(100));
    }

    let window = Duration::from_secs(1u64 << attempt.min(5)).min(MAX_BACKOFF);
    Duration::from_millis(rng.gen_range(0..=window.as_millis() as u64).max(10))
}
