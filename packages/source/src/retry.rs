//! HTTP retry helper for transient errors.
//!
//! Providers should use [`send_json`] instead of calling
//! `reqwest::RequestBuilder::send()` directly so every upstream request
//! gets exponential backoff on timeouts, connection resets, server errors,
//! and rate limiting.

use std::time::Duration;

use crate::SourceError;

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With exponential backoff (2s, 4s, 8s, 16s) the total wait before giving
/// up is 30 seconds.
const MAX_RETRIES: u32 = 4;

/// Maximum number of full re-fetch attempts when the response body
/// cannot be decoded (truncated JSON, garbled response, etc.).
const MAX_BODY_RETRIES: u32 = 2;

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 500;

/// Sends an HTTP request and parses the response body as JSON.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// Connection errors, timeouts, HTTP 429 and HTTP 5xx are retried with
/// exponential backoff. A body that fails to decode triggers a full
/// re-fetch. Other HTTP 4xx responses are permanent.
///
/// # Errors
///
/// Returns [`SourceError`] if the request fails after all retries, the
/// server returns a non-retryable status code, or the response body
/// cannot be parsed as JSON.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(build_request: F) -> Result<serde_json::Value, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut body_attempt = 0;
    loop {
        let response = send_inner(&build_request, MAX_RETRIES).await?;
        let url = response.url().to_string();
        let status = response.status();

        let outcome = match response.text().await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
                log::warn!(
                    "JSON parse failed\n  url: {url}\n  status: {status}\n  \
                     received: {} bytes\n  parse error: {e}\n  body preview: {preview}",
                    text.len(),
                );
                SourceError::Json(e)
            }),
            Err(e) => {
                log::warn!("Response body read failed\n  url: {url}\n  error: {e}");
                Err(SourceError::Http(e))
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if body_attempt >= MAX_BODY_RETRIES => {
                log::error!("Giving up on {url} after {MAX_BODY_RETRIES} body retries");
                return Err(e);
            }
            Err(_) => {
                body_attempt += 1;
                let delay = backoff(body_attempt);
                log::warn!("  body retry {body_attempt}/{MAX_BODY_RETRIES} in {delay:?}...");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Core retry loop. Returns the first successful (2xx/3xx) response.
#[allow(clippy::future_not_send)]
async fn send_inner<F>(
    build_request: &F,
    max_retries: u32,
) -> Result<reqwest::Response, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = backoff(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }
        let can_retry = attempt < max_retries;
        attempt += 1;

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && can_retry {
                    log::warn!("  transient error: {e}");
                    continue;
                }
                return Err(SourceError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) {
                    if can_retry {
                        log::warn!("  HTTP {status}");
                        continue;
                    }
                    return Err(SourceError::Upstream {
                        message: format!("HTTP {status} after {max_retries} retries"),
                    });
                }
                if status.is_client_error() {
                    return Err(SourceError::Upstream {
                        message: format!("HTTP {status}"),
                    });
                }
                return Ok(response);
            }
        }
    }
}

/// 2s, 4s, 8s, ...
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}
