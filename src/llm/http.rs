//! Transport layer shared by all providers.
//!
//! Every outbound call gets a per-operation timeout, `Connection:
//! keep-alive`, and up to three attempts with jittered exponential backoff.
//! Retry triggers are network errors and HTTP {408, 425, 429, 5xx};
//! `Retry-After` is honored as a minimum delay. Non-retryable failures
//! surface as [`QmdError::Provider`] carrying the first ≤500 bytes of the
//! response body and the request URL. A timeout is cooperative
//! cancellation, not a retry trigger.

use rand::Rng;
use std::time::Duration;

use crate::error::{QmdError, Result};

/// Maximum attempts per operation.
pub const MAX_ATTEMPTS: u32 = 3;

/// First backoff step.
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// HTTP statuses worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || status >= 500
}

/// Backoff for a (1-based) failed attempt, before jitter, honoring
/// `Retry-After` as a floor.
pub fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let exp = BASE_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(MAX_BACKOFF);
    match retry_after {
        Some(floor) => capped.max(floor).min(MAX_BACKOFF),
        None => capped,
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.75..1.25);
    delay.mul_f64(factor).min(MAX_BACKOFF)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Truncate a response body to a ≤500-byte snippet on a char boundary.
pub fn body_snippet(body: &str) -> &str {
    if body.len() <= 500 {
        return body;
    }
    let mut end = 500;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// POST a JSON body and return the decoded JSON response, retrying per the
/// transport contract.
pub async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    op: &'static str,
    url: &str,
    headers: &[(String, String)],
    body: &serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let mut last_err: Option<QmdError> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let mut req = client.post(url).timeout(timeout).json(body);
        let mut has_connection_header = false;
        for (k, v) in headers {
            if k.eq_ignore_ascii_case("connection") {
                has_connection_header = true;
            }
            req = req.header(k, v);
        }
        if !has_connection_header {
            req = req.header("Connection", "keep-alive");
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return resp.json::<serde_json::Value>().await.map_err(|e| {
                        QmdError::Provider {
                            provider: provider.to_string(),
                            op,
                            status: Some(status.as_u16()),
                            message: format!("response was not JSON: {e}"),
                        }
                    });
                }

                let retry_after = parse_retry_after(resp.headers());
                let text = resp.text().await.unwrap_or_default();
                let err = QmdError::Provider {
                    provider: provider.to_string(),
                    op,
                    status: Some(status.as_u16()),
                    message: format!("{} — {}", body_snippet(&text), url),
                };

                if is_retryable_status(status.as_u16()) && attempt < MAX_ATTEMPTS {
                    let delay = with_jitter(backoff_delay(attempt, retry_after));
                    tracing::debug!(provider, op, %status, ?delay, attempt, "retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) if e.is_timeout() => {
                // The per-operation controller aborted the request.
                return Err(QmdError::Cancelled);
            }
            Err(e) => {
                let err = QmdError::Provider {
                    provider: provider.to_string(),
                    op,
                    status: None,
                    message: format!("network error: {e} — {url}"),
                };
                if attempt < MAX_ATTEMPTS {
                    let delay = with_jitter(backoff_delay(attempt, None));
                    tracing::debug!(provider, op, ?delay, attempt, "network error, retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_err.unwrap_or(QmdError::Cancelled))
}
