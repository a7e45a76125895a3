//! Classification of HTTP outcomes and the shared backoff schedule.
//!
//! Requests here are single attempts: [`send_json`] turns a response into
//! either a JSON body or a classified [`FetchError`], and the caller
//! decides whether to retry. Classification:
//!
//! - timeouts, connect/body/decode errors, HTTP 429, and HTTP 5xx are
//!   [`FetchError::Transient`]
//! - HTTP 404 is [`FetchError::NotFound`] when an id was requested
//! - any other HTTP 4xx is [`FetchError::Permanent`]
//! - a 2xx body that is not JSON is [`FetchError::Transient`] (truncated
//!   and garbled responses are usually a flaky upstream)

use std::time::Duration;

use reqwest::StatusCode;

use crate::FetchError;

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 200;

/// Longest delay [`backoff`] will return.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at five minutes.
#[must_use]
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// Maps a non-success status to a [`FetchError`]. Returns `None` for 2xx
/// and 3xx.
#[must_use]
pub fn classify_status(status: StatusCode, url: &str, id: Option<&str>) -> Option<FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(FetchError::transient(format!("HTTP {status} (rate limited) from {url}")));
    }
    if status.is_server_error() {
        return Some(FetchError::transient(format!("HTTP {status} from {url}")));
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = id {
            return Some(FetchError::NotFound { id: id.to_string() });
        }
    }
    if status.is_client_error() {
        return Some(FetchError::permanent(format!("HTTP {status} from {url}")));
    }
    None
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

/// Maps a transport-level `reqwest` error.
#[must_use]
pub fn classify_error(e: &reqwest::Error) -> FetchError {
    if is_transient(e) {
        FetchError::transient(e.to_string())
    } else {
        FetchError::permanent(e.to_string())
    }
}

/// Parses a response body as JSON, classifying failure as transient.
///
/// # Errors
///
/// Returns [`FetchError::Transient`] with a short body preview.
pub fn parse_body(text: &str, url: &str) -> Result<serde_json::Value, FetchError> {
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
        FetchError::transient(format!(
            "JSON parse failed for {url}: {e} (received {} bytes, preview: {preview})",
            text.len()
        ))
    })
}

/// Sends one request and returns its JSON body.
///
/// `id` is the match being fetched, if any; it turns a 404 into
/// [`FetchError::NotFound`].
///
/// # Errors
///
/// Returns a classified [`FetchError`]; see the module docs.
pub async fn send_json(
    request: reqwest::RequestBuilder,
    id: Option<&str>,
) -> Result<serde_json::Value, FetchError> {
    let response = request.send().await.map_err(|e| classify_error(&e))?;

    let url = response.url().to_string();
    let status = response.status();
    if let Some(err) = classify_status(status, &url, id) {
        log::debug!("{url}: {err}");
        return Err(err);
    }

    let text = response.text().await.map_err(|e| classify_error(&e))?;
    parse_body(&text, &url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff(base, 1), Duration::from_secs(1));
        assert_eq!(backoff(base, 2), Duration::from_secs(2));
        assert_eq!(backoff(base, 5), Duration::from_secs(16));
        assert_eq!(backoff(base, 40), MAX_BACKOFF);
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = classify_status(status, "u", Some("1")).unwrap();
            assert!(err.is_retryable(), "{status} should be transient");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_status(status, "u", Some("1")).unwrap();
            assert!(matches!(err, FetchError::Permanent { .. }), "{status}");
        }
    }

    #[test]
    fn not_found_depends_on_id() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "u", Some("42")),
            Some(FetchError::NotFound { id: "42".to_string() })
        );
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "u", None),
            Some(FetchError::Permanent { .. })
        ));
        assert_eq!(classify_status(StatusCode::OK, "u", None), None);
    }

    #[test]
    fn undecodable_body_is_transient() {
        let err = parse_body("{\"truncated\": ", "u").unwrap_err();
        assert!(err.is_retryable());
        assert!(parse_body("{\"ok\": true}", "u").is_ok());
    }
}
