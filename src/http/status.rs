//! Classification of HTTP failures.
//!
//! Hosting services answer "no such add-on" with a 404, which resolvers must
//! tell apart from transport failures. Auth and rate-limit answers get their
//! own variants so they surface with a useful message.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    /// Resource not found (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),
    /// Authentication failed (HTTP 401)
    #[error("Authentication failed for {0}. Check the access token for this source.")]
    AuthenticationFailed(String),
    /// Rate limit exceeded (HTTP 403 with rate limit message or 429)
    #[error("Rate limit exceeded for {0}. Try again later or configure an access token.")]
    RateLimitExceeded(String),
    /// Forbidden access (HTTP 403 non-rate-limit)
    #[error("Access forbidden: {0}. You may need authentication.")]
    Forbidden(String),
    /// Any other non-success status
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
}

/// Classifies a failed status from `error_for_status()`.
/// Errors without a status (connection, timeout) are returned unchanged.
pub fn classify_error(error: reqwest::Error) -> anyhow::Error {
    let url = error
        .url()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "<unknown url>".to_string());

    let classified = match error.status() {
        Some(StatusCode::NOT_FOUND) => HttpError::NotFound(url),
        Some(StatusCode::UNAUTHORIZED) => HttpError::AuthenticationFailed(url),
        Some(StatusCode::TOO_MANY_REQUESTS) => HttpError::RateLimitExceeded(url),
        Some(StatusCode::FORBIDDEN) => {
            let msg = error.to_string();
            if msg.contains("rate limit") {
                HttpError::RateLimitExceeded(url)
            } else {
                HttpError::Forbidden(url)
            }
        }
        Some(status) => HttpError::Status {
            status: status.as_u16(),
            url,
        },
        None => return anyhow::Error::from(error),
    };
    anyhow::Error::from(classified)
}

/// Whether an error chain bottoms out in a 404.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|e| matches!(e.downcast_ref::<HttpError>(), Some(HttpError::NotFound(_))))
}
