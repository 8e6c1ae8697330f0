//! Response and transport error classification.
//!
//! # HTTP Status Code Classification
//!
//! | Status | Outcome | Rationale |
//! |--------|---------|-----------|
//! | 2xx | Success | Body still has to pass format detection |
//! | 401, 402, 403, 407 | AccessDenied | Authorization or payment required |
//! | 451 | AccessDenied | Legally unavailable |
//! | 408, 425, 429 | TransientFailure | Timing related, may succeed later |
//! | other 4xx | PermanentFailure | Definitive client error (404, 410, ...) |
//! | 5xx | TransientFailure | Server trouble, may be temporary |
//! | anything else | PermanentFailure | Unexpected |
//!
//! # Transport Errors
//!
//! | Error | Outcome | Rationale |
//! |-------|---------|-----------|
//! | Timeout | TransientFailure | Network may recover |
//! | Connect / body / decode | TransientFailure | Server may come back |
//! | TLS / certificate | PermanentFailure | Configuration problem on one side |
//! | Builder / invalid URL | PermanentFailure | Will never succeed |

use super::FetchStatus;

/// Classifies an HTTP status code.
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_http_status(status: u16) -> FetchStatus {
    match status {
        200..=299 => FetchStatus::Success,

        401 => FetchStatus::AccessDenied, // Unauthorized
        402 => FetchStatus::AccessDenied, // Payment Required
        403 => FetchStatus::AccessDenied, // Forbidden
        407 => FetchStatus::AccessDenied, // Proxy Authentication Required
        451 => FetchStatus::AccessDenied, // Unavailable For Legal Reasons

        408 => FetchStatus::TransientFailure, // Request Timeout
        425 => FetchStatus::TransientFailure, // Too Early
        429 => FetchStatus::TransientFailure, // Too Many Requests

        400..=499 => FetchStatus::PermanentFailure,
        500..=599 => FetchStatus::TransientFailure,

        _ => FetchStatus::PermanentFailure,
    }
}

/// Classifies a reqwest transport error.
#[must_use]
pub fn classify_transport_error(error: &reqwest::Error) -> FetchStatus {
    if error.is_timeout() {
        return FetchStatus::TransientFailure;
    }
    if error.is_builder() || is_tls_error(error) {
        return FetchStatus::PermanentFailure;
    }
    FetchStatus::TransientFailure
}

/// Returns whether a status code may carry a meaningful `Retry-After` header.
#[must_use]
pub fn honors_retry_after(status: u16) -> bool {
    matches!(status, 429 | 503)
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    // TLS failures surface only in the error chain text
    let mut message = error.to_string().to_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push(' ');
        message.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    message.contains("certificate")
        || message.contains("tls")
        || message.contains("ssl")
        || message.contains("handshake")
}
