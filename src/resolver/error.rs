//! Error types for candidate resolution.
//!
//! These never escape [`DoiResolver`](super::DoiResolver): a failed lookup
//! contributes no candidates and is logged. They exist so collaborators can be
//! tested and reported on individually.

use thiserror::Error;

/// Errors raised by the publisher and open-access lookup services.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The service could not be reached or the exchange failed mid-way.
    #[error("{service} request failed for '{doi}': {reason}\n  Suggestion: {suggestion}")]
    Network {
        /// Lookup service name.
        service: &'static str,
        /// DOI being resolved.
        doi: String,
        /// Underlying failure.
        reason: String,
        /// How to fix the issue.
        suggestion: String,
    },

    /// The service answered with an unexpected HTTP status.
    #[error("{service} returned HTTP {status} for '{doi}'")]
    HttpStatus {
        /// Lookup service name.
        service: &'static str,
        /// DOI being resolved.
        doi: String,
        /// HTTP status code.
        status: u16,
    },

    /// The service answered with a body that could not be understood.
    #[error("{service} returned an unexpected response for '{doi}': {reason}")]
    InvalidResponse {
        /// Lookup service name.
        service: &'static str,
        /// DOI being resolved.
        doi: String,
        /// What was wrong with the body.
        reason: String,
    },

    /// The HTTP client for a service could not be constructed.
    #[error("cannot build HTTP client for {service}: {reason}")]
    ClientBuild {
        /// Lookup service name.
        service: &'static str,
        /// Builder failure.
        reason: String,
    },
}

impl ResolveError {
    /// Creates a `Network` error.
    #[must_use]
    pub fn network(service: &'static str, doi: &str, error: &reqwest::Error) -> Self {
        let suggestion = if error.is_timeout() {
            "The service is slow to respond; try again later"
        } else {
            "Check your network connection"
        };
        Self::Network {
            service,
            doi: doi.to_string(),
            reason: error.to_string(),
            suggestion: suggestion.to_string(),
        }
    }

    /// Creates an `HttpStatus` error.
    #[must_use]
    pub fn http_status(service: &'static str, doi: &str, status: u16) -> Self {
        Self::HttpStatus {
            service,
            doi: doi.to_string(),
            status,
        }
    }

    /// Creates an `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(service: &'static str, doi: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service,
            doi: doi.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the name of the service that failed.
    #[must_use]
    pub fn service(&self) -> &'static str {
        match self {
            Self::Network { service, .. }
            | Self::HttpStatus { service, .. }
            | Self::InvalidResponse { service, .. }
            | Self::ClientBuild { service, .. } => service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let error = ResolveError::http_status("doi.org", "10.1234/x", 503);
        assert_eq!(error.to_string(), "doi.org returned HTTP 503 for '10.1234/x'");
        assert_eq!(error.service(), "doi.org");
    }

    #[test]
    fn test_invalid_response_display() {
        let error = ResolveError::invalid_response("unpaywall", "10.1234/x", "missing field");
        let message = error.to_string();
        assert!(message.contains("unpaywall"));
        assert!(message.contains("missing field"));
    }
}
