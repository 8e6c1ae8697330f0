//! Shared HTTP client construction policy for the lookup services.

use std::time::Duration;

use reqwest::Client;

use crate::user_agent;

use super::ResolveError;

/// Connect timeout for lookup services.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-request timeout for lookup services. Their answers are small JSON documents.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the client used by a lookup service.
///
/// `service` only appears in error messages; every service sends the same
/// User-Agent.
///
/// # Errors
///
/// Returns [`ResolveError::ClientBuild`] when the TLS backend cannot be initialized.
pub(crate) fn build_resolver_http_client(service: &'static str) -> Result<Client, ResolveError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .user_agent(user_agent::default_user_agent())
        .gzip(true)
        .build()
        .map_err(|error| ResolveError::ClientBuild {
            service,
            reason: error.to_string(),
        })
}
