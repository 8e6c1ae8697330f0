//! Publisher location lookup through the DOI Handle System.
//!
//! [`DoiOrgLocator`] asks the doi.org handle API for the URL a DOI is registered
//! to. That URL is the publisher's landing page (or, for some registrants, the
//! document itself) and becomes the version-of-record candidate.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::DEFAULT_DOI_ORG_BASE_URL;
use crate::doi::Doi;
use crate::throttle::{HostThrottle, host_of};

use super::http_client::build_resolver_http_client;
use super::{PublisherLocator, ResolveError};

const SERVICE: &str = "doi.org";

/// Handle API response code for a successful lookup.
const RESPONSE_CODE_SUCCESS: i64 = 1;

// ==================== Handle API Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HandleResponse {
    pub response_code: i64,
    #[serde(default)]
    pub values: Vec<HandleValue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HandleValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: HandleData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HandleData {
    pub value: serde_json::Value,
}

impl HandleResponse {
    /// Returns the first non-empty `URL` value.
    fn registered_url(&self) -> Option<String> {
        self.values
            .iter()
            .filter(|value| value.kind.eq_ignore_ascii_case("URL"))
            .find_map(|value| value.data.value.as_str())
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

// ==================== DoiOrgLocator ====================

/// Resolves a DOI to its registered publisher URL via `GET /api/handles/{doi}`.
pub struct DoiOrgLocator {
    client: Client,
    base_url: String,
    throttle: Arc<HostThrottle>,
}

impl DoiOrgLocator {
    /// Creates a locator against the public doi.org service.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if HTTP client construction fails.
    pub fn new(throttle: Arc<HostThrottle>) -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_DOI_ORG_BASE_URL, throttle)
    }

    /// Creates a locator with a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if HTTP client construction fails.
    pub fn with_base_url(
        base_url: impl Into<String>,
        throttle: Arc<HostThrottle>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_resolver_http_client(SERVICE)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            throttle,
        })
    }

    /// Returns the base URL this locator queries.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for DoiOrgLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoiOrgLocator")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PublisherLocator for DoiOrgLocator {
    #[instrument(skip(self), fields(service = SERVICE, doi = %doi))]
    async fn locate(&self, doi: &Doi) -> Result<Option<String>, ResolveError> {
        let url = format!("{}/api/handles/{}?type=URL", self.base_url, doi.url_path());

        self.throttle.acquire(&host_of(&url)).await;
        debug!(api_url = %url, "querying handle API");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| ResolveError::network(SERVICE, doi.as_str(), &error))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("DOI not registered");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ResolveError::http_status(
                SERVICE,
                doi.as_str(),
                status.as_u16(),
            ));
        }

        let body: HandleResponse = response.json().await.map_err(|error| {
            ResolveError::invalid_response(SERVICE, doi.as_str(), error.to_string())
        })?;

        if body.response_code != RESPONSE_CODE_SUCCESS {
            debug!(response_code = body.response_code, "handle lookup unsuccessful");
            return Ok(None);
        }

        let registered = body.registered_url();
        debug!(publisher_url = ?registered, "handle lookup complete");
        Ok(registered)
    }
}
