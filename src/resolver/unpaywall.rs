//! Open-access location lookup through the Unpaywall API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::DEFAULT_UNPAYWALL_BASE_URL;
use crate::doi::Doi;
use crate::throttle::{HostThrottle, host_of};

use super::http_client::build_resolver_http_client;
use super::{OpenAccessLookup, ResolveError};

const SERVICE: &str = "unpaywall";

// ==================== Unpaywall API Response Types ====================

#[derive(Debug, Deserialize)]
pub(crate) struct UnpaywallResponse {
    #[serde(default)]
    pub is_oa: bool,
    pub best_oa_location: Option<OaLocation>,
    #[serde(default)]
    pub oa_locations: Vec<OaLocation>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OaLocation {
    pub url: Option<String>,
    pub url_for_pdf: Option<String>,
    #[allow(dead_code)] // Deserialized for Debug output when tracing lookups
    pub host_type: Option<String>,
}

impl OaLocation {
    /// Prefers the direct PDF link over the generic location URL.
    fn best_url(&self) -> Option<&str> {
        self.url_for_pdf
            .as_deref()
            .or(self.url.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

impl UnpaywallResponse {
    /// Location URLs in Unpaywall's ranking: best location first, then the rest.
    fn ranked_urls(&self) -> Vec<String> {
        if !self.is_oa {
            return Vec::new();
        }
        let mut urls: Vec<String> = Vec::new();
        for location in self.best_oa_location.iter().chain(&self.oa_locations) {
            if let Some(url) = location.best_url()
                && !urls.iter().any(|seen| seen == url)
            {
                urls.push(url.to_string());
            }
        }
        urls
    }
}

// ==================== UnpaywallLookup ====================

/// Looks up open-access copies of a DOI via `GET /v2/{doi}?email=...`.
///
/// Unpaywall requires a contact email on every request.
pub struct UnpaywallLookup {
    client: Client,
    base_url: String,
    email: String,
    throttle: Arc<HostThrottle>,
}

impl UnpaywallLookup {
    /// Creates a lookup against the public Unpaywall API.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if HTTP client construction fails.
    pub fn new(email: impl Into<String>, throttle: Arc<HostThrottle>) -> Result<Self, ResolveError> {
        Self::with_base_url(email, DEFAULT_UNPAYWALL_BASE_URL, throttle)
    }

    /// Creates a lookup with a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if HTTP client construction fails.
    pub fn with_base_url(
        email: impl Into<String>,
        base_url: impl Into<String>,
        throttle: Arc<HostThrottle>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_resolver_http_client(SERVICE)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            throttle,
        })
    }
}

impl std::fmt::Debug for UnpaywallLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpaywallLookup")
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OpenAccessLookup for UnpaywallLookup {
    #[instrument(skip(self), fields(service = SERVICE, doi = %doi))]
    async fn lookup(&self, doi: &Doi) -> Result<Vec<String>, ResolveError> {
        let url = format!(
            "{}/v2/{}?email={}",
            self.base_url,
            doi.url_path(),
            urlencoding::encode(&self.email)
        );

        self.throttle.acquire(&host_of(&url)).await;
        debug!(api_url = %url, "querying Unpaywall");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| ResolveError::network(SERVICE, doi.as_str(), &error))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("DOI unknown to Unpaywall");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(ResolveError::http_status(
                SERVICE,
                doi.as_str(),
                status.as_u16(),
            ));
        }

        let body: UnpaywallResponse = response.json().await.map_err(|error| {
            ResolveError::invalid_response(SERVICE, doi.as_str(), error.to_string())
        })?;

        let urls = body.ranked_urls();
        debug!(count = urls.len(), is_oa = body.is_oa, "Unpaywall lookup complete");
        Ok(urls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> UnpaywallResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_ranked_urls_best_location_first() {
        let response = parse(serde_json::json!({
            "is_oa": true,
            "best_oa_location": {"url": "https://repo.example/landing", "url_for_pdf": "https://repo.example/paper.pdf", "host_type": "repository"},
            "oa_locations": [
                {"url": "https://arxiv.example/abs/1", "url_for_pdf": "https://arxiv.example/pdf/1"},
                {"url": "https://repo.example/landing", "url_for_pdf": "https://repo.example/paper.pdf"},
                {"url": "https://mirror.example/1", "url_for_pdf": null}
            ]
        }));
        assert_eq!(
            response.ranked_urls(),
            vec![
                "https://repo.example/paper.pdf",
                "https://arxiv.example/pdf/1",
                "https://mirror.example/1",
            ]
        );
    }

    #[test]
    fn test_ranked_urls_closed_access_empty() {
        let response = parse(serde_json::json!({
            "is_oa": false,
            "best_oa_location": null,
            "oa_locations": []
        }));
        assert!(response.ranked_urls().is_empty());
    }

    #[test]
    fn test_ranked_urls_skips_locations_without_url() {
        let response = parse(serde_json::json!({
            "is_oa": true,
            "best_oa_location": {"url": null, "url_for_pdf": null},
            "oa_locations": [{"url": " ", "url_for_pdf": null}]
        }));
        assert!(response.ranked_urls().is_empty());
    }

    #[test]
    fn test_minimal_response_deserializes() {
        let response = parse(serde_json::json!({"doi": "10.1234/x"}));
        assert!(!response.is_oa);
        assert!(response.best_oa_location.is_none());
    }
}
