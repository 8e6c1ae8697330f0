//! reqwest-backed [`Fetcher`].
//!
//! Every request, redirect hops and robots.txt included, passes through the
//! shared [`HostThrottle`] first. Redirects are followed by hand so that each
//! hop is throttled for its own host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::config::FetchConfig;
use crate::doi::Doi;
use crate::resolver::CandidateSource;
use crate::throttle::{HostThrottle, host_of, parse_retry_after};
use crate::user_agent;

use super::classify::{classify_http_status, classify_transport_error, honors_retry_after};
use super::content::{DocumentFormat, essence};
use super::extract::{ContentExtractor, LandingPageExtractor};
use super::robots::RobotsCache;
use super::{FetchError, FetchOutcome, FetchStatus, Fetcher};

/// Redirect hops followed per exchange before giving up.
const MAX_REDIRECTS: usize = 10;

/// Fetches candidates over HTTP with per-host throttling, robots.txt checks,
/// bounded bodies and one landing-page hop.
pub struct HttpFetcher {
    client: Client,
    throttle: Arc<HostThrottle>,
    extractor: Arc<dyn ContentExtractor>,
    robots: Option<RobotsCache>,
    max_payload_bytes: usize,
}

/// What one request chain (including redirects) produced.
enum Exchange {
    Body {
        url: String,
        http_status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    Failed {
        url: String,
        status: FetchStatus,
        http_status: Option<u16>,
        retry_after: Option<Duration>,
        detail: String,
    },
}

impl Exchange {
    fn failed(url: &str, status: FetchStatus, detail: impl Into<String>) -> Self {
        Self::Failed {
            url: url.to_string(),
            status,
            http_status: None,
            retry_after: None,
            detail: detail.into(),
        }
    }
}

impl HttpFetcher {
    /// Creates a fetcher from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] when the HTTP client cannot be built.
    pub fn new(config: &FetchConfig, throttle: Arc<HostThrottle>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .cookie_store(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(user_agent::default_user_agent())
            .gzip(true)
            .build()
            .map_err(|error| FetchError::ClientBuild(error.to_string()))?;

        let robots = config
            .check_robots
            .then(|| RobotsCache::new(client.clone(), Arc::clone(&throttle)));

        Ok(Self {
            client,
            throttle,
            extractor: Arc::new(LandingPageExtractor::new()),
            robots,
            max_payload_bytes: usize::try_from(config.max_payload_bytes).unwrap_or(usize::MAX),
        })
    }

    /// Replaces the landing-page extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Returns whether robots.txt is consulted.
    #[must_use]
    pub fn robots_enabled(&self) -> bool {
        self.robots.is_some()
    }

    /// Requests `url`, following redirects, and reads a bounded body.
    async fn exchange(&self, url: &str, cancel: &CancellationToken) -> Result<Exchange, FetchError> {
        let mut current = url.to_string();

        for _hop in 0..=MAX_REDIRECTS {
            let parsed = match Url::parse(&current) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
                Ok(_) | Err(_) => {
                    return Ok(Exchange::failed(
                        &current,
                        FetchStatus::PermanentFailure,
                        "not a fetchable http(s) URL",
                    ));
                }
            };
            let host = host_of(&current);

            if let Some(robots) = &self.robots {
                let rules = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(FetchError::Cancelled),
                    rules = robots.rules_for(&current) => rules,
                };
                if let Some(delay) = rules.crawl_delay {
                    self.throttle.update_interval(&host, delay);
                }
                if !rules.is_allowed(&path_and_query(&parsed)) {
                    debug!(url = %current, "disallowed by robots.txt");
                    return Ok(Exchange::failed(
                        &current,
                        FetchStatus::AccessDenied,
                        "disallowed by robots.txt",
                    ));
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = self.throttle.acquire(&host) => {}
            }

            // Once sent, a request runs to completion (bounded by the request timeout)
            let response = match self.client.get(parsed.clone()).send().await {
                Ok(response) => response,
                Err(error) => {
                    debug!(url = %current, error = %error, "request failed");
                    return Ok(Exchange::failed(
                        &current,
                        classify_transport_error(&error),
                        error.to_string(),
                    ));
                }
            };

            let status = response.status();
            let http_status = status.as_u16();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| parsed.join(location.trim()).ok());
                let Some(next) = location else {
                    return Ok(Exchange::Failed {
                        url: current,
                        status: FetchStatus::PermanentFailure,
                        http_status: Some(http_status),
                        retry_after: None,
                        detail: format!("HTTP {http_status} without usable Location"),
                    });
                };
                debug!(from = %current, to = %next, status = http_status, "following redirect");
                current = next.to_string();
                continue;
            }

            if !status.is_success() {
                let retry_after = if honors_retry_after(http_status) {
                    response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(parse_retry_after)
                } else {
                    None
                };
                return Ok(Exchange::Failed {
                    url: current,
                    status: classify_http_status(http_status),
                    http_status: Some(http_status),
                    retry_after,
                    detail: format!("HTTP {http_status}"),
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(essence);

            if let Some(length) = response.content_length()
                && length > self.max_payload_bytes as u64
            {
                return Ok(Exchange::Failed {
                    url: current,
                    status: FetchStatus::PermanentFailure,
                    http_status: Some(http_status),
                    retry_after: None,
                    detail: format!("payload of {length} bytes exceeds limit"),
                });
            }

            return Ok(match read_body_limited(response, self.max_payload_bytes).await {
                Ok(Some(body)) => Exchange::Body {
                    url: current,
                    http_status,
                    content_type,
                    body,
                },
                Ok(None) => Exchange::Failed {
                    url: current,
                    status: FetchStatus::PermanentFailure,
                    http_status: Some(http_status),
                    retry_after: None,
                    detail: "payload exceeds limit".to_string(),
                },
                Err(error) => Exchange::Failed {
                    url: current,
                    status: classify_transport_error(&error),
                    http_status: Some(http_status),
                    retry_after: None,
                    detail: format!("failed to read body: {error}"),
                },
            });
        }

        Ok(Exchange::failed(
            &current,
            FetchStatus::PermanentFailure,
            format!("more than {MAX_REDIRECTS} redirects"),
        ))
    }

    /// Follows a link found on a landing page. Any failure here is permanent.
    async fn follow_landing_link(
        &self,
        candidate: &CandidateSource,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        debug!(link, "following landing-page link");
        match self.exchange(link, cancel).await? {
            Exchange::Body {
                url,
                http_status,
                content_type,
                body,
            } => {
                let format = DocumentFormat::detect(content_type.as_deref(), &body);
                let outcome = if format.is_final_document() {
                    FetchOutcome::success(candidate, url, format, body)
                } else {
                    FetchOutcome::failure(
                        candidate,
                        url,
                        FetchStatus::PermanentFailure,
                        format!("landing-page link returned {format}"),
                    )
                    .with_format(format)
                };
                Ok(outcome
                    .with_http_status(http_status)
                    .with_content_type(content_type))
            }
            Exchange::Failed {
                url,
                http_status,
                detail,
                ..
            } => {
                let outcome = FetchOutcome::failure(
                    candidate,
                    url,
                    FetchStatus::PermanentFailure,
                    format!("landing-page link failed: {detail}"),
                );
                Ok(match http_status {
                    Some(code) => outcome.with_http_status(code),
                    None => outcome,
                })
            }
        }
    }
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("robots", &self.robots)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, candidate, cancel), fields(doi = %doi, url = %candidate.url, kind = %candidate.kind))]
    async fn fetch(
        &self,
        doi: &Doi,
        candidate: &CandidateSource,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let (page_url, http_status, content_type, body) =
            match self.exchange(&candidate.url, cancel).await? {
                Exchange::Body {
                    url,
                    http_status,
                    content_type,
                    body,
                } => (url, http_status, content_type, body),
                Exchange::Failed {
                    url,
                    status,
                    http_status,
                    retry_after,
                    detail,
                } => {
                    let outcome = FetchOutcome::failure(candidate, url, status, detail)
                        .with_retry_after(retry_after);
                    return Ok(match http_status {
                        Some(code) => outcome.with_http_status(code),
                        None => outcome,
                    });
                }
            };

        let format = DocumentFormat::detect(content_type.as_deref(), &body);
        if format.is_final_document() {
            debug!(format = %format, bytes = body.len(), "document retrieved");
            return Ok(FetchOutcome::success(candidate, page_url, format, body)
                .with_http_status(http_status)
                .with_content_type(content_type));
        }

        let unusable = |detail: String, status: FetchStatus, url: String| {
            FetchOutcome::failure(candidate, url, status, detail)
                .with_http_status(http_status)
                .with_content_type(content_type.clone())
                .with_format(format)
        };

        if format != DocumentFormat::Html {
            return Ok(unusable(
                format!("unusable content ({format})"),
                FetchStatus::PermanentFailure,
                page_url,
            ));
        }

        let Ok(page) = Url::parse(&page_url) else {
            return Ok(unusable(
                "landing page URL unparsable".to_string(),
                FetchStatus::PermanentFailure,
                page_url,
            ));
        };
        let html = String::from_utf8_lossy(&body);

        match self.extractor.extract(&html, &page, doi) {
            Some(link) => self.follow_landing_link(candidate, &link, cancel).await,
            None if self.extractor.is_access_wall(&html, &page) => Ok(unusable(
                "landing page requires sign-in or purchase".to_string(),
                FetchStatus::AccessDenied,
                page_url,
            )),
            None => Ok(unusable(
                "landing page has no document link".to_string(),
                FetchStatus::PermanentFailure,
                page_url,
            )),
        }
    }
}

/// Reads a response body, giving up once it grows past `limit` bytes.
///
/// Returns `Ok(None)` when the limit is exceeded.
pub(super) async fn read_body_limited(
    response: reqwest::Response,
    limit: usize,
) -> Result<Option<Vec<u8>>, reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_query() {
        let url = Url::parse("https://example.com/a/b?x=1").unwrap();
        assert_eq!(path_and_query(&url), "/a/b?x=1");
        let url = Url::parse("https://example.com").unwrap();
        assert_eq!(path_and_query(&url), "/");
    }

    #[test]
    fn test_new_respects_robots_setting() {
        let throttle = Arc::new(HostThrottle::default());
        let fetcher = HttpFetcher::new(&FetchConfig::default(), Arc::clone(&throttle)).unwrap();
        assert!(fetcher.robots_enabled());

        let config = FetchConfig {
            check_robots: false,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config, throttle).unwrap();
        assert!(!fetcher.robots_enabled());
    }
}
