//! One bounded HTTP exchange per candidate, classified.
//!
//! A [`Fetcher`] turns a [`CandidateSource`] into a [`FetchOutcome`]. Failures
//! of the remote side are data, not errors: a 404 is a
//! [`FetchStatus::PermanentFailure`] outcome, a timeout a
//! [`FetchStatus::TransientFailure`]. [`FetchError`] is reserved for the run
//! being cancelled and for faults inside the fetcher itself.
//!
//! # Architecture
//!
//! - [`HttpFetcher`] - the reqwest-backed implementation
//! - [`classify`] - HTTP status and transport error classification
//! - [`content`] - document format detection ([`DocumentFormat`])
//! - [`extract`] - landing-page link extraction ([`ContentExtractor`])
//! - [`robots`] - robots.txt crawl delays and disallow rules

pub mod classify;
mod client;
pub mod content;
pub mod extract;
pub mod robots;

pub use client::HttpFetcher;
pub use content::DocumentFormat;
pub use extract::{ContentExtractor, LandingPageExtractor};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::doi::Doi;
use crate::resolver::CandidateSource;

/// Classification of a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// A final document was retrieved.
    Success,
    /// Network trouble, timeout or 5xx. Worth retrying.
    TransientFailure,
    /// Not found, unusable content or a landing-page dead end.
    PermanentFailure,
    /// Authorization required, paywalled or disallowed by robots.txt.
    AccessDenied,
}

impl FetchStatus {
    /// Returns the stable string label used in storage and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::AccessDenied => "access_denied",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one fetch attempt against one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Candidate the attempt was made for.
    pub candidate: CandidateSource,
    /// URL the outcome refers to: the document URL on success, otherwise the
    /// last URL requested.
    pub url: String,
    /// Classification.
    pub status: FetchStatus,
    /// Media type from the response, without parameters.
    pub content_type: Option<String>,
    /// Detected document format, when a body was read.
    pub format: Option<DocumentFormat>,
    /// Document bytes. Only present on success.
    pub payload: Option<Vec<u8>>,
    /// HTTP status code of the last response, if any.
    pub http_status: Option<u16>,
    /// Server-requested delay before retrying (`Retry-After`).
    pub retry_after: Option<Duration>,
    /// 1-based attempt number for this candidate.
    pub attempt: u32,
    /// Human-readable explanation for failures.
    pub detail: Option<String>,
}

impl FetchOutcome {
    /// Creates a failed outcome.
    #[must_use]
    pub fn failure(
        candidate: &CandidateSource,
        url: impl Into<String>,
        status: FetchStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            candidate: candidate.clone(),
            url: url.into(),
            status,
            content_type: None,
            format: None,
            payload: None,
            http_status: None,
            retry_after: None,
            attempt: 1,
            detail: Some(detail.into()),
        }
    }

    /// Creates a successful outcome carrying `payload`.
    #[must_use]
    pub fn success(
        candidate: &CandidateSource,
        url: impl Into<String>,
        format: DocumentFormat,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            candidate: candidate.clone(),
            url: url.into(),
            status: FetchStatus::Success,
            content_type: None,
            format: Some(format),
            payload: Some(payload),
            http_status: None,
            retry_after: None,
            attempt: 1,
            detail: None,
        }
    }

    /// Sets the HTTP status code.
    #[must_use]
    pub fn with_http_status(mut self, http_status: u16) -> Self {
        self.http_status = Some(http_status);
        self
    }

    /// Sets the response media type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Sets the detected format.
    #[must_use]
    pub fn with_format(mut self, format: DocumentFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Sets the server-requested retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Returns whether this attempt produced a document.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }

    /// Returns the payload size in bytes, zero when there is none.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// Faults that prevent a fetch from producing an outcome at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The run was cancelled while the fetch waited to start a request.
    #[error("fetch cancelled")]
    Cancelled,

    /// The fetcher itself failed.
    #[error("internal fetch error: {0}")]
    Internal(String),

    /// The HTTP client could not be constructed.
    #[error("cannot build HTTP client: {0}")]
    ClientBuild(String),
}

/// Performs one fetch attempt for a candidate.
///
/// Implementations must observe `cancel` at every wait that precedes a
/// request. A request already on the wire is allowed to finish.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `candidate` for `doi`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Cancelled`] when `cancel` fires before a request
    /// is sent, or another [`FetchError`] for internal faults.
    async fn fetch(
        &self,
        doi: &Doi,
        candidate: &CandidateSource,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError>;
}
