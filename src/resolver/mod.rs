//! Candidate resolution: from a DOI to an ordered list of URLs worth fetching.
//!
//! # Architecture
//!
//! - [`CandidateResolver`] - the seam the workflow calls, once per DOI
//! - [`PublisherLocator`] - finds the version-of-record location ([`DoiOrgLocator`])
//! - [`OpenAccessLookup`] - finds legal open-access copies ([`UnpaywallLookup`])
//! - [`DoiResolver`] - combines one of each into a candidate list
//!
//! The publisher candidate, when there is one, always comes first. Open-access
//! candidates follow in the order the lookup ranked them, with URLs already
//! present dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use doifetch_core::{CandidateResolver, Doi, FetchConfig, HostThrottle};
//! use doifetch_core::resolver::build_default_resolver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let throttle = Arc::new(HostThrottle::default());
//! let resolver = build_default_resolver(&FetchConfig::default(), throttle)?;
//!
//! let doi = Doi::parse("10.1234/example")?;
//! for candidate in resolver.resolve(&doi).await {
//!     println!("{} {:?}", candidate.url, candidate.kind);
//! }
//! # Ok(())
//! # }
//! ```

mod doi_org;
mod error;
mod http_client;
mod unpaywall;

pub use doi_org::DoiOrgLocator;
pub use error::ResolveError;
pub use unpaywall::UnpaywallLookup;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::FetchConfig;
use crate::doi::Doi;
use crate::throttle::{HostThrottle, host_of};

/// Where a candidate URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Publisher / version-of-record location.
    Publisher,
    /// Open-access copy hosted outside the publisher.
    OpenAccess,
}

impl SourceKind {
    /// Returns the stable string label used in storage and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::OpenAccess => "open_access",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL the system may fetch for a DOI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSource {
    /// URL to fetch.
    pub url: String,
    /// Publisher or open-access.
    pub kind: SourceKind,
    /// Position in the candidate list (0 is tried first).
    pub priority: usize,
}

impl CandidateSource {
    /// Creates a candidate.
    #[must_use]
    pub fn new(url: impl Into<String>, kind: SourceKind, priority: usize) -> Self {
        Self {
            url: url.into(),
            kind,
            priority,
        }
    }

    /// Returns the throttle key for this candidate's URL.
    #[must_use]
    pub fn host(&self) -> String {
        host_of(&self.url)
    }
}

/// Produces the ordered candidate list for a DOI.
///
/// An empty list is a valid answer: the DOI could not be resolved anywhere.
#[async_trait]
pub trait CandidateResolver: Send + Sync {
    /// Resolves `doi` to candidates, publisher first.
    async fn resolve(&self, doi: &Doi) -> Vec<CandidateSource>;
}

/// Finds the publisher location for a DOI.
#[async_trait]
pub trait PublisherLocator: Send + Sync {
    /// Returns the registered URL, or `None` when the DOI is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the service cannot answer.
    async fn locate(&self, doi: &Doi) -> Result<Option<String>, ResolveError>;
}

/// Finds open-access copies of a DOI.
#[async_trait]
pub trait OpenAccessLookup: Send + Sync {
    /// Returns open-access URLs, best first.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the service cannot answer.
    async fn lookup(&self, doi: &Doi) -> Result<Vec<String>, ResolveError>;
}

/// [`CandidateResolver`] built from a publisher locator and an optional
/// open-access lookup.
///
/// Both services are queried concurrently. A failing service contributes no
/// candidates; the other one's results are still used.
pub struct DoiResolver {
    publisher: Box<dyn PublisherLocator>,
    open_access: Option<Box<dyn OpenAccessLookup>>,
}

impl DoiResolver {
    /// Creates a resolver with no open-access lookup.
    #[must_use]
    pub fn new(publisher: Box<dyn PublisherLocator>) -> Self {
        Self {
            publisher,
            open_access: None,
        }
    }

    /// Adds an open-access lookup.
    #[must_use]
    pub fn with_open_access(mut self, open_access: Box<dyn OpenAccessLookup>) -> Self {
        self.open_access = Some(open_access);
        self
    }

    /// Returns whether an open-access lookup is configured.
    #[must_use]
    pub fn has_open_access(&self) -> bool {
        self.open_access.is_some()
    }
}

impl fmt::Debug for DoiResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoiResolver")
            .field("has_open_access", &self.has_open_access())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CandidateResolver for DoiResolver {
    #[instrument(skip(self), fields(doi = %doi))]
    async fn resolve(&self, doi: &Doi) -> Vec<CandidateSource> {
        let open_access = async {
            match &self.open_access {
                Some(lookup) => lookup.lookup(doi).await,
                None => Ok(Vec::new()),
            }
        };
        let (publisher, open_access) = tokio::join!(self.publisher.locate(doi), open_access);

        let publisher = publisher.unwrap_or_else(|error| {
            warn!(error = %error, "publisher lookup failed");
            None
        });
        let open_access = open_access.unwrap_or_else(|error| {
            warn!(error = %error, "open-access lookup failed; continuing without it");
            Vec::new()
        });

        let candidates = assemble_candidates(publisher, open_access);
        info!(
            count = candidates.len(),
            publisher = candidates
                .first()
                .is_some_and(|c| c.kind == SourceKind::Publisher),
            "resolved candidates"
        );
        candidates
    }
}

/// Orders candidates: publisher first, then open-access in the given order,
/// skipping blank URLs and URLs already listed.
#[must_use]
pub fn assemble_candidates(
    publisher: Option<String>,
    open_access: Vec<String>,
) -> Vec<CandidateSource> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let entries = publisher
        .into_iter()
        .map(|url| (url, SourceKind::Publisher))
        .chain(open_access.into_iter().map(|url| (url, SourceKind::OpenAccess)));

    for (url, kind) in entries {
        let url = url.trim().to_string();
        if url.is_empty() || !seen.insert(url.clone()) {
            debug!(url = %url, "skipping duplicate or blank candidate");
            continue;
        }
        let priority = candidates.len();
        candidates.push(CandidateSource::new(url, kind, priority));
    }
    candidates
}

/// Builds the default resolver: doi.org for the publisher location, plus
/// Unpaywall when a contact email is configured.
///
/// Both API hosts are given `config.api_min_interval` in the throttle.
///
/// # Errors
///
/// Returns [`ResolveError`] if an HTTP client cannot be constructed.
pub fn build_default_resolver(
    config: &FetchConfig,
    throttle: Arc<HostThrottle>,
) -> Result<DoiResolver, ResolveError> {
    let locator = DoiOrgLocator::with_base_url(&config.doi_org_base_url, Arc::clone(&throttle))?;
    throttle.configure_host(&host_of(&config.doi_org_base_url), config.api_min_interval);
    let mut resolver = DoiResolver::new(Box::new(locator));

    match &config.unpaywall_email {
        Some(email) => {
            let lookup = UnpaywallLookup::with_base_url(
                email.as_str(),
                &config.unpaywall_base_url,
                Arc::clone(&throttle),
            )?;
            throttle.configure_host(&host_of(&config.unpaywall_base_url), config.api_min_interval);
            resolver = resolver.with_open_access(Box::new(lookup));
        }
        None => warn!("no Unpaywall email configured; open-access fallback disabled"),
    }
    Ok(resolver)
}
