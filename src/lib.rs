//! doifetch core library
//!
//! Resolves DOIs to full-text documents, preferring the publisher's version of
//! record and falling back to open-access copies, while keeping every remote
//! host at or below its allowed request rate.
//!
//! # Architecture
//!
//! Leaves first:
//! - [`throttle`] - per-host request gate ([`HostThrottle`])
//! - [`resolver`] - DOI to ordered candidate sources ([`CandidateResolver`])
//! - [`fetch`] - one bounded HTTP exchange per candidate ([`Fetcher`])
//! - [`workflow`] - per-DOI state machine ([`ResolutionWorkflow`])
//! - [`scheduler`] - bounded concurrent driver ([`Scheduler`])
//! - [`sink`] - terminal result persistence ([`ResultSink`])
//!
//! Supporting modules: [`doi`], [`config`], [`db`], [`user_agent`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod doi;
pub mod fetch;
pub mod resolver;
pub mod scheduler;
pub mod sink;
pub mod throttle;
pub mod user_agent;
pub mod workflow;

// Re-export commonly used types
pub use config::{ConfigError, FetchConfig};
pub use db::{Database, DbError};
pub use doi::{Doi, DoiError};
pub use fetch::{
    ContentExtractor, DocumentFormat, FetchError, FetchOutcome, FetchStatus, Fetcher, HttpFetcher,
    LandingPageExtractor,
};
pub use resolver::{
    CandidateResolver, CandidateSource, DoiOrgLocator, DoiResolver, OpenAccessLookup,
    PublisherLocator, ResolveError, SourceKind, UnpaywallLookup,
};
pub use scheduler::{RunStats, Scheduler, SchedulerError, build_default_scheduler};
pub use sink::{MemorySink, ResultSink, SinkError, SqliteSink};
pub use throttle::{HostThrottle, host_of};
pub use workflow::{
    FinalStatus, ResolutionResult, ResolutionWorkflow, RetryDecision, RetryPolicy, WorkflowError,
    WorkflowState,
};
