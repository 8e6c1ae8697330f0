//! Per-DOI resolution state machine.
//!
//! ```text
//! Pending -> Resolving -> Trying(0, 1) -> ... -> Succeeded | Exhausted | Failed
//! ```
//!
//! A workflow resolves its DOI once, then walks the candidate list in order.
//! Transient failures retry the same candidate with backoff until the
//! [`RetryPolicy`] budget runs out; permanent failures and access denials move
//! on to the next candidate. Every fetch is appended to the attempt log.

mod retry;

pub use retry::{RetryDecision, RetryPolicy};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::FetchConfig;
use crate::doi::Doi;
use crate::fetch::{DocumentFormat, FetchError, FetchOutcome, FetchStatus, Fetcher};
use crate::resolver::{CandidateResolver, CandidateSource};

/// Why a workflow ended without reaching a candidate verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// The run was cancelled before the DOI finished.
    #[error("cancelled")]
    Cancelled,

    /// The worker running the workflow panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// The workflow stopped in an impossible state.
    #[error("internal workflow error: {0}")]
    Internal(String),
}

/// State of one DOI's workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    /// Not started.
    Pending,
    /// Waiting for the candidate list.
    Resolving,
    /// About to fetch candidate `index`, attempt number `attempt` (1-based).
    Trying {
        /// Candidate position.
        index: usize,
        /// Attempt number for this candidate.
        attempt: u32,
    },
    /// Candidate `index` produced a document.
    Succeeded {
        /// Candidate position.
        index: usize,
    },
    /// No candidate produced a document.
    Exhausted,
    /// Stopped by cancellation or an internal fault.
    Failed {
        /// What stopped it.
        error: WorkflowError,
    },
}

impl WorkflowState {
    /// Returns whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Exhausted | Self::Failed { .. }
        )
    }

    /// Returns a short label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Trying { .. } => "trying",
            Self::Succeeded { .. } => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Terminal verdict for a DOI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalStatus {
    /// A document was retrieved.
    Resolved {
        /// Candidate that satisfied the DOI.
        candidate: CandidateSource,
        /// URL the document was read from.
        url: String,
        /// Document format.
        format: DocumentFormat,
        /// Document bytes.
        payload: Vec<u8>,
    },
    /// Every candidate failed, or there were none.
    Exhausted,
    /// The workflow did not finish normally.
    Error(WorkflowError),
}

impl FinalStatus {
    /// Returns the stable string label used in storage and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::Exhausted => "exhausted",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one terminal record produced per DOI per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    /// The DOI.
    pub doi: Doi,
    /// Verdict.
    pub final_status: FinalStatus,
    /// Every fetch made, in order. The successful attempt's payload is moved
    /// into [`FinalStatus::Resolved`].
    pub attempts: Vec<FetchOutcome>,
}

impl ResolutionResult {
    /// Creates an error result.
    #[must_use]
    pub fn error(doi: Doi, error: WorkflowError, attempts: Vec<FetchOutcome>) -> Self {
        Self {
            doi,
            final_status: FinalStatus::Error(error),
            attempts,
        }
    }

    /// Returns whether a document was retrieved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.final_status, FinalStatus::Resolved { .. })
    }

    /// Returns the candidate that satisfied the DOI, if any.
    #[must_use]
    pub fn resolved_candidate(&self) -> Option<&CandidateSource> {
        match &self.final_status {
            FinalStatus::Resolved { candidate, .. } => Some(candidate),
            _ => None,
        }
    }

    /// Returns the error detail for results that did not resolve.
    #[must_use]
    pub fn error_detail(&self) -> Option<String> {
        match &self.final_status {
            FinalStatus::Resolved { .. } => None,
            FinalStatus::Error(error) => Some(error.to_string()),
            FinalStatus::Exhausted if self.attempts.is_empty() => {
                Some("no candidate sources".to_string())
            }
            FinalStatus::Exhausted => self.attempts.last().and_then(|a| a.detail.clone()),
        }
    }
}

/// Mutable bookkeeping for one workflow execution.
struct WorkflowRun {
    doi: Doi,
    state: WorkflowState,
    candidates: Vec<CandidateSource>,
    attempts: Vec<FetchOutcome>,
}

impl WorkflowRun {
    fn new(doi: Doi) -> Self {
        Self {
            doi,
            state: WorkflowState::Pending,
            candidates: Vec::new(),
            attempts: Vec::new(),
        }
    }

    /// Moves to the next candidate, or ends the workflow.
    fn advance(&self, index: usize) -> WorkflowState {
        let next = index + 1;
        if next < self.candidates.len() {
            WorkflowState::Trying {
                index: next,
                attempt: 1,
            }
        } else {
            WorkflowState::Exhausted
        }
    }

    fn finish(mut self) -> ResolutionResult {
        let final_status = match self.state {
            WorkflowState::Succeeded { index } => {
                let successful = self.attempts.last_mut();
                let (url, format, payload) = match successful {
                    Some(outcome) => (
                        outcome.url.clone(),
                        outcome.format.unwrap_or(DocumentFormat::Unknown),
                        outcome.payload.take().unwrap_or_default(),
                    ),
                    None => (String::new(), DocumentFormat::Unknown, Vec::new()),
                };
                match self.candidates.get(index) {
                    Some(candidate) => FinalStatus::Resolved {
                        candidate: candidate.clone(),
                        url,
                        format,
                        payload,
                    },
                    None => FinalStatus::Error(WorkflowError::Internal(format!(
                        "succeeded on missing candidate {index}"
                    ))),
                }
            }
            WorkflowState::Exhausted => FinalStatus::Exhausted,
            WorkflowState::Failed { error } => FinalStatus::Error(error),
            other => FinalStatus::Error(WorkflowError::Internal(format!(
                "stopped in non-terminal state {}",
                other.name()
            ))),
        };
        ResolutionResult {
            doi: self.doi,
            final_status,
            attempts: self.attempts,
        }
    }
}

/// Drives DOIs through resolver and fetcher.
///
/// One instance is shared by all workers; each [`run`](Self::run) call owns
/// its own state.
pub struct ResolutionWorkflow {
    resolver: Arc<dyn CandidateResolver>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
}

impl ResolutionWorkflow {
    /// Creates a workflow.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn CandidateResolver>,
        fetcher: Arc<dyn Fetcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            retry,
        }
    }

    /// Creates a workflow whose retry policy follows `config`.
    #[must_use]
    pub fn from_config(
        resolver: Arc<dyn CandidateResolver>,
        fetcher: Arc<dyn Fetcher>,
        config: &FetchConfig,
    ) -> Self {
        Self::new(resolver, fetcher, RetryPolicy::from_config(config))
    }

    /// Returns the retry policy in use.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs the workflow for `doi` to a terminal result.
    ///
    /// Never fails: cancellation, internal faults and panics inside the
    /// resolver or fetcher become [`FinalStatus::Error`] results carrying the
    /// attempts made so far.
    #[instrument(skip(self, cancel), fields(doi = %doi))]
    pub async fn run(&self, doi: Doi, cancel: &CancellationToken) -> ResolutionResult {
        let mut run = WorkflowRun::new(doi);

        while !run.state.is_terminal() {
            let next = match AssertUnwindSafe(self.step(&mut run, cancel))
                .catch_unwind()
                .await
            {
                Ok(next) => next,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(state = run.state.name(), panic = %message, "workflow step panicked");
                    WorkflowState::Failed {
                        error: WorkflowError::Panicked(message),
                    }
                }
            };
            debug!(from = run.state.name(), to = next.name(), "workflow transition");
            run.state = next;
        }

        let result = run.finish();
        info!(
            status = %result.final_status,
            attempts = result.attempts.len(),
            source = result.resolved_candidate().map(|c| c.kind.as_str()),
            "DOI finished"
        );
        result
    }

    async fn step(&self, run: &mut WorkflowRun, cancel: &CancellationToken) -> WorkflowState {
        match run.state.clone() {
            WorkflowState::Pending => WorkflowState::Resolving,

            WorkflowState::Resolving => {
                let candidates = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return cancelled(),
                    candidates = self.resolver.resolve(&run.doi) => candidates,
                };
                if candidates.is_empty() {
                    debug!("no candidates");
                    return WorkflowState::Exhausted;
                }
                run.candidates = candidates;
                WorkflowState::Trying {
                    index: 0,
                    attempt: 1,
                }
            }

            WorkflowState::Trying { index, attempt } => {
                if cancel.is_cancelled() {
                    return cancelled();
                }
                let Some(candidate) = run.candidates.get(index) else {
                    return WorkflowState::Exhausted;
                };

                let mut outcome = match self.fetcher.fetch(&run.doi, candidate, cancel).await {
                    Ok(outcome) => outcome,
                    Err(FetchError::Cancelled) => return cancelled(),
                    Err(error) => {
                        warn!(url = %candidate.url, error = %error, "fetcher fault; treating as permanent failure");
                        FetchOutcome::failure(
                            candidate,
                            candidate.url.clone(),
                            FetchStatus::PermanentFailure,
                            error.to_string(),
                        )
                    }
                };
                outcome.attempt = attempt;
                let status = outcome.status;
                let retry_after = outcome.retry_after;
                debug!(
                    index,
                    attempt,
                    status = %status,
                    http_status = outcome.http_status,
                    "candidate attempt finished"
                );
                run.attempts.push(outcome);

                match status {
                    FetchStatus::Success => WorkflowState::Succeeded { index },
                    FetchStatus::PermanentFailure | FetchStatus::AccessDenied => run.advance(index),
                    FetchStatus::TransientFailure => match self.retry.should_retry(status, attempt) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next_attempt,
                        } => {
                            let wait = delay.max(retry_after.unwrap_or_default());
                            debug!(delay_ms = wait.as_millis(), "backing off");
                            tokio::select! {
                                biased;
                                () = cancel.cancelled() => return cancelled(),
                                () = tokio::time::sleep(wait) => {}
                            }
                            WorkflowState::Trying {
                                index,
                                attempt: next_attempt,
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(reason = %reason, "giving up on candidate");
                            run.advance(index)
                        }
                    },
                }
            }

            terminal => terminal,
        }
    }
}

/// Extracts the text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn cancelled() -> WorkflowState {
    WorkflowState::Failed {
        error: WorkflowError::Cancelled,
    }
}

impl fmt::Debug for ResolutionWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionWorkflow")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
