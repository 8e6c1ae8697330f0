//! Bounded concurrent driver for resolution workflows.
//!
//! The [`Scheduler`] pulls DOIs from an input stream, normalizes and
//! deduplicates them, and runs one [`ResolutionWorkflow`] per DOI on a tokio
//! task. A semaphore caps how many workflows are in flight. Workers waiting on
//! a busy host only suspend themselves inside [`HostThrottle::acquire`], so
//! other workers keep making progress on other hosts.
//!
//! Every dispatched DOI produces exactly one [`ResolutionResult`], which the
//! scheduler hands to the [`ResultSink`] as soon as it is ready.
//!
//! # Cancellation
//!
//! When the cancellation token fires the scheduler stops pulling input,
//! in-flight workflows finish their current request and end with
//! [`WorkflowError::Cancelled`], and their results are still recorded.
//!
//! [`HostThrottle::acquire`]: crate::throttle::HostThrottle::acquire

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, FetchConfig, MAX_CONCURRENCY};
use crate::doi::Doi;
use crate::fetch::{FetchError, HttpFetcher};
use crate::resolver::{ResolveError, build_default_resolver};
use crate::sink::{ResultSink, SinkError};
use crate::throttle::HostThrottle;
use crate::workflow::{
    FinalStatus, ResolutionResult, ResolutionWorkflow, WorkflowError, panic_message,
};

/// Default longest wait for one sink write.
const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Faults that stop a whole run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Concurrency outside 1..=[`MAX_CONCURRENCY`].
    #[error("invalid concurrency value {value}: must be between 1 and {MAX_CONCURRENCY}")]
    InvalidConcurrency {
        /// Rejected value.
        value: usize,
    },

    /// The result sink rejected a result.
    #[error("failed to record result for {doi}: {source}")]
    Sink {
        /// DOI whose result could not be recorded.
        doi: String,
        /// Underlying sink error.
        #[source]
        source: SinkError,
    },

    /// The result sink did not answer in time.
    #[error("recording result for {doi} timed out after {timeout:?}")]
    SinkTimeout {
        /// DOI whose result could not be recorded.
        doi: String,
        /// Configured limit.
        timeout: Duration,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A resolver service could not be constructed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The fetcher could not be constructed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Input lines that were not blank or comments.
    pub received: usize,
    /// Lines that did not parse as a DOI.
    pub invalid: usize,
    /// DOIs seen earlier in the same input.
    pub duplicates: usize,
    /// DOIs skipped because an earlier run already resolved them.
    pub skipped: usize,
    /// DOIs that ended with a document.
    pub resolved: usize,
    /// DOIs whose candidates all failed, or that had none.
    pub exhausted: usize,
    /// DOIs that ended with a cancellation or internal error.
    pub errored: usize,
    /// Fetch attempts across all DOIs.
    pub attempts: usize,
}

impl RunStats {
    /// Returns the number of DOIs that produced a result.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.resolved + self.exhausted + self.errored
    }

    fn count(&mut self, result: &ResolutionResult) {
        self.attempts += result.attempts.len();
        match result.final_status {
            FinalStatus::Resolved { .. } => self.resolved += 1,
            FinalStatus::Exhausted => self.exhausted += 1,
            FinalStatus::Error(_) => self.errored += 1,
        }
    }
}

/// Runs resolution workflows with bounded concurrency.
pub struct Scheduler {
    workflow: Arc<ResolutionWorkflow>,
    sink: Arc<dyn ResultSink>,
    concurrency: usize,
    sink_timeout: Duration,
    already_resolved: HashSet<Doi>,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConcurrency`] if `concurrency` is
    /// outside 1..=[`MAX_CONCURRENCY`].
    #[instrument(level = "debug", skip(workflow, sink))]
    pub fn new(
        workflow: Arc<ResolutionWorkflow>,
        sink: Arc<dyn ResultSink>,
        concurrency: usize,
    ) -> Result<Self, SchedulerError> {
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(SchedulerError::InvalidConcurrency { value: concurrency });
        }
        debug!(
            max_attempts = workflow.retry_policy().max_attempts(),
            "creating scheduler"
        );
        Ok(Self {
            workflow,
            sink,
            concurrency,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            already_resolved: HashSet::new(),
        })
    }

    /// Sets the longest wait for a single sink write.
    #[must_use]
    pub fn with_sink_timeout(mut self, sink_timeout: Duration) -> Self {
        self.sink_timeout = sink_timeout;
        self
    }

    /// Skips DOIs resolved by an earlier run.
    #[must_use]
    pub fn with_already_resolved<I>(mut self, dois: I) -> Self
    where
        I: IntoIterator<Item = Doi>,
    {
        self.already_resolved.extend(dois);
        self
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Resolves every DOI in `dois`.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_all<I>(&self, dois: I, cancel: &CancellationToken) -> Result<RunStats, SchedulerError>
    where
        I: IntoIterator<Item = String>,
    {
        self.run(futures_util::stream::iter(dois), cancel).await
    }

    /// Resolves every DOI the input stream yields.
    ///
    /// Blank lines and `#` comments are ignored, invalid DOIs and repeats are
    /// counted and skipped. Per-DOI failures never make this return `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Sink`] or [`SchedulerError::SinkTimeout`]
    /// when a result cannot be recorded. The run is then cancelled and drained
    /// before returning.
    #[instrument(skip_all, fields(concurrency = self.concurrency))]
    pub async fn run<S>(&self, input: S, cancel: &CancellationToken) -> Result<RunStats, SchedulerError>
    where
        S: Stream<Item = String>,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let run_token = cancel.child_token();
        let mut input = std::pin::pin!(input);
        let mut tasks: JoinSet<ResolutionResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, Doi> = HashMap::new();
        let mut seen: HashSet<Doi> = HashSet::new();
        let mut stats = RunStats::default();
        let mut input_done = false;
        let mut sink_failure: Option<SchedulerError> = None;

        info!("starting run");

        loop {
            if input_done && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                () = run_token.cancelled(), if !input_done => {
                    info!(in_flight = tasks.len(), "cancellation requested; no further DOIs will be started");
                    input_done = true;
                }

                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let result = match joined {
                        Ok((id, result)) => {
                            in_flight.remove(&id);
                            result
                        }
                        Err(join_error) => {
                            let Some(doi) = in_flight.remove(&join_error.id()) else {
                                error!(error = %join_error, "worker task failed for an untracked DOI");
                                stats.errored += 1;
                                continue;
                            };
                            lost_worker_result(doi, join_error)
                        }
                    };
                    stats.count(&result);

                    if sink_failure.is_some() {
                        warn!(doi = %result.doi, "result not recorded: sink unavailable");
                        continue;
                    }
                    if let Err(failure) = self.record(&result).await {
                        error!(error = %failure, "result sink failed; stopping run");
                        sink_failure = Some(failure);
                        run_token.cancel();
                        input_done = true;
                    }
                }

                next = next_input(&semaphore, &mut input), if !input_done => {
                    let (permit, line) = next?;
                    let Some(line) = line else {
                        debug!("input exhausted");
                        input_done = true;
                        continue;
                    };
                    let Some(doi) = self.admit(&line, &mut seen, &mut stats) else {
                        continue;
                    };

                    let workflow = Arc::clone(&self.workflow);
                    let token = run_token.clone();
                    let task_doi = doi.clone();
                    let handle = tasks.spawn(async move {
                        let _permit = permit;
                        run_guarded(&workflow, task_doi, &token).await
                    });
                    in_flight.insert(handle.id(), doi);
                }
            }
        }

        if let Some(failure) = sink_failure {
            return Err(failure);
        }

        info!(
            received = stats.received,
            resolved = stats.resolved,
            exhausted = stats.exhausted,
            errored = stats.errored,
            invalid = stats.invalid,
            duplicates = stats.duplicates,
            skipped = stats.skipped,
            attempts = stats.attempts,
            "run complete"
        );
        Ok(stats)
    }

    /// Normalizes one input line; returns the DOI if it should be dispatched.
    fn admit(&self, line: &str, seen: &mut HashSet<Doi>, stats: &mut RunStats) -> Option<Doi> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        stats.received += 1;

        let doi = match Doi::parse(line) {
            Ok(doi) => doi,
            Err(error) => {
                warn!(input = line, error = %error, "skipping invalid DOI");
                stats.invalid += 1;
                return None;
            }
        };
        if !seen.insert(doi.clone()) {
            debug!(doi = %doi, "skipping duplicate DOI");
            stats.duplicates += 1;
            return None;
        }
        if self.already_resolved.contains(&doi) {
            debug!(doi = %doi, "already resolved in an earlier run");
            stats.skipped += 1;
            return None;
        }
        Some(doi)
    }

    async fn record(&self, result: &ResolutionResult) -> Result<(), SchedulerError> {
        match tokio::time::timeout(self.sink_timeout, self.sink.record(result)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(SchedulerError::Sink {
                doi: result.doi.to_string(),
                source,
            }),
            Err(_elapsed) => Err(SchedulerError::SinkTimeout {
                doi: result.doi.to_string(),
                timeout: self.sink_timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("concurrency", &self.concurrency)
            .field("sink_timeout", &self.sink_timeout)
            .field("already_resolved", &self.already_resolved.len())
            .finish_non_exhaustive()
    }
}

/// Waits for a free worker slot, then for the next input line.
async fn next_input<S>(
    semaphore: &Arc<Semaphore>,
    input: &mut S,
) -> Result<(OwnedSemaphorePermit, Option<String>), SchedulerError>
where
    S: Stream<Item = String> + Unpin,
{
    let permit = Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|_| SchedulerError::SemaphoreClosed)?;
    Ok((permit, input.next().await))
}

/// Runs a workflow, turning a panic into an error result for its DOI.
///
/// Panics inside a workflow step are already caught by the workflow and keep
/// the attempt log. This guard covers the rest of the task, and its result
/// has no attempts.
async fn run_guarded(
    workflow: &ResolutionWorkflow,
    doi: Doi,
    cancel: &CancellationToken,
) -> ResolutionResult {
    match AssertUnwindSafe(workflow.run(doi.clone(), cancel))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(doi = %doi, panic = %message, "workflow panicked");
            ResolutionResult::error(doi, WorkflowError::Panicked(message), Vec::new())
        }
    }
}

/// Result for a DOI whose worker task died or was aborted.
fn lost_worker_result(doi: Doi, join_error: JoinError) -> ResolutionResult {
    let message = if join_error.is_panic() {
        panic_message(join_error.into_panic().as_ref())
    } else {
        join_error.to_string()
    };
    error!(doi = %doi, error = %message, "worker task failed");
    ResolutionResult::error(doi, WorkflowError::Panicked(message), Vec::new())
}

/// Builds a scheduler with the default resolver and HTTP fetcher.
///
/// # Errors
///
/// Returns [`SchedulerError`] if the configuration is invalid or a client
/// cannot be constructed.
pub fn build_default_scheduler(
    config: &FetchConfig,
    throttle: Arc<HostThrottle>,
    sink: Arc<dyn ResultSink>,
) -> Result<Scheduler, SchedulerError> {
    config.validate()?;
    let resolver = build_default_resolver(config, Arc::clone(&throttle))?;
    let fetcher = HttpFetcher::new(config, throttle)?;
    let workflow = ResolutionWorkflow::from_config(Arc::new(resolver), Arc::new(fetcher), config);
    Ok(Scheduler::new(Arc::new(workflow), sink, config.concurrency)?
        .with_sink_timeout(config.sink_timeout))
}
