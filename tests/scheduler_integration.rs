//! Scheduler timing and concurrency properties.
//!
//! Runs on a paused clock with in-process resolver and fetcher doubles so
//! the host gate and the concurrency bound can be observed exactly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use doifetch_core::{
    CandidateResolver, CandidateSource, DocumentFormat, Doi, FetchError, FetchOutcome, Fetcher,
    HostThrottle, MemorySink, ResolutionWorkflow, RetryPolicy, Scheduler, SourceKind,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Puts every DOI on the host named by its registrant prefix.
struct HostPerPrefix;

#[async_trait]
impl CandidateResolver for HostPerPrefix {
    async fn resolve(&self, doi: &Doi) -> Vec<CandidateSource> {
        let prefix = doi.as_str().split('/').next().unwrap_or("10.0");
        vec![CandidateSource::new(
            format!("https://host-{prefix}.example/{doi}"),
            SourceKind::Publisher,
            0,
        )]
    }
}

/// Passes through the throttle, records when each request went out, then
/// holds the slot for `work`.
struct RecordingFetcher {
    throttle: Arc<HostThrottle>,
    work: Duration,
    starts: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingFetcher {
    fn new(throttle: Arc<HostThrottle>, work: Duration) -> Self {
        Self {
            throttle,
            work,
            starts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn starts_for(&self, host: &str) -> Vec<Instant> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(
        &self,
        _doi: &Doi,
        candidate: &CandidateSource,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let host = candidate.host();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(FetchError::Cancelled);
            }
            () = self.throttle.acquire(&host) => {}
        }
        self.starts.lock().unwrap().push((host, Instant::now()));
        tokio::time::sleep(self.work).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(FetchOutcome::success(
            candidate,
            &candidate.url,
            DocumentFormat::Pdf,
            b"%PDF-1.4".to_vec(),
        ))
    }
}

fn scheduler(
    fetcher: Arc<RecordingFetcher>,
    sink: Arc<MemorySink>,
    concurrency: usize,
) -> Scheduler {
    let workflow = ResolutionWorkflow::new(
        Arc::new(HostPerPrefix),
        fetcher,
        RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(1), Duration::ZERO),
    );
    Scheduler::new(Arc::new(workflow), sink, concurrency).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_same_host_requests_spaced_by_interval() {
    let throttle = Arc::new(HostThrottle::new(Duration::from_secs(2)));
    let fetcher = Arc::new(RecordingFetcher::new(Arc::clone(&throttle), Duration::from_millis(10)));
    let sink = Arc::new(MemorySink::new());
    let scheduler = scheduler(Arc::clone(&fetcher), Arc::clone(&sink), 10);

    let dois = (0..4).map(|i| format!("10.1000/paper-{i}"));
    let stats = scheduler.run_all(dois, &CancellationToken::new()).await.unwrap();

    assert_eq!(stats.resolved, 4);
    let mut starts = fetcher.starts_for("host-10.1000.example");
    starts.sort();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_secs(2),
            "same-host requests {:?} apart",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_host_does_not_delay_other_host() {
    let throttle = Arc::new(HostThrottle::new(Duration::from_millis(100)));
    throttle.configure_host("host-10.1000.example", Duration::from_secs(30));
    let fetcher = Arc::new(RecordingFetcher::new(Arc::clone(&throttle), Duration::from_millis(10)));
    let sink = Arc::new(MemorySink::new());
    let scheduler = scheduler(Arc::clone(&fetcher), Arc::clone(&sink), 10);

    let started = Instant::now();
    let dois = vec![
        "10.1000/slow-a".to_string(),
        "10.1000/slow-b".to_string(),
        "10.2000/fast-a".to_string(),
    ];
    let stats = scheduler.run_all(dois, &CancellationToken::new()).await.unwrap();
    assert_eq!(stats.resolved, 3);

    let fast = fetcher.starts_for("host-10.2000.example");
    assert_eq!(fast.len(), 1);
    assert!(
        fast[0] - started < Duration::from_secs(1),
        "other host waited {:?}",
        fast[0] - started
    );

    let mut slow = fetcher.starts_for("host-10.1000.example");
    slow.sort();
    assert!(slow[1] - slow[0] >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_concurrency() {
    let throttle = Arc::new(HostThrottle::new(Duration::ZERO));
    let fetcher = Arc::new(RecordingFetcher::new(Arc::clone(&throttle), Duration::from_secs(1)));
    let sink = Arc::new(MemorySink::new());
    let scheduler = scheduler(Arc::clone(&fetcher), Arc::clone(&sink), 3);

    // Distinct hosts so only the concurrency bound limits parallelism
    let dois = (0..12).map(|i| format!("10.{}/x", 1000 + i));
    let stats = scheduler.run_all(dois, &CancellationToken::new()).await.unwrap();

    assert_eq!(stats.resolved, 12);
    assert_eq!(sink.len(), 12);
    assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_records_every_started_doi() {
    let throttle = Arc::new(HostThrottle::new(Duration::from_secs(5)));
    let fetcher = Arc::new(RecordingFetcher::new(Arc::clone(&throttle), Duration::from_millis(10)));
    let sink = Arc::new(MemorySink::new());
    let scheduler = scheduler(Arc::clone(&fetcher), Arc::clone(&sink), 2);

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel.cancel();
        })
    };

    let dois = (0..6).map(|i| format!("10.1000/queued-{i}"));
    let stats = scheduler.run_all(dois, &cancel).await.unwrap();
    canceller.await.unwrap();

    // Every admitted DOI ends in exactly one recorded result
    assert_eq!(stats.finished(), sink.len());
    assert!(stats.errored >= 1, "stats: {stats:?}");
    assert!(stats.resolved >= 1, "stats: {stats:?}");
    assert!(sink.len() < 6, "unstarted DOIs must not be consumed");
    for result in sink.results() {
        assert!(result.is_resolved() || result.error_detail().as_deref() == Some("cancelled"));
    }
}
