//! Per-host request gate.
//!
//! [`HostThrottle`] enforces a minimum interval between consecutive requests to
//! the same host. Hosts are tracked independently: a caller waiting on a slow
//! host never holds anything another host's callers need.
//!
//! # Overview
//!
//! Each host gets its own state, created lazily on first contact and kept for
//! the lifetime of the throttle. The state holds the time of the last granted
//! request behind a `tokio::sync::Mutex`. That mutex is fair, so concurrent
//! waiters for one host are admitted in arrival order.
//!
//! Crawl delays discovered on the wire only ever raise a host's interval.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use doifetch_core::HostThrottle;
//!
//! # async fn example() {
//! let throttle = HostThrottle::new(Duration::from_secs(1));
//!
//! // First request to a host proceeds immediately
//! throttle.acquire("example.com").await;
//!
//! // Second request to the same host waits out the interval
//! throttle.acquire("example.com").await;
//!
//! // Other hosts are unaffected
//! throttle.acquire("other.org").await;
//! # }
//! ```

mod retry_after;

pub use retry_after::{MAX_RETRY_AFTER, parse_retry_after};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Conservative default interval between requests to one host.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Warning threshold for cumulative delay per host (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Host key used when a URL has no parseable host.
const UNKNOWN_HOST: &str = "unknown";

/// Keyed registry of per-host request gates.
///
/// Designed to be wrapped in `Arc` and shared by every resolver and fetcher in
/// a run. The `DashMap` is only touched to look up a host's state; the `Arc`
/// is cloned out so no shard lock is held across an await.
#[derive(Debug)]
pub struct HostThrottle {
    /// Interval given to hosts seen for the first time.
    default_interval: Duration,

    /// Per-host state.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// Time the last request was granted. `None` until the first grant.
    last_request: Mutex<Option<Instant>>,

    /// Current minimum interval in milliseconds.
    min_interval_ms: AtomicU64,

    /// Whether the interval came from a directive rather than the default.
    learned: AtomicBool,

    /// Total time callers have spent waiting on this host.
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new(interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval_ms: AtomicU64::new(duration_ms(interval)),
            learned: AtomicBool::new(false),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = duration_ms(delay);
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

impl HostThrottle {
    /// Creates a throttle that gives every new host `default_interval`.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = default_interval.as_millis()))]
    pub fn new(default_interval: Duration) -> Self {
        debug!("creating host throttle");
        Self {
            default_interval,
            hosts: DashMap::new(),
        }
    }

    /// Returns the interval given to hosts seen for the first time.
    #[must_use]
    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(HostState::new(self.default_interval)))
            .clone()
    }

    /// Waits until a request to `host` is permitted, then records it.
    ///
    /// Two consecutive returns for the same host are always separated by at
    /// least that host's current interval. Waiters on the same host are served
    /// in arrival order.
    ///
    /// Cancel safe: dropping the future before it completes leaves the host's
    /// state exactly as it was.
    #[instrument(skip(self))]
    pub async fn acquire(&self, host: &str) {
        let state = self.state(host);

        // Only the per-host mutex is held across the sleep
        let mut last_request = state.last_request.lock().await;

        if let Some(last) = *last_request {
            let interval = state.interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                let delay = interval.saturating_sub(elapsed);
                debug!(delay_ms = delay.as_millis(), "waiting for host interval");
                tokio::time::sleep(delay).await;

                let cumulative = state.add_cumulative_delay(delay);
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                    && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
                {
                    warn!(
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive throttling - many requests are queued for this host"
                    );
                }
            }
        } else {
            debug!("first request to host - no delay");
        }

        *last_request = Some(Instant::now());
    }

    /// Raises a host's interval to `observed` if it is larger than the current one.
    ///
    /// Returns the interval in effect afterwards.
    #[instrument(skip(self), fields(observed_ms = observed.as_millis()))]
    pub fn update_interval(&self, host: &str, observed: Duration) -> Duration {
        let state = self.state(host);
        let previous = state
            .min_interval_ms
            .fetch_max(duration_ms(observed), Ordering::SeqCst);
        let current = state.interval();
        if current.as_millis() > u128::from(previous) {
            state.learned.store(true, Ordering::SeqCst);
            debug!(
                previous_ms = previous,
                current_ms = current.as_millis(),
                "raised host interval"
            );
        }
        current
    }

    /// Sets a host's interval outright.
    ///
    /// Used for well-known API hosts whose documented rate differs from the
    /// default. Learned crawl delays may still raise it afterwards.
    pub fn configure_host(&self, host: &str, interval: Duration) {
        let state = self.state(host);
        state
            .min_interval_ms
            .store(duration_ms(interval), Ordering::SeqCst);
        debug!(host, interval_ms = interval.as_millis(), "configured host interval");
    }

    /// Returns the interval currently in effect for `host`.
    #[must_use]
    pub fn interval_for(&self, host: &str) -> Duration {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map_or(self.default_interval, |state| state.interval())
    }

    /// Loads intervals learned in an earlier run.
    ///
    /// Seeded values follow the same keep-the-larger rule as
    /// [`update_interval`](Self::update_interval).
    pub fn seed<I>(&self, intervals: I)
    where
        I: IntoIterator<Item = (String, Duration)>,
    {
        let mut count = 0_usize;
        for (host, interval) in intervals {
            self.update_interval(&host, interval);
            count += 1;
        }
        debug!(count, "seeded host intervals");
    }

    /// Returns every host whose interval was raised by an observed directive.
    #[must_use]
    pub fn learned_intervals(&self) -> HashMap<String, Duration> {
        self.hosts
            .iter()
            .filter(|entry| entry.value().learned.load(Ordering::SeqCst))
            .map(|entry| (entry.key().clone(), entry.value().interval()))
            .collect()
    }

    /// Returns the number of hosts contacted or configured so far.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

impl Default for HostThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

/// Extracts the throttle key from a URL.
///
/// The key is the lowercased host, with the port appended when it is not the
/// scheme default. Returns `"unknown"` for malformed URLs so they are still
/// throttled.
///
/// # Examples
///
/// ```
/// use doifetch_core::host_of;
///
/// assert_eq!(host_of("https://Example.COM/path"), "example.com");
/// assert_eq!(host_of("https://example.com:443/x"), "example.com");
/// assert_eq!(host_of("http://127.0.0.1:8080/x"), "127.0.0.1:8080");
/// assert_eq!(host_of("not a url"), "unknown");
/// ```
#[must_use]
pub fn host_of(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return UNKNOWN_HOST.to_string();
    };
    match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{}:{port}", host.to_lowercase()),
        (Some(host), None) => host.to_lowercase(),
        (None, _) => UNKNOWN_HOST.to_string(),
    }
}
