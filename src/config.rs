//! Runtime configuration for a resolution run.
//!
//! [`FetchConfig`] gathers every tunable the pipeline reads. The CLI layers a
//! config file and command-line flags over [`FetchConfig::default`], then calls
//! [`FetchConfig::validate`] before anything is constructed.

use std::time::Duration;

use thiserror::Error;

use crate::throttle::DEFAULT_MIN_INTERVAL;

/// Default number of DOIs processed concurrently.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Largest accepted concurrency.
pub const MAX_CONCURRENCY: usize = 100;

/// Default fetch attempts per candidate, counting the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest accepted per-candidate attempt budget.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default base URL of the DOI resolution service.
pub const DEFAULT_DOI_ORG_BASE_URL: &str = "https://doi.org";

/// Default base URL of the Unpaywall API.
pub const DEFAULT_UNPAYWALL_BASE_URL: &str = "https://api.unpaywall.org";

/// Errors raised by invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric setting is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Rejected value, rendered.
        value: String,
        /// Accepted range, rendered.
        expected: &'static str,
    },

    /// A setting is malformed.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Settings for one resolution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Maximum DOIs in flight at once (1..=100).
    pub concurrency: usize,
    /// Fetch attempts per candidate, including the first (1..=10).
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per retry.
    pub base_backoff: Duration,
    /// Cap on a single backoff.
    pub max_backoff: Duration,
    /// Upper bound of the random jitter added to each backoff.
    pub backoff_jitter: Duration,
    /// Interval between requests to a host that declares no crawl delay.
    pub min_interval: Duration,
    /// Interval for the resolver API hosts (doi.org, Unpaywall).
    pub api_min_interval: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-exchange timeout for one request, body included.
    pub request_timeout: Duration,
    /// Largest payload accepted from a single response.
    pub max_payload_bytes: u64,
    /// Whether robots.txt is consulted for crawl delays and disallow rules.
    pub check_robots: bool,
    /// Contact email for Unpaywall. `None` builds a resolver without the
    /// open-access lookup; the CLI refuses to run without one.
    pub unpaywall_email: Option<String>,
    /// Longest a single sink write may take before the run is aborted.
    pub sink_timeout: Duration,
    /// Base URL of the DOI resolution service.
    pub doi_org_base_url: String,
    /// Base URL of the Unpaywall API.
    pub unpaywall_base_url: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            backoff_jitter: Duration::from_millis(500),
            min_interval: DEFAULT_MIN_INTERVAL,
            api_min_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_payload_bytes: 100 * 1024 * 1024,
            check_robots: true,
            unpaywall_email: None,
            sink_timeout: Duration::from_secs(30),
            doi_org_base_url: DEFAULT_DOI_ORG_BASE_URL.to_string(),
            unpaywall_base_url: DEFAULT_UNPAYWALL_BASE_URL.to_string(),
        }
    }
}

impl FetchConfig {
    /// Checks every setting against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::out_of_range(
                "concurrency",
                self.concurrency,
                "1..=100",
            ));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::out_of_range(
                "max_attempts",
                self.max_attempts,
                "1..=10",
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "base_backoff",
                format!(
                    "{}ms exceeds max_backoff {}ms",
                    self.base_backoff.as_millis(),
                    self.max_backoff.as_millis()
                ),
            ));
        }
        if self.min_interval > Duration::from_secs(60) {
            return Err(ConfigError::out_of_range(
                "min_interval_ms",
                self.min_interval.as_millis(),
                "0..=60000",
            ));
        }
        for (field, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("sink_timeout", self.sink_timeout),
        ] {
            if timeout.is_zero() || timeout > Duration::from_secs(3600) {
                return Err(ConfigError::out_of_range(
                    field,
                    format!("{}s", timeout.as_secs()),
                    "1..=3600 seconds",
                ));
            }
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::invalid(
                "max_payload_bytes",
                "must be greater than zero",
            ));
        }
        if let Some(email) = &self.unpaywall_email {
            validate_email(email)?;
        }
        for (field, base) in [
            ("doi_org_base_url", &self.doi_org_base_url),
            ("unpaywall_base_url", &self.unpaywall_base_url),
        ] {
            url::Url::parse(base)
                .map_err(|error| ConfigError::invalid(field, format!("'{base}': {error}")))?;
        }
        Ok(())
    }

    /// Returns the Unpaywall contact email the open-access fallback needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for `email` when none is configured.
    pub fn require_unpaywall_email(&self) -> Result<&str, ConfigError> {
        self.unpaywall_email.as_deref().ok_or_else(|| {
            ConfigError::invalid(
                "email",
                "an Unpaywall contact email is required for the open-access fallback",
            )
        })
    }
}

fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ConfigError::invalid(
            "unpaywall_email",
            "contains whitespace or control characters",
        ));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ConfigError::invalid(
            "unpaywall_email",
            format!("'{email}' is not an email address"),
        )),
    }
}
