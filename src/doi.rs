//! DOI normalization.
//!
//! A [`Doi`] is the unit of work for the whole pipeline and the key into every
//! downstream table, so two spellings of the same identifier must collapse to
//! one value. DOIs are case-insensitive; the normalized form is lowercase with
//! resolver prefixes and percent-encoding removed.
//!
//! # Example
//!
//! ```
//! use doifetch_core::Doi;
//!
//! let doi = Doi::parse("https://doi.org/10.1234/ABC%2D1").unwrap();
//! assert_eq!(doi.as_str(), "10.1234/abc-1");
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::trace;

/// Prefixes stripped from DOI input before validation.
const URL_PREFIXES: [&str; 4] = [
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
];

/// Errors produced when input cannot be normalized into a DOI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DoiError {
    /// Input was empty after trimming.
    #[error("empty DOI input")]
    Empty,

    /// Input does not follow the `10.<registrant>/<suffix>` shape.
    #[error("invalid DOI '{input}': {reason}")]
    Invalid {
        /// The offending input after prefix stripping.
        input: String,
        /// Which rule was violated.
        reason: &'static str,
    },
}

impl DoiError {
    fn invalid(input: &str, reason: &'static str) -> Self {
        Self::Invalid {
            input: input.to_string(),
            reason,
        }
    }
}

/// A normalized, case-insensitive Digital Object Identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Doi(String);

impl Doi {
    /// Normalizes and validates raw DOI input.
    ///
    /// Accepts bare DOIs, `doi:` prefixed DOIs and `doi.org` URLs.
    ///
    /// # Errors
    ///
    /// Returns [`DoiError`] when the input is empty or not shaped like a DOI.
    pub fn parse(input: &str) -> Result<Self, DoiError> {
        let mut value = input.trim();
        if value.is_empty() {
            return Err(DoiError::Empty);
        }

        if let Some(rest) = URL_PREFIXES
            .iter()
            .find_map(|prefix| strip_prefix_ignore_case(value, prefix))
        {
            value = rest;
        }
        if let Some(rest) = strip_prefix_ignore_case(value, "doi:") {
            value = rest.trim_start();
        }

        let decoded = urlencoding::decode(value)
            .map_or_else(|_| value.to_string(), std::borrow::Cow::into_owned);
        let normalized = decoded.trim().to_lowercase();
        trace!(input, normalized = %normalized, "normalized DOI input");

        validate(&normalized)?;
        Ok(Self(normalized))
    }

    /// Returns the normalized identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the DOI percent-encoded for use as a URL path, keeping `/` separators.
    #[must_use]
    pub fn url_path(&self) -> String {
        self.0
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// ASCII case-insensitive `strip_prefix` that never splits a multi-byte char.
fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &value[prefix.len()..])
}

fn validate(doi: &str) -> Result<(), DoiError> {
    let Some(rest) = doi.strip_prefix("10.") else {
        return Err(DoiError::invalid(doi, "DOI must start with '10.'"));
    };
    let Some((registrant, suffix)) = rest.split_once('/') else {
        return Err(DoiError::invalid(doi, "missing '/' before suffix"));
    };

    let first_segment = registrant.split('.').next().unwrap_or("");
    if first_segment.len() < 4 || !registrant.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(DoiError::invalid(
            doi,
            "registrant code must be 4 or more digits",
        ));
    }
    if suffix.trim().is_empty() {
        return Err(DoiError::invalid(doi, "missing suffix after '/'"));
    }
    if doi.chars().any(char::is_whitespace) {
        return Err(DoiError::invalid(doi, "DOI must not contain whitespace"));
    }
    Ok(())
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Doi {
    type Err = DoiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Doi {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
