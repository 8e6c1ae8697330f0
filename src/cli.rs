//! CLI argument definitions using clap derive macros.
//!
//! Tunables are `Option`s so unset flags fall through to the config file and
//! then to the library defaults.

use std::path::PathBuf;

use clap::Parser;

/// Resolve DOIs to full-text documents.
///
/// Each DOI is resolved through its publisher first and an open-access copy
/// second. Every host is contacted at most once per its crawl delay. Results
/// are stored in a SQLite database; DOIs already resolved there are skipped.
#[derive(Parser, Debug)]
#[command(name = "doifetch")]
#[command(author, version, about)]
pub struct Args {
    /// DOIs to resolve (bare, `doi:` prefixed, or doi.org URLs)
    #[arg(value_name = "DOI")]
    pub dois: Vec<String>,

    /// Read DOIs from a file, one per line (`-` for stdin)
    #[arg(short = 'i', long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Results database path [default: doifetch.db]
    #[arg(short = 'd', long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Maximum DOIs processed concurrently (1-100) [default: 10]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub concurrency: Option<u16>,

    /// Fetch attempts per candidate, counting the first (1-10) [default: 3]
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: Option<u32>,

    /// Minimum delay between requests to the same host in milliseconds (max 60000) [default: 1000]
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub min_interval_ms: Option<u64>,

    /// Contact email for the Unpaywall open-access lookup (required here or in the config file)
    #[arg(long, value_name = "ADDR")]
    pub email: Option<String>,

    /// Do not consult robots.txt
    #[arg(long)]
    pub no_robots: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Default log filter for the chosen verbosity.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Whether DOIs come from standard input rather than arguments or a file.
    #[must_use]
    pub fn reads_stdin(&self) -> bool {
        self.input
            .as_deref()
            .is_some_and(|path| path.as_os_str() == "-")
    }
}
