//! CLI entry point for doifetch.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use doifetch_core::{
    Database, FetchConfig, HostThrottle, RunStats, SqliteSink, build_default_scheduler,
};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::FileConfig;
use cli::Args;

const DEFAULT_DATABASE_PATH: &str = "doifetch.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // RUST_LOG wins over -q/-v
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_default_file_config()?;
    if let Some(path) = loaded.path.as_deref()
        && loaded.config.is_some()
    {
        debug!(path = %path.display(), "loaded config file");
    }
    let file_config = loaded.into_config();

    let Some(input) = open_input(&args).await? else {
        info!("No input provided. Pass DOIs as arguments, use --input FILE, or pipe them via stdin.");
        info!("Example: echo '10.1038/nphys1170' | doifetch");
        return Ok(());
    };

    let config = build_fetch_config(&args, &file_config);
    config.validate().context("invalid configuration")?;
    config
        .require_unpaywall_email()
        .context("pass --email ADDR or set `email = \"...\"` in the config file")?;

    let db_path = args
        .database
        .clone()
        .or_else(|| file_config.database.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("failed to open database '{}'", db_path.display()))?;
    let sink = Arc::new(SqliteSink::new(db.clone()));

    let throttle = Arc::new(HostThrottle::new(config.min_interval));
    throttle.seed(
        sink.load_crawl_delays()
            .await
            .context("failed to load stored crawl delays")?,
    );

    let already_resolved = sink
        .resolved_dois()
        .await
        .context("failed to load resolved DOIs")?;
    debug!(count = already_resolved.len(), "DOIs already resolved");

    let scheduler = build_default_scheduler(&config, Arc::clone(&throttle), sink.clone())
        .context("failed to build scheduler")?
        .with_already_resolved(already_resolved);

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    info!(
        database = %db_path.display(),
        concurrency = config.concurrency,
        max_attempts = config.max_attempts,
        "doifetch starting"
    );
    let outcome = scheduler.run(input, &cancel).await;

    // Saved even when the run failed.
    if let Err(error) = sink.save_crawl_delays(&throttle.learned_intervals()).await {
        warn!(error = %error, "failed to save crawl delays");
    }

    let stats = outcome.context("run aborted")?;
    log_summary(&stats, cancel.is_cancelled());
    db.close().await;
    Ok(())
}

/// Layers flags over the config file over library defaults.
fn build_fetch_config(args: &Args, file: &FileConfig) -> FetchConfig {
    let defaults = FetchConfig::default();
    FetchConfig {
        concurrency: args
            .concurrency
            .map(usize::from)
            .or(file.concurrency)
            .unwrap_or(defaults.concurrency),
        max_attempts: args
            .max_attempts
            .or(file.max_attempts)
            .unwrap_or(defaults.max_attempts),
        min_interval: args
            .min_interval_ms
            .or(file.min_interval_ms)
            .map_or(defaults.min_interval, Duration::from_millis),
        connect_timeout: file
            .connect_timeout_secs
            .map_or(defaults.connect_timeout, Duration::from_secs),
        request_timeout: file
            .request_timeout_secs
            .map_or(defaults.request_timeout, Duration::from_secs),
        check_robots: !args.no_robots && file.check_robots.unwrap_or(defaults.check_robots),
        unpaywall_email: args.email.clone().or_else(|| file.email.clone()),
        doi_org_base_url: file
            .doi_org_base_url
            .clone()
            .unwrap_or_else(|| defaults.doi_org_base_url.clone()),
        unpaywall_base_url: file
            .unpaywall_base_url
            .clone()
            .unwrap_or_else(|| defaults.unpaywall_base_url.clone()),
        ..defaults
    }
}

/// Picks the DOI source: arguments, `--input`, or piped stdin.
///
/// Returns `None` when nothing was given and stdin is a terminal.
async fn open_input(args: &Args) -> Result<Option<BoxStream<'static, String>>> {
    if !args.dois.is_empty() {
        return Ok(Some(stream::iter(args.dois.clone()).boxed()));
    }
    if args.reads_stdin() {
        return Ok(Some(line_stream(BufReader::new(tokio::io::stdin()))));
    }
    if let Some(path) = args.input.as_deref() {
        return open_input_file(path).await.map(Some);
    }
    if !std::io::stdin().is_terminal() {
        return Ok(Some(line_stream(BufReader::new(tokio::io::stdin()))));
    }
    Ok(None)
}

async fn open_input_file(path: &Path) -> Result<BoxStream<'static, String>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open input file '{}'", path.display()))?;
    Ok(line_stream(BufReader::new(file)))
}

/// Yields lines lazily, so DOIs not yet pulled stay unread on cancellation.
fn line_stream<R>(reader: R) -> BoxStream<'static, String>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    stream::unfold(reader.lines(), |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "stopped reading input");
                None
            }
        }
    })
    .boxed()
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight requests");
            cancel.cancel();
        }
    });
}

fn log_summary(stats: &RunStats, cancelled: bool) {
    if cancelled {
        warn!(
            finished = stats.finished(),
            "run interrupted; DOIs not yet read were left untouched"
        );
    }
    if stats.errored > 0 {
        warn!(errored = stats.errored, "some DOIs ended in an error; rerun to retry them");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_config() {
        let args = Args::try_parse_from(["doifetch", "-c", "3", "--email", "cli@example.org"])
            .unwrap();
        let file = FileConfig {
            concurrency: Some(7),
            max_attempts: Some(5),
            email: Some("file@example.org".to_string()),
            ..FileConfig::default()
        };
        let config = build_fetch_config(&args, &file);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.unpaywall_email.as_deref(), Some("cli@example.org"));
        assert!(config.check_robots);
    }

    #[test]
    fn test_defaults_without_flags_or_file() {
        let args = Args::try_parse_from(["doifetch"]).unwrap();
        let config = build_fetch_config(&args, &FileConfig::default());
        assert_eq!(config, FetchConfig::default());
    }

    #[test]
    fn test_contact_email_comes_from_flag_or_file() {
        let args = Args::try_parse_from(["doifetch"]).unwrap();
        assert!(
            build_fetch_config(&args, &FileConfig::default())
                .require_unpaywall_email()
                .is_err()
        );

        let file = FileConfig {
            email: Some("file@example.org".to_string()),
            ..FileConfig::default()
        };
        let config = build_fetch_config(&args, &file);
        assert_eq!(config.require_unpaywall_email().unwrap(), "file@example.org");
    }

    #[test]
    fn test_no_robots_flag_wins_over_file() {
        let args = Args::try_parse_from(["doifetch", "--no-robots"]).unwrap();
        let file = FileConfig {
            check_robots: Some(true),
            min_interval_ms: Some(250),
            ..FileConfig::default()
        };
        let config = build_fetch_config(&args, &file);
        assert!(!config.check_robots);
        assert_eq!(config.min_interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_line_stream_yields_every_line() {
        let lines: Vec<String> = line_stream(BufReader::new(&b"10.1/a\n\n10.1/b"[..]))
            .collect()
            .await;
        assert_eq!(lines, vec!["10.1/a", "", "10.1/b"]);
    }
}
