//! Config file loading for CLI defaults.
//!
//! The file is a flat list of `key = value` lines. Strings are double-quoted,
//! `#` starts a comment outside a string.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use doifetch_core::config::{MAX_ATTEMPTS_LIMIT, MAX_CONCURRENCY};

/// Values read from the config file. Unset keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub min_interval_ms: Option<u64>,
    /// Contact email sent to Unpaywall.
    pub email: Option<String>,
    pub check_robots: Option<bool>,
    /// Results database location.
    pub database: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub doi_org_base_url: Option<String>,
    pub unpaywall_base_url: Option<String>,
}

impl FileConfig {
    /// Checks values against the same ranges the flags accept.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=MAX_CONCURRENCY).contains(&concurrency)
        {
            bail!(
                "Invalid config value for `concurrency`: {concurrency}. Expected range: 1..={MAX_CONCURRENCY}"
            );
        }
        if let Some(max_attempts) = self.max_attempts
            && !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts)
        {
            bail!(
                "Invalid config value for `max_attempts`: {max_attempts}. Expected range: 1..={MAX_ATTEMPTS_LIMIT}"
            );
        }
        if let Some(min_interval_ms) = self.min_interval_ms
            && min_interval_ms > 60_000
        {
            bail!(
                "Invalid config value for `min_interval_ms`: {min_interval_ms}. Expected range: 0..=60000"
            );
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("request_timeout_secs", self.request_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Outcome of looking for the default config file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Where the file was looked for, if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file, when one exists.
    pub config: Option<FileConfig>,
}

impl LoadedConfig {
    /// Returns the parsed values, or an empty config when no file was found.
    #[must_use]
    pub fn into_config(self) -> FileConfig {
        self.config.unwrap_or_default()
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/doifetch/config.toml`
/// 2. `$HOME/.config/doifetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("doifetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("doifetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file from the default path if it exists.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "concurrency" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.concurrency = Some(
                    usize::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("concurrency out of range"))?,
                );
            }
            "max_attempts" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.max_attempts = Some(
                    u32::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("max_attempts out of range for u32"))?,
                );
            }
            "min_interval_ms" => {
                cfg.min_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "email" => {
                cfg.email = Some(parse_string_literal(value).with_context(context)?);
            }
            "check_robots" => {
                cfg.check_robots = Some(parse_boolean(value).with_context(context)?);
            }
            "database" => {
                cfg.database = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "request_timeout_secs" => {
                cfg.request_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "doi_org_base_url" => {
                cfg.doi_org_base_url = Some(parse_string_literal(value).with_context(context)?);
            }
            "unpaywall_base_url" => {
                cfg.unpaywall_base_url = Some(parse_string_literal(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
