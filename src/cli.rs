//! Command-line interface parsing for nepse-feed
//!
//! Global flags select the config file, cache directory and log level; each
//! subcommand maps to one query on the market data service. Values clap can't
//! check by itself (sort fields, log levels, timestamps) are validated here.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::Config;
use crate::service::{PriceQuery, SortField};

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The sort field is not recognized
    #[error("Invalid sort field: '{0}'. Valid fields: symbol, ltp, change, percent_change, qty")]
    InvalidSortField(String),

    /// The log level is not recognized
    #[error("Invalid log level: '{0}'. Valid levels: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// The timestamp is neither RFC 3339 nor a local date and time
    #[error("Invalid date/time: '{0}'. Use RFC 3339 or local 'YYYY-MM-DD HH:MM'")]
    InvalidDateTime(String),
}

/// NEPSE market data with caching and background refresh
#[derive(Parser, Debug)]
#[command(name = "nepse-feed")]
#[command(about = "Cached NEPSE market data scraped from public exchange pages")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/nepse-feed/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for persisted snapshots, overriding the config file
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log level for nepse-feed output (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the background refresher until Ctrl-C
    Run,

    /// Today's prices with optional filters
    ///
    /// Examples:
    ///   nepse-feed prices --symbol NAB
    ///   nepse-feed prices --sector "Hydro Power" --sort-by percent_change --desc --limit 10
    Prices {
        /// Symbol substring, case-insensitive
        #[arg(long)]
        symbol: Option<String>,
        /// Sector name from the company list
        #[arg(long)]
        sector: Option<String>,
        /// One of: symbol, ltp, change, percent_change, qty
        #[arg(long, value_name = "FIELD")]
        sort_by: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Bypass the cache
        #[arg(long)]
        refresh: bool,
    },

    /// Symbols with the largest gains
    Gainers {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        refresh: bool,
    },

    /// Symbols with the largest losses
    Losers {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        refresh: bool,
    },

    /// Distinct sectors of listed companies
    Sectors {
        #[arg(long)]
        refresh: bool,
    },

    /// Listed companies
    Companies {
        #[arg(long)]
        sector: Option<String>,
        /// Symbol or name substring
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        refresh: bool,
    },

    /// Index and market statistics
    Summary {
        #[arg(long)]
        refresh: bool,
    },

    /// Detail page of one company
    Company {
        symbol: String,
        #[arg(long)]
        refresh: bool,
    },

    /// Whether the market is open, live when available
    Status,

    /// Write today's prices to a CSV file
    ExportCsv {
        path: PathBuf,
        #[arg(long)]
        refresh: bool,
    },

    /// Whether trading hours cover a moment (no network)
    MarketOpen {
        /// RFC 3339, or local "YYYY-MM-DD HH:MM"; defaults to now
        #[arg(long, value_name = "WHEN")]
        at: Option<String>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Load and validate, failing on the first problem
    Check,
    /// Print the effective configuration
    Show,
}

/// Settings derived from global CLI flags
#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub config_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub log_level: tracing::Level,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            cache_dir: None,
            log_level: tracing::Level::INFO,
        }
    }
}

impl StartupConfig {
    /// Creates a StartupConfig from parsed CLI arguments
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        Ok(Self {
            config_path: cli.config.clone(),
            cache_dir: cli.cache_dir.clone(),
            log_level: parse_log_level(&cli.log_level)?,
        })
    }

    /// Applies flag overrides to a loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
    }

    /// Default `EnvFilter` directive for the chosen level
    pub fn log_directive(&self) -> String {
        format!("nepse_feed={}", self.log_level.as_str().to_lowercase())
    }
}

pub fn parse_log_level(s: &str) -> Result<tracing::Level, CliError> {
    s.trim()
        .parse::<tracing::Level>()
        .map_err(|_| CliError::InvalidLogLevel(s.to_string()))
}

pub fn parse_sort_field(s: &str) -> Result<SortField, CliError> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
        "symbol" => Ok(SortField::Symbol),
        "ltp" | "price" => Ok(SortField::Ltp),
        "change" => Ok(SortField::Change),
        "percent_change" | "percent" => Ok(SortField::PercentChange),
        "qty" | "volume" => Ok(SortField::Qty),
        _ => Err(CliError::InvalidSortField(s.to_string())),
    }
}

/// Parses `--at`: RFC 3339, or a date and time in the exchange timezone
pub fn parse_at_arg(s: &str, tz: Tz) -> Result<DateTime<Utc>, CliError> {
    let s = s.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
        return Ok(instant.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| CliError::InvalidDateTime(s.to_string()))
}

/// Builds the price query for the `prices` command
pub fn price_query(command: &Command) -> Result<Option<PriceQuery>, CliError> {
    let Command::Prices {
        symbol,
        sector,
        sort_by,
        desc,
        limit,
        offset,
        ..
    } = command
    else {
        return Ok(None);
    };

    Ok(Some(PriceQuery {
        symbol: symbol.clone(),
        sector: sector.clone(),
        sort_by: sort_by.as_deref().map(parse_sort_field).transpose()?,
        descending: *desc,
        offset: *offset,
        limit: *limit,
    }))
}
