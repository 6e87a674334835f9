//! Configuration for feeds, sources and the refresh schedule
//!
//! Settings come from a JSON file (`--config`, or `config.json` in the XDG
//! config directory) layered over built-in defaults. [`Config::validate`] runs
//! at startup so that a feed without sources fails immediately rather than at
//! the first fetch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::Layout;

/// Longest TTL a feed may have (one year)
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Errors found while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A time of day is not in HH:MM form
    #[error("Invalid time '{0}', expected HH:MM")]
    InvalidTime(String),

    /// Timezone is not a known IANA name
    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// A feed has no sources to fetch from
    #[error("No sources configured for feed '{0}'")]
    NoSources(String),

    /// A feed refers to a provider that isn't defined
    #[error("Feed '{feed}' refers to unknown provider '{provider}'")]
    UnknownProvider { feed: String, provider: String },

    /// A provider's layout has no extraction rules for the feed
    #[error("Provider '{provider}' cannot serve feed '{feed}'")]
    UnsupportedFeed { provider: String, feed: String },

    /// Two providers share a name
    #[error("Duplicate provider name '{0}'")]
    DuplicateProvider(String),

    /// A duration is zero or too large
    #[error("Invalid setting '{0}': out of range")]
    InvalidInterval(&'static str),

    /// Market closes before it opens
    #[error("Market close {close} is before open {open}")]
    InvalidHours { open: String, close: String },
}

/// Kinds of feed that take a source list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    TodaysPrices,
    CompanyList,
    MarketSummary,
    CompanyDetail,
    MarketStatus,
}

impl FeedKind {
    pub const ALL: [FeedKind; 5] = [
        FeedKind::TodaysPrices,
        FeedKind::CompanyList,
        FeedKind::MarketSummary,
        FeedKind::CompanyDetail,
        FeedKind::MarketStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::TodaysPrices => "todays_prices",
            FeedKind::CompanyList => "company_list",
            FeedKind::MarketSummary => "market_summary",
            FeedKind::CompanyDetail => "company_detail",
            FeedKind::MarketStatus => "market_status",
        }
    }

    /// Feeds that may have an empty source list
    fn is_optional(&self) -> bool {
        matches!(self, FeedKind::MarketStatus)
    }
}

/// Trading hours of the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHours {
    /// Opening time, local "HH:MM"
    pub open: String,
    /// Closing time, local "HH:MM" (inclusive)
    pub close: String,
    /// Days without trading
    pub weekend: Vec<Weekday>,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: "11:00".to_string(),
            close: "15:00".to_string(),
            weekend: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}

/// Time-to-live per feed, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub todays_prices_secs: u64,
    pub company_list_secs: u64,
    pub market_summary_secs: u64,
    pub company_detail_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            todays_prices_secs: 15 * 60,
            company_list_secs: 24 * 60 * 60,
            market_summary_secs: 15 * 60,
            company_detail_secs: 60 * 60,
        }
    }
}

/// Background refresh schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Whether `run` starts the background refresher
    pub enabled: bool,
    pub market_open_interval_secs: u64,
    pub market_closed_interval_secs: u64,
    /// Local time after which the company list is refreshed once per day
    pub company_list_at: String,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            market_open_interval_secs: 5 * 60,
            market_closed_interval_secs: 30 * 60,
            company_list_at: "10:00".to_string(),
        }
    }
}

/// One scrapeable site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub layout: Layout,
}

/// Complete runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where snapshots are persisted; XDG cache directory when unset
    pub cache_dir: Option<PathBuf>,
    /// IANA timezone of the exchange
    pub timezone: String,
    pub market: MarketHours,
    pub ttl: TtlConfig,
    pub refresh: RefreshSettings,
    /// Time budget for one source attempt
    pub source_timeout_secs: u64,
    /// Maximum number of company detail entries kept; unbounded when unset
    pub detail_cache_capacity: Option<usize>,
    pub providers: Vec<ProviderConfig>,
    /// Provider names per feed, in priority order
    pub sources: BTreeMap<FeedKind, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        let providers = vec![
            ProviderConfig {
                name: "nepalstock".to_string(),
                base_url: "https://www.nepalstock.com".to_string(),
                layout: Layout::NepalStock,
            },
            ProviderConfig {
                name: "sharesansar".to_string(),
                base_url: "https://www.sharesansar.com".to_string(),
                layout: Layout::ShareSansar,
            },
        ];

        let mut sources = BTreeMap::new();
        sources.insert(
            FeedKind::TodaysPrices,
            vec!["nepalstock".to_string(), "sharesansar".to_string()],
        );
        for kind in [
            FeedKind::CompanyList,
            FeedKind::MarketSummary,
            FeedKind::CompanyDetail,
            FeedKind::MarketStatus,
        ] {
            sources.insert(kind, vec!["nepalstock".to_string()]);
        }

        Self {
            cache_dir: None,
            timezone: "Asia/Kathmandu".to_string(),
            market: MarketHours::default(),
            ttl: TtlConfig::default(),
            refresh: RefreshSettings::default(),
            source_timeout_secs: 10,
            detail_cache_capacity: None,
            providers,
            sources,
        }
    }
}

/// Parses a local time of day in HH:MM form
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime(s.to_string()))
}

impl Config {
    /// Default config file location (`~/.config/nepse-feed/config.json` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "nepse-feed").map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Loads configuration from `path`, or from the default location
    ///
    /// An explicit path must exist. A missing file at the default location
    /// yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match fs::read_to_string(&path) {
            Ok(content) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::from_json(&content)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    /// Parses configuration from JSON; missing fields take their defaults
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Checks the whole configuration, failing on the first problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        let open = self.open_time()?;
        let close = self.close_time()?;
        if close < open {
            return Err(ConfigError::InvalidHours {
                open: self.market.open.clone(),
                close: self.market.close.clone(),
            });
        }
        self.company_list_at()?;

        if self.refresh.market_open_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("refresh.market_open_interval_secs"));
        }
        if self.refresh.market_closed_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("refresh.market_closed_interval_secs"));
        }
        if self.source_timeout_secs == 0 {
            return Err(ConfigError::InvalidInterval("source_timeout_secs"));
        }
        for (name, secs) in [
            ("ttl.todays_prices_secs", self.ttl.todays_prices_secs),
            ("ttl.company_list_secs", self.ttl.company_list_secs),
            ("ttl.market_summary_secs", self.ttl.market_summary_secs),
            ("ttl.company_detail_secs", self.ttl.company_detail_secs),
        ] {
            if secs > MAX_TTL_SECS {
                return Err(ConfigError::InvalidInterval(name));
            }
        }
        if self.detail_cache_capacity == Some(0) {
            return Err(ConfigError::InvalidInterval("detail_cache_capacity"));
        }

        let mut seen = Vec::new();
        for provider in &self.providers {
            if seen.contains(&provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            seen.push(provider.name.as_str());
        }

        for kind in FeedKind::ALL {
            let names = self.sources_for(kind);
            if names.is_empty() && !kind.is_optional() {
                return Err(ConfigError::NoSources(kind.as_str().to_string()));
            }
            for name in names {
                let provider = self.provider(name).ok_or_else(|| ConfigError::UnknownProvider {
                    feed: kind.as_str().to_string(),
                    provider: name.clone(),
                })?;
                if !provider.layout.supports(kind) {
                    return Err(ConfigError::UnsupportedFeed {
                        provider: name.clone(),
                        feed: kind.as_str().to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Provider names for a feed, in priority order
    pub fn sources_for(&self, kind: FeedKind) -> &[String] {
        self.sources.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn open_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_time_of_day(&self.market.open)
    }

    pub fn close_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_time_of_day(&self.market.close)
    }

    pub fn company_list_at(&self) -> Result<NaiveTime, ConfigError> {
        parse_time_of_day(&self.refresh.company_list_at)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    /// TTL of a feed kind, capped at [`MAX_TTL_SECS`]
    pub fn ttl_for(&self, kind: FeedKind) -> chrono::Duration {
        let secs = match kind {
            FeedKind::TodaysPrices => self.ttl.todays_prices_secs,
            FeedKind::CompanyList => self.ttl.company_list_secs,
            FeedKind::MarketSummary => self.ttl.market_summary_secs,
            FeedKind::CompanyDetail => self.ttl.company_detail_secs,
            FeedKind::MarketStatus => 0,
        };
        let secs = i64::try_from(secs.min(MAX_TTL_SECS)).unwrap_or(0);
        chrono::Duration::seconds(secs)
    }
}
