//! Core data models for NEPSE feeds
//!
//! This module contains the record types served by every feed and the
//! [`Payload`] contract the cache uses to tell an empty result from a real one.

pub mod format;

use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::FeedKind;

/// A named, independently cached data series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feed {
    /// Today's price table for every traded symbol
    TodaysPrices,
    /// Listed companies with their sectors
    CompanyList,
    /// Index value and market-wide statistics
    MarketSummary,
    /// Detail page for one listed company
    CompanyDetail(String),
    /// Open/closed banner; computed from the calendar when unavailable
    MarketStatus,
}

impl Feed {
    /// Stable key used for logging and persisted file names
    pub fn key(&self) -> String {
        match self {
            Feed::TodaysPrices => "todays_prices".to_string(),
            Feed::CompanyList => "company_list".to_string(),
            Feed::MarketSummary => "market_summary".to_string(),
            Feed::CompanyDetail(symbol) => format!("company_detail_{}", symbol.to_lowercase()),
            Feed::MarketStatus => "market_status".to_string(),
        }
    }

    /// Configuration kind of this feed
    pub fn kind(&self) -> FeedKind {
        match self {
            Feed::TodaysPrices => FeedKind::TodaysPrices,
            Feed::CompanyList => FeedKind::CompanyList,
            Feed::MarketSummary => FeedKind::MarketSummary,
            Feed::CompanyDetail(_) => FeedKind::CompanyDetail,
            Feed::MarketStatus => FeedKind::MarketStatus,
        }
    }

    /// Parses a feed name as used on the command line and in configuration.
    ///
    /// `company_detail:<SYMBOL>` selects a detail feed.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "todays_prices" | "prices" => Some(Feed::TodaysPrices),
            "company_list" | "companies" => Some(Feed::CompanyList),
            "market_summary" | "summary" => Some(Feed::MarketSummary),
            "market_status" | "status" => Some(Feed::MarketStatus),
            other => other
                .strip_prefix("company_detail:")
                .filter(|sym| !sym.is_empty())
                .map(|sym| Feed::CompanyDetail(sym.to_uppercase())),
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Value held by a cache entry
///
/// A payload that reports `is_empty()` never replaces cached data: an empty
/// parse is treated the same as a failed fetch.
pub trait Payload: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Whether this payload carries no usable data
    fn is_empty(&self) -> bool;

    /// Number of records, used for logging
    fn record_count(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            1
        }
    }
}

impl<T> Payload for Vec<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }

    fn record_count(&self) -> usize {
        self.len()
    }
}

/// One row of today's price table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPrice {
    /// Ticker symbol
    pub symbol: String,
    /// Last traded price
    pub ltp: f64,
    /// Absolute change from the previous close
    pub change: f64,
    /// Percent change from the previous close
    pub percent_change: f64,
    /// Day high
    pub high: f64,
    /// Day low
    pub low: f64,
    /// Opening price
    pub open: f64,
    /// Traded quantity
    pub qty: u64,
}

/// A listed company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub symbol: String,
    pub company_name: String,
    /// Sector name, `"N/A"` when the listing has none
    pub sector: String,
}

/// Placeholder sector for listings without one
pub const UNKNOWN_SECTOR: &str = "N/A";

/// Direction of the index change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Positive,
    Negative,
}

/// Market-wide figures from the exchange front page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    /// Current index value
    pub index: Option<f64>,
    /// Point change of the index
    pub index_change: Option<f64>,
    pub direction: Option<Direction>,
    pub turnover: Option<f64>,
    pub traded_shares: Option<f64>,
    pub transactions: Option<f64>,
    pub market_cap: Option<f64>,
}

impl Payload for MarketSummary {
    fn is_empty(&self) -> bool {
        self.index.is_none()
            && self.index_change.is_none()
            && self.turnover.is_none()
            && self.traded_shares.is_none()
            && self.transactions.is_none()
            && self.market_cap.is_none()
    }
}

/// Detail page of one company
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDetail {
    pub symbol: String,
    pub company_name: Option<String>,
    /// Label/value pairs from the company info table, labels in snake_case
    pub attributes: BTreeMap<String, String>,
}

impl Payload for CompanyDetail {
    fn is_empty(&self) -> bool {
        self.company_name.is_none() && self.attributes.is_empty()
    }

    fn record_count(&self) -> usize {
        self.attributes.len() + usize::from(self.company_name.is_some())
    }
}

/// Where a market status answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusOrigin {
    /// Read from the exchange page
    Live,
    /// Computed from configured trading hours
    Calendar,
}

/// Whether the market is open right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub is_open: bool,
    pub status_text: String,
    pub origin: StatusOrigin,
}

impl MarketStatus {
    /// Status derived from the trading calendar alone
    pub fn from_calendar(is_open: bool) -> Self {
        Self {
            is_open,
            status_text: if is_open { "Market Open" } else { "Market Closed" }.to_string(),
            origin: StatusOrigin::Calendar,
        }
    }
}

impl Default for MarketStatus {
    fn default() -> Self {
        Self::from_calendar(false)
    }
}

impl Payload for MarketStatus {
    fn is_empty(&self) -> bool {
        self.status_text.trim().is_empty()
    }
}
