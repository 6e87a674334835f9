//! Market data service
//!
//! [`MarketData`] owns one [`FeedCache`] per feed plus a per-symbol map of
//! company detail caches. It is shared (behind an `Arc`) by command handlers
//! and the background refresher, and exposes the query surface: raw feeds,
//! rankings, sectors, filtered views and CSV export. None of the queries
//! return errors; they serve the best data available.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::{FeedCache, FeedSnapshot, FetchOutcome, Store};
use crate::config::{Config, ConfigError, FeedKind};
use crate::data::{
    Company, CompanyDetail, Direction, Feed, MarketStatus, MarketSummary, Payload, StatusOrigin,
    StockPrice, UNKNOWN_SECTOR,
};
use crate::market::MarketCalendar;
use crate::source::{HtmlSource, Source, SourceError};

/// Errors building the service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An HTTP client could not be created
    #[error("Failed to create source: {0}")]
    Source(#[from] SourceError),

    /// Company symbols are ASCII letters and digits only
    #[error("Invalid company symbol '{0}'")]
    InvalidSymbol(String),
}

/// Whether `symbol` can name a company detail feed and its snapshot file
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty() && symbol.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Errors writing a CSV export
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Column order of the price export
pub const CSV_HEADER: [&str; 8] = [
    "symbol",
    "ltp",
    "change",
    "percent_change",
    "high",
    "low",
    "open",
    "qty",
];

/// Ordered sources for every feed
#[derive(Clone, Default)]
pub struct SourceSet {
    pub prices: Vec<Arc<dyn Source<Vec<StockPrice>>>>,
    pub companies: Vec<Arc<dyn Source<Vec<Company>>>>,
    pub summary: Vec<Arc<dyn Source<MarketSummary>>>,
    pub detail: Vec<Arc<dyn Source<CompanyDetail>>>,
    /// May be empty; status then comes from the calendar alone
    pub status: Vec<Arc<dyn Source<MarketStatus>>>,
}

impl SourceSet {
    /// Builds one HTML source per configured provider and assigns them to feeds
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let timeout = config.source_timeout();
        let mut built: HashMap<&str, Arc<HtmlSource>> = HashMap::new();
        for provider in &config.providers {
            let source = HtmlSource::new(&provider.name, &provider.base_url, provider.layout, timeout)?;
            built.insert(provider.name.as_str(), Arc::new(source));
        }

        Ok(Self {
            prices: select(config, FeedKind::TodaysPrices, &built)?,
            companies: select(config, FeedKind::CompanyList, &built)?,
            summary: select(config, FeedKind::MarketSummary, &built)?,
            detail: select(config, FeedKind::CompanyDetail, &built)?,
            status: select(config, FeedKind::MarketStatus, &built)?,
        })
    }
}

fn select<T>(
    config: &Config,
    kind: FeedKind,
    built: &HashMap<&str, Arc<HtmlSource>>,
) -> Result<Vec<Arc<dyn Source<T>>>, ConfigError>
where
    HtmlSource: Source<T>,
{
    config
        .sources_for(kind)
        .iter()
        .map(|name| {
            built
                .get(name.as_str())
                .map(|source| Arc::clone(source) as Arc<dyn Source<T>>)
                .ok_or_else(|| ConfigError::UnknownProvider {
                    feed: kind.as_str().to_string(),
                    provider: name.clone(),
                })
        })
        .collect()
}

/// Payload of any feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeedData {
    Prices(Vec<StockPrice>),
    Companies(Vec<Company>),
    Summary(MarketSummary),
    Detail(CompanyDetail),
    Status(MarketStatus),
}

/// Response metadata
#[derive(Debug, Clone, Serialize)]
pub struct FeedMeta {
    pub feed: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub fresh: bool,
    pub market_status: MarketStatus,
}

/// A feed payload with its metadata
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub data: FeedData,
    pub meta: FeedMeta,
}

/// Sort key for [`PriceQuery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Symbol,
    Ltp,
    Change,
    PercentChange,
    Qty,
}

/// Filters and pagination over today's prices
#[derive(Debug, Clone, Default)]
pub struct PriceQuery {
    /// Case-insensitive symbol substring
    pub symbol: Option<String>,
    /// Sector name, matched through the company list
    pub sector: Option<String>,
    pub sort_by: Option<SortField>,
    pub descending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Company detail caches keyed by symbol, optionally bounded
struct DetailCache {
    ttl: Duration,
    attempt_timeout: StdDuration,
    sources: Vec<Arc<dyn Source<CompanyDetail>>>,
    store: Option<Store>,
    capacity: Option<usize>,
    entries: Mutex<DetailEntries>,
}

#[derive(Default)]
struct DetailEntries {
    map: HashMap<String, (Arc<FeedCache<CompanyDetail>>, u64)>,
    tick: u64,
}

impl DetailCache {
    /// Returns the cache for `symbol`, creating it and evicting the least
    /// recently used entry when over capacity
    async fn entry(&self, symbol: &str) -> Result<Arc<FeedCache<CompanyDetail>>, ServiceError> {
        if !is_valid_symbol(symbol) {
            return Err(ServiceError::InvalidSymbol(symbol.to_string()));
        }

        let mut entries = self.entries.lock().await;
        entries.tick += 1;
        let tick = entries.tick;

        if let Some((cache, used)) = entries.map.get_mut(symbol) {
            *used = tick;
            return Ok(Arc::clone(cache));
        }

        let cache = Arc::new(FeedCache::new(
            Feed::CompanyDetail(symbol.to_string()),
            self.ttl,
            self.sources.clone(),
            self.store.clone(),
            self.attempt_timeout,
        )?);
        entries.map.insert(symbol.to_string(), (Arc::clone(&cache), tick));

        if let Some(capacity) = self.capacity {
            while entries.map.len() > capacity {
                let oldest = entries
                    .map
                    .iter()
                    .min_by_key(|(_, (_, used))| *used)
                    .map(|(key, _)| key.clone());
                let Some(oldest) = oldest else { break };
                entries.map.remove(&oldest);
                tracing::debug!(symbol = %oldest, "Evicted company detail from memory");
            }
        }

        Ok(cache)
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.map.len()
    }
}

/// Every cached feed plus the query surface over them
pub struct MarketData {
    prices: FeedCache<Vec<StockPrice>>,
    companies: FeedCache<Vec<Company>>,
    summary: FeedCache<MarketSummary>,
    details: DetailCache,
    status_sources: Vec<Arc<dyn Source<MarketStatus>>>,
    calendar: MarketCalendar,
    attempt_timeout: StdDuration,
}

impl MarketData {
    /// Builds the service with HTML sources and the persisted store from `config`
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let sources = SourceSet::from_config(config)?;
        let store = match &config.cache_dir {
            Some(dir) => Some(Store::with_dir(dir)),
            None => Store::new(),
        };
        match &store {
            Some(store) => tracing::debug!(dir = %store.dir().display(), "Using cache directory"),
            None => tracing::warn!("No cache directory available, snapshots will not be persisted"),
        }
        Self::new(config, sources, store)
    }

    /// Builds the service from explicit sources; feeds hydrate from `store`
    pub fn new(config: &Config, sources: SourceSet, store: Option<Store>) -> Result<Self, ServiceError> {
        let timeout = config.source_timeout();
        if sources.detail.is_empty() {
            return Err(ConfigError::NoSources(FeedKind::CompanyDetail.as_str().to_string()).into());
        }

        Ok(Self {
            prices: FeedCache::new(
                Feed::TodaysPrices,
                config.ttl_for(FeedKind::TodaysPrices),
                sources.prices,
                store.clone(),
                timeout,
            )?,
            companies: FeedCache::new(
                Feed::CompanyList,
                config.ttl_for(FeedKind::CompanyList),
                sources.companies,
                store.clone(),
                timeout,
            )?,
            summary: FeedCache::new(
                Feed::MarketSummary,
                config.ttl_for(FeedKind::MarketSummary),
                sources.summary,
                store.clone(),
                timeout,
            )?,
            details: DetailCache {
                ttl: config.ttl_for(FeedKind::CompanyDetail),
                attempt_timeout: timeout,
                sources: sources.detail,
                store,
                capacity: config.detail_cache_capacity,
                entries: Mutex::new(DetailEntries::default()),
            },
            status_sources: sources.status,
            calendar: MarketCalendar::from_config(config)?,
            attempt_timeout: timeout,
        })
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    /// Payload of any feed
    pub async fn get(&self, feed: &Feed, force_refresh: bool) -> FeedData {
        match feed {
            Feed::TodaysPrices => FeedData::Prices(self.prices(force_refresh).await),
            Feed::CompanyList => FeedData::Companies(self.companies(force_refresh).await),
            Feed::MarketSummary => FeedData::Summary(self.market_summary(force_refresh).await),
            Feed::CompanyDetail(symbol) => FeedData::Detail(self.company_detail(symbol, force_refresh).await),
            Feed::MarketStatus => FeedData::Status(self.market_status().await),
        }
    }

    pub async fn prices(&self, force_refresh: bool) -> Vec<StockPrice> {
        self.prices.get(force_refresh).await
    }

    pub async fn companies(&self, force_refresh: bool) -> Vec<Company> {
        self.companies.get(force_refresh).await
    }

    pub async fn market_summary(&self, force_refresh: bool) -> MarketSummary {
        self.summary.get(force_refresh).await
    }

    /// Detail page of one company; the symbol is case-insensitive
    pub async fn company_detail(&self, symbol: &str, force_refresh: bool) -> CompanyDetail {
        let symbol = symbol.trim().to_uppercase();
        match self.details.entry(&symbol).await {
            Ok(cache) => cache.get(force_refresh).await,
            Err(e) => {
                tracing::warn!(%symbol, error = %e, "Company detail feed unavailable");
                CompanyDetail::default()
            }
        }
    }

    /// Number of company detail entries currently held in memory
    pub async fn cached_details(&self) -> usize {
        self.details.len().await
    }

    /// Symbols with the largest positive percent change, best first
    pub async fn top_gainers(&self, limit: usize) -> Vec<StockPrice> {
        top_movers(&self.prices(false).await, limit, Direction::Positive)
    }

    /// Symbols with the largest negative percent change, worst first
    pub async fn top_losers(&self, limit: usize) -> Vec<StockPrice> {
        top_movers(&self.prices(false).await, limit, Direction::Negative)
    }

    /// Distinct sectors of the company list, sorted
    pub async fn sectors(&self) -> Vec<String> {
        sectors_of(&self.companies(false).await)
    }

    pub async fn prices_filtered(&self, query: &PriceQuery, force_refresh: bool) -> Vec<StockPrice> {
        let prices = self.prices(force_refresh).await;
        let companies = match &query.sector {
            Some(_) => Some(self.companies(false).await),
            None => None,
        };
        filter_prices(prices, companies.as_deref(), query)
    }

    pub async fn companies_filtered(
        &self,
        sector: Option<&str>,
        search: Option<&str>,
        force_refresh: bool,
    ) -> Vec<Company> {
        filter_companies(self.companies(force_refresh).await, sector, search)
    }

    /// Live status when a status source answers, otherwise the calendar's
    pub async fn market_status(&self) -> MarketStatus {
        let feed = Feed::MarketStatus;
        for source in &self.status_sources {
            let result = match tokio::time::timeout(self.attempt_timeout, source.fetch(&feed)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(self.attempt_timeout)),
            };
            match result {
                Ok(status) if !status.is_empty() => return status,
                Ok(_) => tracing::debug!(source = source.name(), "Status source returned nothing"),
                Err(e) => tracing::debug!(source = source.name(), error = %e, "Status source failed"),
            }
        }
        self.calendar_status()
    }

    /// Status from trading hours alone, without network access
    pub fn calendar_status(&self) -> MarketStatus {
        MarketStatus::from_calendar(self.calendar.is_open(&Utc::now()))
    }

    /// Payload of `feed` with freshness metadata
    pub async fn snapshot(&self, feed: &Feed, force_refresh: bool) -> FeedReport {
        let (data, last_updated, fresh) = match feed {
            Feed::TodaysPrices => unpack(self.prices.snapshot(force_refresh).await, FeedData::Prices),
            Feed::CompanyList => unpack(self.companies.snapshot(force_refresh).await, FeedData::Companies),
            Feed::MarketSummary => unpack(self.summary.snapshot(force_refresh).await, FeedData::Summary),
            Feed::CompanyDetail(symbol) => {
                let symbol = symbol.trim().to_uppercase();
                match self.details.entry(&symbol).await {
                    Ok(cache) => unpack(cache.snapshot(force_refresh).await, FeedData::Detail),
                    Err(_) => (FeedData::Detail(CompanyDetail::default()), None, false),
                }
            }
            Feed::MarketStatus => (FeedData::Status(self.market_status().await), Some(Utc::now()), true),
        };

        FeedReport {
            data,
            meta: FeedMeta {
                feed: feed.key(),
                last_updated,
                fresh,
                market_status: self.calendar_status(),
            },
        }
    }

    /// Forces a refresh of `feed`, returning its record count and how it went
    pub async fn refresh(&self, feed: &Feed) -> (usize, FetchOutcome) {
        match feed {
            Feed::TodaysPrices => counted(self.prices.get_with_outcome(true).await),
            Feed::CompanyList => counted(self.companies.get_with_outcome(true).await),
            Feed::MarketSummary => counted(self.summary.get_with_outcome(true).await),
            Feed::CompanyDetail(symbol) => match self.details.entry(&symbol.trim().to_uppercase()).await {
                Ok(cache) => counted(cache.get_with_outcome(true).await),
                Err(_) => (0, FetchOutcome::Fallback),
            },
            Feed::MarketStatus => {
                let status = self.market_status().await;
                let outcome = match status.origin {
                    StatusOrigin::Live => FetchOutcome::Fetched,
                    StatusOrigin::Calendar => FetchOutcome::Fallback,
                };
                (1, outcome)
            }
        }
    }

    /// Writes today's prices to `path` as CSV, returning the row count
    pub async fn export_csv(&self, path: &Path, force_refresh: bool) -> Result<usize, ExportError> {
        let prices = self.prices(force_refresh).await;
        write_prices_csv(path, &prices)?;
        tracing::info!(path = %path.display(), rows = prices.len(), "Exported prices");
        Ok(prices.len())
    }
}

fn unpack<T>(
    snapshot: FeedSnapshot<T>,
    wrap: fn(T) -> FeedData,
) -> (FeedData, Option<DateTime<Utc>>, bool) {
    (wrap(snapshot.data), snapshot.last_updated, snapshot.fresh)
}

fn counted<T: Payload>((payload, outcome): (T, FetchOutcome)) -> (usize, FetchOutcome) {
    (payload.record_count(), outcome)
}

/// Ranks prices by percent change
///
/// Only strictly positive (gainers) or strictly negative (losers) changes
/// qualify. The sort is stable, so ties keep the order the source produced.
pub fn top_movers(prices: &[StockPrice], limit: usize, direction: Direction) -> Vec<StockPrice> {
    let mut movers: Vec<StockPrice> = prices
        .iter()
        .filter(|p| match direction {
            Direction::Positive => p.percent_change > 0.0,
            Direction::Negative => p.percent_change < 0.0,
        })
        .cloned()
        .collect();

    match direction {
        Direction::Positive => movers.sort_by(|a, b| b.percent_change.total_cmp(&a.percent_change)),
        Direction::Negative => movers.sort_by(|a, b| a.percent_change.total_cmp(&b.percent_change)),
    }
    movers.truncate(limit);
    movers
}

/// Distinct known sectors in ascending order
pub fn sectors_of(companies: &[Company]) -> Vec<String> {
    companies
        .iter()
        .map(|c| c.sector.trim())
        .filter(|s| !s.is_empty() && *s != UNKNOWN_SECTOR)
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Applies symbol/sector filters, sorting and pagination
///
/// `companies` is required for sector filtering; without it a sector filter
/// matches nothing.
pub fn filter_prices(prices: Vec<StockPrice>, companies: Option<&[Company]>, query: &PriceQuery) -> Vec<StockPrice> {
    let symbol = query.symbol.as_ref().map(|s| s.to_uppercase());
    let in_sector: Option<HashSet<&str>> = query.sector.as_ref().map(|sector| {
        companies
            .unwrap_or_default()
            .iter()
            .filter(|c| c.sector.eq_ignore_ascii_case(sector.trim()))
            .map(|c| c.symbol.as_str())
            .collect()
    });

    let mut rows: Vec<StockPrice> = prices
        .into_iter()
        .filter(|p| symbol.as_ref().map_or(true, |s| p.symbol.to_uppercase().contains(s.as_str())))
        .filter(|p| in_sector.as_ref().map_or(true, |set| set.contains(p.symbol.as_str())))
        .collect();

    if let Some(field) = query.sort_by {
        rows.sort_by(|a, b| {
            let ordering = match field {
                SortField::Symbol => a.symbol.cmp(&b.symbol),
                SortField::Ltp => a.ltp.total_cmp(&b.ltp),
                SortField::Change => a.change.total_cmp(&b.change),
                SortField::PercentChange => a.percent_change.total_cmp(&b.percent_change),
                SortField::Qty => a.qty.cmp(&b.qty),
            };
            if query.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    rows.into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Filters companies by sector and a symbol/name search, both case-insensitive
pub fn filter_companies(companies: Vec<Company>, sector: Option<&str>, search: Option<&str>) -> Vec<Company> {
    let search = search.map(|s| s.trim().to_lowercase());
    companies
        .into_iter()
        .filter(|c| sector.map_or(true, |s| c.sector.eq_ignore_ascii_case(s.trim())))
        .filter(|c| {
            search.as_ref().map_or(true, |q| {
                c.symbol.to_lowercase().contains(q.as_str()) || c.company_name.to_lowercase().contains(q.as_str())
            })
        })
        .collect()
}

/// Writes prices as CSV with a fixed header, even when there are no rows
pub fn write_prices_csv(path: &Path, prices: &[StockPrice]) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(CSV_HEADER)?;
    for price in prices {
        writer.serialize(price)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type Respond<T> = Box<dyn Fn(&Feed) -> Result<T, SourceError> + Send + Sync>;

    /// Test source answering through a closure and counting calls
    struct FnSource<T> {
        calls: AtomicUsize,
        respond: Respond<T>,
    }

    impl<T> FnSource<T> {
        fn new(respond: impl Fn(&Feed) -> Result<T, SourceError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<T: Send + Sync + 'static> Source<T> for FnSource<T> {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, feed: &Feed) -> Result<T, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(feed)
        }
    }

    fn price(symbol: &str, ltp: f64, percent_change: f64, qty: u64) -> StockPrice {
        StockPrice {
            symbol: symbol.to_string(),
            ltp,
            change: ltp * percent_change / 100.0,
            percent_change,
            high: ltp,
            low: ltp,
            open: ltp,
            qty,
        }
    }

    fn company(symbol: &str, sector: &str) -> Company {
        Company {
            symbol: symbol.to_string(),
            company_name: format!("{} Limited", symbol),
            sector: sector.to_string(),
        }
    }

    fn sample_prices() -> Vec<StockPrice> {
        vec![
            price("NABIL", 510.0, 2.0, 2000),
            price("NICA", 400.0, -2.44, 2050),
            price("UPPER", 220.0, 0.0, 900),
            price("HDL", 1300.0, 5.5, 100),
            price("SHIVM", 600.0, 2.0, 300),
            price("API", 250.0, -4.1, 700),
        ]
    }

    fn sample_companies() -> Vec<Company> {
        vec![
            company("NABIL", "Commercial Banks"),
            company("NICA", "Commercial Banks"),
            company("UPPER", "Hydro Power"),
            company("API", "Hydro Power"),
            company("HDL", "Manufacturing"),
            company("NEW", UNKNOWN_SECTOR),
        ]
    }

    fn detail_for(feed: &Feed) -> Result<CompanyDetail, SourceError> {
        let Feed::CompanyDetail(symbol) = feed else {
            return Err(SourceError::Parse("not a detail feed".to_string()));
        };
        let mut detail = CompanyDetail {
            symbol: symbol.clone(),
            company_name: Some(format!("{} Limited", symbol)),
            ..Default::default()
        };
        detail.attributes.insert("sector".to_string(), "Commercial Banks".to_string());
        Ok(detail)
    }

    fn fake_sources() -> SourceSet {
        SourceSet {
            prices: vec![FnSource::new(|_| Ok(sample_prices()))],
            companies: vec![FnSource::new(|_| Ok(sample_companies()))],
            summary: vec![FnSource::new(|_| Err(SourceError::Status(500)))],
            detail: vec![FnSource::new(detail_for)],
            status: Vec::new(),
        }
    }

    fn service(sources: SourceSet) -> MarketData {
        MarketData::new(&Config::default(), sources, None).expect("Service should build")
    }

    #[test]
    fn test_top_movers_strict_sign_and_limit() {
        let prices = sample_prices();

        let gainers = top_movers(&prices, 10, Direction::Positive);
        let symbols: Vec<_> = gainers.iter().map(|p| p.symbol.as_str()).collect();
        // NABIL and SHIVM tie at 2.0 and keep fetch order
        assert_eq!(symbols, ["HDL", "NABIL", "SHIVM"]);
        assert!(gainers.iter().all(|p| p.percent_change > 0.0));

        let losers = top_movers(&prices, 1, Direction::Negative);
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].symbol, "API");

        assert!(top_movers(&prices, 0, Direction::Positive).is_empty());
    }

    #[test]
    fn test_zero_change_is_neither_gainer_nor_loser() {
        let prices = vec![price("FLAT", 100.0, 0.0, 1)];
        assert!(top_movers(&prices, 5, Direction::Positive).is_empty());
        assert!(top_movers(&prices, 5, Direction::Negative).is_empty());
    }

    #[test]
    fn test_sectors_sorted_without_unknown() {
        assert_eq!(
            sectors_of(&sample_companies()),
            ["Commercial Banks", "Hydro Power", "Manufacturing"]
        );
    }

    #[test]
    fn test_filter_prices_by_symbol_and_sector() {
        let companies = sample_companies();
        let query = PriceQuery {
            sector: Some("hydro power".to_string()),
            sort_by: Some(SortField::Ltp),
            descending: true,
            ..Default::default()
        };
        let rows = filter_prices(sample_prices(), Some(&companies), &query);
        let symbols: Vec<_> = rows.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, ["API", "UPPER"]);

        let query = PriceQuery {
            symbol: Some("ni".to_string()),
            ..Default::default()
        };
        let rows = filter_prices(sample_prices(), None, &query);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "NICA");
    }

    #[test]
    fn test_filter_prices_pagination() {
        let query = PriceQuery {
            sort_by: Some(SortField::Symbol),
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let rows = filter_prices(sample_prices(), None, &query);
        let symbols: Vec<_> = rows.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, ["HDL", "NABIL"]);
    }

    #[test]
    fn test_filter_companies() {
        let rows = filter_companies(sample_companies(), Some("Commercial Banks"), Some("nab"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "NABIL");

        let rows = filter_companies(sample_companies(), None, Some("limited"));
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn test_csv_has_fixed_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prices.csv");

        write_prices_csv(&path, &[price("NABIL", 510.0, 2.0, 2000)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("symbol,ltp,change,percent_change,high,low,open,qty"));
        assert!(lines.next().unwrap().starts_with("NABIL,510"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_csv_header_written_without_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.csv");

        write_prices_csv(&path, &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim_end(), CSV_HEADER.join(","));
    }

    #[tokio::test]
    async fn test_service_rankings_use_cached_prices() {
        let prices = FnSource::new(|_| Ok(sample_prices()));
        let sources = SourceSet {
            prices: vec![prices.clone()],
            ..fake_sources()
        };
        let data = service(sources);

        assert_eq!(data.top_gainers(2).await.len(), 2);
        assert_eq!(data.top_losers(5).await.len(), 2);
        assert_eq!(prices.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_dispatches_by_feed() {
        let data = service(fake_sources());

        assert!(matches!(data.get(&Feed::TodaysPrices, false).await, FeedData::Prices(rows) if rows.len() == 6));
        assert!(matches!(data.get(&Feed::CompanyList, false).await, FeedData::Companies(_)));
        // Failing summary with nothing cached degrades to an empty summary
        assert_eq!(
            data.get(&Feed::MarketSummary, false).await,
            FeedData::Summary(MarketSummary::default())
        );
    }

    #[tokio::test]
    async fn test_company_detail_cached_per_symbol() {
        let detail = FnSource::new(detail_for);
        let sources = SourceSet {
            detail: vec![detail.clone()],
            ..fake_sources()
        };
        let data = service(sources);

        assert_eq!(data.company_detail("nabil", false).await.symbol, "NABIL");
        assert_eq!(data.company_detail("NABIL", false).await.symbol, "NABIL");
        assert_eq!(detail.calls(), 1);

        data.company_detail("NICA", false).await;
        assert_eq!(detail.calls(), 2);
        assert_eq!(data.cached_details().await, 2);
    }

    #[tokio::test]
    async fn test_company_detail_rejects_path_like_symbols() {
        let temp_dir = TempDir::new().unwrap();
        let detail = FnSource::new(detail_for);
        let sources = SourceSet {
            detail: vec![detail.clone()],
            ..fake_sources()
        };
        let data = MarketData::new(&Config::default(), sources, Some(Store::with_dir(temp_dir.path()))).unwrap();

        for symbol in ["../nabil", "NA/BIL", "", "NABIL.json"] {
            assert_eq!(data.company_detail(symbol, false).await, CompanyDetail::default());
        }
        assert_eq!(detail.calls(), 0);
        assert_eq!(data.cached_details().await, 0);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_valid_symbols() {
        assert!(is_valid_symbol("NABIL"));
        assert!(is_valid_symbol("NICA2085"));
        assert!(!is_valid_symbol("NA BIL"));
        assert!(!is_valid_symbol("a/b"));
        assert!(!is_valid_symbol(""));
    }

    #[tokio::test]
    async fn test_detail_capacity_evicts_least_recently_used() {
        let detail = FnSource::new(detail_for);
        let sources = SourceSet {
            detail: vec![detail.clone()],
            ..fake_sources()
        };
        let mut config = Config::default();
        config.detail_cache_capacity = Some(2);
        let data = MarketData::new(&config, sources, None).unwrap();

        data.company_detail("NABIL", false).await;
        data.company_detail("NICA", false).await;
        data.company_detail("NABIL", false).await;
        data.company_detail("HDL", false).await; // evicts NICA
        assert_eq!(data.cached_details().await, 2);
        assert_eq!(detail.calls(), 3);

        data.company_detail("NABIL", false).await;
        assert_eq!(detail.calls(), 3);
        data.company_detail("NICA", false).await;
        assert_eq!(detail.calls(), 4);
    }

    #[tokio::test]
    async fn test_evicted_detail_rehydrates_from_store() {
        let temp_dir = TempDir::new().unwrap();
        let detail = FnSource::new(detail_for);
        let sources = SourceSet {
            detail: vec![detail.clone()],
            ..fake_sources()
        };
        let mut config = Config::default();
        config.detail_cache_capacity = Some(1);
        let data = MarketData::new(&config, sources, Some(Store::with_dir(temp_dir.path()))).unwrap();

        data.company_detail("NABIL", false).await;
        data.company_detail("NICA", false).await;
        data.company_detail("NABIL", false).await;

        assert_eq!(detail.calls(), 2);
    }

    #[tokio::test]
    async fn test_live_status_overrides_calendar() {
        let live = FnSource::new(|_| {
            Ok(MarketStatus {
                is_open: true,
                status_text: "Market Open".to_string(),
                origin: StatusOrigin::Live,
            })
        });
        let sources = SourceSet {
            status: vec![live],
            ..fake_sources()
        };
        let status = service(sources).market_status().await;
        assert!(status.is_open);
        assert_eq!(status.origin, StatusOrigin::Live);
    }

    #[tokio::test]
    async fn test_status_falls_back_to_calendar() {
        let failing = FnSource::new(|_| Err::<MarketStatus, _>(SourceError::RateLimited));
        let sources = SourceSet {
            status: vec![failing.clone()],
            ..fake_sources()
        };
        let data = service(sources);

        let status = data.market_status().await;
        assert_eq!(status.origin, StatusOrigin::Calendar);
        assert_eq!(status, data.calendar_status());
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_reports_freshness() {
        let data = service(fake_sources());

        let report = data.snapshot(&Feed::TodaysPrices, false).await;
        assert!(report.meta.fresh);
        assert!(report.meta.last_updated.is_some());
        assert_eq!(report.meta.feed, "todays_prices");

        let report = data.snapshot(&Feed::MarketSummary, false).await;
        assert!(!report.meta.fresh);
        assert!(report.meta.last_updated.is_none());
    }

    #[tokio::test]
    async fn test_refresh_reports_outcome() {
        let data = service(fake_sources());

        let (records, outcome) = data.refresh(&Feed::TodaysPrices).await;
        assert_eq!(records, 6);
        assert!(outcome.is_refreshed());

        let (_, outcome) = data.refresh(&Feed::MarketSummary).await;
        assert_eq!(outcome, FetchOutcome::Fallback);
    }

    #[tokio::test]
    async fn test_prices_filtered_joins_company_list() {
        let data = service(fake_sources());
        let query = PriceQuery {
            sector: Some("Commercial Banks".to_string()),
            ..Default::default()
        };
        let rows = data.prices_filtered(&query, false).await;
        let symbols: Vec<_> = rows.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, ["NABIL", "NICA"]);
    }

    #[tokio::test]
    async fn test_export_csv_counts_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("today.csv");
        let data = service(fake_sources());

        assert_eq!(data.export_csv(&path, false).await.unwrap(), 6);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 7);
    }

    #[test]
    fn test_missing_detail_sources_rejected() {
        let sources = SourceSet {
            detail: Vec::new(),
            ..fake_sources()
        };
        let result = MarketData::new(&Config::default(), sources, None);
        assert!(matches!(result, Err(ServiceError::Config(ConfigError::NoSources(_)))));
    }

    #[test]
    fn test_sources_from_default_config() {
        let sources = SourceSet::from_config(&Config::default()).unwrap();
        assert_eq!(sources.prices.len(), 2);
        assert_eq!(sources.prices[1].name(), "sharesansar");
        assert_eq!(sources.status.len(), 1);
    }
}
