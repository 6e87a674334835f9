//! Restart behaviour through the public library API
//!
//! A second `MarketData` over the same cache directory must serve exactly what
//! the first one cached, without touching its sources while the data is fresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use nepse_feed::cache::Store;
use nepse_feed::config::Config;
use nepse_feed::data::{Company, CompanyDetail, Feed, MarketSummary, StockPrice};
use nepse_feed::service::{MarketData, SourceSet};
use nepse_feed::source::{Source, SourceError};

/// Serves a fixed payload, or fails when built with `None`
struct Scripted<T> {
    value: Option<T>,
    calls: AtomicUsize,
}

impl<T> Scripted<T> {
    fn new(value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            value,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Source<T> for Scripted<T> {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, _feed: &Feed) -> Result<T, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.value.clone().ok_or(SourceError::Status(502))
    }
}

fn prices() -> Vec<StockPrice> {
    ["NABIL", "NICA", "UPPER"]
        .iter()
        .enumerate()
        .map(|(i, symbol)| StockPrice {
            symbol: symbol.to_string(),
            ltp: 100.0 + i as f64,
            change: 1.5 - i as f64,
            percent_change: 1.5 - i as f64,
            high: 110.0,
            low: 90.0,
            open: 100.0,
            qty: 1000 * (i as u64 + 1),
        })
        .collect()
}

fn summary() -> MarketSummary {
    MarketSummary {
        index: Some(2650.32),
        index_change: Some(12.5),
        turnover: Some(4_512_000_000.0),
        ..Default::default()
    }
}

fn sources(prices: Arc<Scripted<Vec<StockPrice>>>, summary: Arc<Scripted<MarketSummary>>) -> SourceSet {
    SourceSet {
        prices: vec![prices],
        companies: vec![Scripted::new(None::<Vec<Company>>)],
        summary: vec![summary],
        detail: vec![Scripted::new(None::<CompanyDetail>)],
        status: Vec::new(),
    }
}

#[tokio::test]
async fn test_restart_serves_persisted_data_without_fetching() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::default();

    let first_prices = Scripted::new(Some(prices()));
    let first_summary = Scripted::new(Some(summary()));
    let before = {
        let data = MarketData::new(
            &config,
            sources(first_prices.clone(), first_summary.clone()),
            Some(Store::with_dir(temp_dir.path())),
        )
        .unwrap();
        let prices = data.snapshot(&Feed::TodaysPrices, false).await;
        let summary = data.snapshot(&Feed::MarketSummary, false).await;
        (prices, summary)
    };
    assert_eq!(first_prices.calls(), 1);
    assert_eq!(first_summary.calls(), 1);

    let second_prices = Scripted::new(Some(Vec::new()));
    let second_summary = Scripted::new(None);
    let data = MarketData::new(
        &config,
        sources(second_prices.clone(), second_summary.clone()),
        Some(Store::with_dir(temp_dir.path())),
    )
    .unwrap();

    let prices_after = data.snapshot(&Feed::TodaysPrices, false).await;
    let summary_after = data.snapshot(&Feed::MarketSummary, false).await;

    assert_eq!(prices_after.data, before.0.data);
    assert_eq!(prices_after.meta.last_updated, before.0.meta.last_updated);
    assert_eq!(summary_after.data, before.1.data);
    assert_eq!(second_prices.calls(), 0);
    assert_eq!(second_summary.calls(), 0);

    assert_eq!(data.top_gainers(10).await.len(), 2);
    assert_eq!(data.top_losers(10).await.len(), 1);
}

#[tokio::test]
async fn test_stale_snapshot_survives_failed_refresh_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::with_dir(temp_dir.path());
    let an_hour_ago = Utc::now().timestamp() - 3600;
    store.save("todays_prices", &prices(), an_hour_ago).unwrap();

    let failing = Scripted::new(None);
    let data = MarketData::new(
        &Config::default(),
        sources(failing.clone(), Scripted::new(None)),
        Some(store.clone()),
    )
    .unwrap();

    let report = data.snapshot(&Feed::TodaysPrices, false).await;

    assert_eq!(failing.calls(), 1);
    assert!(!report.meta.fresh);
    assert_eq!(report.meta.last_updated.map(|t| t.timestamp()), Some(an_hour_ago));
    assert_eq!(data.prices(false).await, prices());

    let on_disk = store.load::<Vec<StockPrice>>("todays_prices").unwrap();
    assert_eq!(on_disk.last_updated, an_hour_ago);
}

#[tokio::test]
async fn test_fractional_timestamps_are_accepted() {
    let temp_dir = TempDir::new().unwrap();
    let now = Utc::now().timestamp();
    let json = serde_json::json!({ "data": summary(), "last_updated": now as f64 + 0.75 });
    std::fs::write(
        temp_dir.path().join("market_summary.json"),
        serde_json::to_string(&json).unwrap(),
    )
    .unwrap();

    let summary_source = Scripted::new(None);
    let data = MarketData::new(
        &Config::default(),
        sources(Scripted::new(None), summary_source.clone()),
        Some(Store::with_dir(temp_dir.path())),
    )
    .unwrap();

    assert_eq!(data.market_summary(false).await, summary());
    assert_eq!(summary_source.calls(), 0);
}
