//! HTML scraping source
//!
//! [`HtmlSource`] downloads public exchange pages and extracts records with
//! CSS selectors. Which pages and selectors are used is decided by the site
//! [`Layout`]; the same layout can be pointed at a mirror through `base_url`.
//!
//! ## Pages (nepalstock layout)
//! - `/todays_price`: price table
//! - `/company`: listed companies and sectors
//! - `/`: index, market statistics and the open/closed banner
//! - `/company/{symbol}`: company information table

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::config::FeedKind;
use crate::data::format::{parse_number, parse_quantity, percent_change};
use crate::data::{
    Company, CompanyDetail, Direction, Feed, MarketStatus, MarketSummary, StatusOrigin, StockPrice,
    UNKNOWN_SECTOR,
};

use super::{Source, SourceError};

/// Browser user agents, rotated per request
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// Built-in extraction rule sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// The exchange's own site
    NepalStock,
    /// ShareSansar's today's share price page
    ShareSansar,
}

/// Column positions in a price table row
#[derive(Debug, Clone, Copy)]
pub struct PriceRules {
    pub path: &'static str,
    pub rows: &'static str,
    /// Rows with fewer cells are skipped
    pub min_cells: usize,
    pub symbol: usize,
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub ltp: usize,
    pub change: usize,
    /// Percent column, computed from `ltp` and `change` when absent
    pub percent: Option<usize>,
    pub qty: usize,
}

/// Column positions in a company listing row
#[derive(Debug, Clone, Copy)]
pub struct CompanyRules {
    pub path: &'static str,
    pub rows: &'static str,
    pub min_cells: usize,
    pub symbol: usize,
    pub name: usize,
    pub sector: usize,
}

/// Selectors for the front-page summary
#[derive(Debug, Clone, Copy)]
pub struct SummaryRules {
    pub path: &'static str,
    pub index_value: &'static str,
    pub index_change: &'static str,
    pub stat_items: &'static str,
    pub stat_label: &'static str,
    pub stat_value: &'static str,
}

/// Selectors for a company detail page; `{symbol}` is substituted in `path`
#[derive(Debug, Clone, Copy)]
pub struct DetailRules {
    pub path: &'static str,
    pub name: &'static str,
    pub rows: &'static str,
}

/// Selector for the open/closed banner
#[derive(Debug, Clone, Copy)]
pub struct StatusRules {
    pub path: &'static str,
    pub block: &'static str,
}

/// Everything a layout knows how to extract
#[derive(Debug, Clone, Copy)]
pub struct LayoutRules {
    pub prices: Option<PriceRules>,
    pub companies: Option<CompanyRules>,
    pub summary: Option<SummaryRules>,
    pub detail: Option<DetailRules>,
    pub status: Option<StatusRules>,
}

const NEPALSTOCK: LayoutRules = LayoutRules {
    prices: Some(PriceRules {
        path: "/todays_price",
        rows: "table.table.table-bordered.table-striped.table-hover tr",
        min_cells: 11,
        symbol: 1,
        open: 3,
        high: 4,
        low: 5,
        ltp: 6,
        change: 7,
        percent: None,
        qty: 10,
    }),
    companies: Some(CompanyRules {
        path: "/company",
        rows: "table.table.table-bordered.table-striped.table-hover tr",
        min_cells: 3,
        symbol: 1,
        name: 2,
        sector: 3,
    }),
    summary: Some(SummaryRules {
        path: "/",
        index_value: "div.current-index span.current-price",
        index_change: "div.current-index span.point-change",
        stat_items: "div.market-status div.d-flex",
        stat_label: "div.text",
        stat_value: "div.count",
    }),
    detail: Some(DetailRules {
        path: "/company/{symbol}",
        name: ".company-info h2",
        rows: ".company-info table tr",
    }),
    status: Some(StatusRules {
        path: "/",
        block: "div.market-status",
    }),
};

const SHARESANSAR: LayoutRules = LayoutRules {
    prices: Some(PriceRules {
        path: "/today-share-price",
        rows: "table#headFixed tr",
        min_cells: 15,
        symbol: 1,
        open: 3,
        high: 4,
        low: 5,
        ltp: 6,
        change: 12,
        percent: Some(14),
        qty: 8,
    }),
    companies: None,
    summary: None,
    detail: None,
    status: None,
};

impl Layout {
    /// Extraction rules for this layout
    pub fn rules(&self) -> &'static LayoutRules {
        match self {
            Layout::NepalStock => &NEPALSTOCK,
            Layout::ShareSansar => &SHARESANSAR,
        }
    }

    /// Whether this layout can produce the given feed
    pub fn supports(&self, kind: FeedKind) -> bool {
        let rules = self.rules();
        match kind {
            FeedKind::TodaysPrices => rules.prices.is_some(),
            FeedKind::CompanyList => rules.companies.is_some(),
            FeedKind::MarketSummary => rules.summary.is_some(),
            FeedKind::CompanyDetail => rules.detail.is_some(),
            FeedKind::MarketStatus => rules.status.is_some(),
        }
    }
}

/// Scrapes one site according to its layout
pub struct HtmlSource {
    name: String,
    base_url: String,
    layout: Layout,
    client: Client,
    next_agent: AtomicUsize,
}

impl HtmlSource {
    /// Creates a source for `base_url` using `layout`'s extraction rules
    ///
    /// `timeout` bounds each HTTP request.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        layout: Layout,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            layout,
            client,
            next_agent: AtomicUsize::new(0),
        })
    }

    fn unsupported(&self, feed: &Feed) -> SourceError {
        SourceError::Unsupported {
            source_name: self.name.clone(),
            feed: feed.key(),
        }
    }

    /// Downloads a page relative to the base URL
    async fn get_page(&self, path: &str) -> Result<String, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let agent = USER_AGENTS[self.next_agent.fetch_add(1, Ordering::Relaxed) % USER_AGENTS.len()];

        tracing::debug!(source = %self.name, %url, "Fetching page");
        let response = self.client.get(&url).header(USER_AGENT, agent).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl Source<Vec<StockPrice>> for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, feed: &Feed) -> Result<Vec<StockPrice>, SourceError> {
        let rules = self.layout.rules().prices.ok_or_else(|| self.unsupported(feed))?;
        let html = self.get_page(rules.path).await?;
        parse_prices(&html, &rules)
    }
}

#[async_trait]
impl Source<Vec<Company>> for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, feed: &Feed) -> Result<Vec<Company>, SourceError> {
        let rules = self.layout.rules().companies.ok_or_else(|| self.unsupported(feed))?;
        let html = self.get_page(rules.path).await?;
        parse_companies(&html, &rules)
    }
}

#[async_trait]
impl Source<MarketSummary> for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, feed: &Feed) -> Result<MarketSummary, SourceError> {
        let rules = self.layout.rules().summary.ok_or_else(|| self.unsupported(feed))?;
        let html = self.get_page(rules.path).await?;
        parse_summary(&html, &rules)
    }
}

#[async_trait]
impl Source<CompanyDetail> for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, feed: &Feed) -> Result<CompanyDetail, SourceError> {
        let Feed::CompanyDetail(symbol) = feed else {
            return Err(self.unsupported(feed));
        };
        let rules = self.layout.rules().detail.ok_or_else(|| self.unsupported(feed))?;
        let html = self.get_page(&rules.path.replace("{symbol}", symbol)).await?;
        parse_detail(&html, symbol, &rules)
    }
}

#[async_trait]
impl Source<MarketStatus> for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, feed: &Feed) -> Result<MarketStatus, SourceError> {
        let rules = self.layout.rules().status.ok_or_else(|| self.unsupported(feed))?;
        let html = self.get_page(rules.path).await?;
        parse_status(&html, &rules)
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("invalid selector '{}': {}", css, e)))
}

/// Collapsed, trimmed text content of an element
fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cell texts of every table row after the header row
fn table_rows(document: &Html, rows: &str) -> Result<Vec<Vec<String>>, SourceError> {
    let row_selector = selector(rows)?;
    let cell_selector = selector("td")?;

    Ok(document
        .select(&row_selector)
        .skip(1)
        .map(|row| row.select(&cell_selector).map(text_of).collect())
        .collect())
}

/// Extracts today's prices
///
/// A missing table yields an empty list. Rows that are too short or have no
/// parsable last traded price are skipped individually.
pub fn parse_prices(html: &str, rules: &PriceRules) -> Result<Vec<StockPrice>, SourceError> {
    let document = Html::parse_document(html);
    let mut prices = Vec::new();

    for cells in table_rows(&document, rules.rows)? {
        if cells.len() < rules.min_cells {
            continue;
        }
        let symbol = cells[rules.symbol].trim().to_string();
        let Some(ltp) = parse_number(&cells[rules.ltp]) else {
            tracing::debug!(%symbol, "Skipping price row without LTP");
            continue;
        };
        if symbol.is_empty() {
            continue;
        }

        let change = parse_number(&cells[rules.change]).unwrap_or(0.0);
        let percent = rules
            .percent
            .and_then(|col| parse_number(&cells[col]))
            .unwrap_or_else(|| percent_change(ltp, change));

        prices.push(StockPrice {
            symbol,
            ltp,
            change,
            percent_change: percent,
            high: parse_number(&cells[rules.high]).unwrap_or(0.0),
            low: parse_number(&cells[rules.low]).unwrap_or(0.0),
            open: parse_number(&cells[rules.open]).unwrap_or(0.0),
            qty: parse_quantity(&cells[rules.qty]).unwrap_or(0),
        });
    }

    Ok(prices)
}

/// Extracts the listed companies
pub fn parse_companies(html: &str, rules: &CompanyRules) -> Result<Vec<Company>, SourceError> {
    let document = Html::parse_document(html);

    Ok(table_rows(&document, rules.rows)?
        .into_iter()
        .filter(|cells| cells.len() >= rules.min_cells)
        .filter(|cells| !cells[rules.symbol].is_empty())
        .map(|cells| Company {
            symbol: cells[rules.symbol].clone(),
            company_name: cells[rules.name].clone(),
            sector: cells
                .get(rules.sector)
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| UNKNOWN_SECTOR.to_string()),
        })
        .collect())
}

/// Extracts the index and market statistics
pub fn parse_summary(html: &str, rules: &SummaryRules) -> Result<MarketSummary, SourceError> {
    let document = Html::parse_document(html);
    let mut summary = MarketSummary::default();

    let value = document.select(&selector(rules.index_value)?).next().map(text_of);
    let change = document.select(&selector(rules.index_change)?).next().map(text_of);
    if let (Some(value), Some(change)) = (value, change) {
        summary.index = parse_number(&value);
        summary.index_change = parse_number(&change);
        summary.direction = Some(if change.contains('+') {
            Direction::Positive
        } else {
            Direction::Negative
        });
    }

    let label_selector = selector(rules.stat_label)?;
    let value_selector = selector(rules.stat_value)?;
    for item in document.select(&selector(rules.stat_items)?) {
        let label = item.select(&label_selector).next().map(text_of);
        let value = item.select(&value_selector).next().map(text_of);
        let (Some(label), Some(value)) = (label, value) else {
            continue;
        };

        let label = label.to_lowercase();
        let amount = parse_number(&value);
        if label.contains("turnover") {
            summary.turnover = amount;
        } else if label.contains("traded shares") {
            summary.traded_shares = amount;
        } else if label.contains("transactions") {
            summary.transactions = amount;
        } else if label.contains("market cap") {
            summary.market_cap = amount;
        }
    }

    Ok(summary)
}

/// Extracts a company detail page
pub fn parse_detail(html: &str, symbol: &str, rules: &DetailRules) -> Result<CompanyDetail, SourceError> {
    let document = Html::parse_document(html);
    let cell_selector = selector("td")?;

    let company_name = document
        .select(&selector(rules.name)?)
        .next()
        .map(text_of)
        .filter(|name| !name.is_empty());

    let mut detail = CompanyDetail {
        symbol: symbol.to_uppercase(),
        company_name,
        ..Default::default()
    };

    for row in document.select(&selector(rules.rows)?) {
        let cells: Vec<String> = row.select(&cell_selector).map(text_of).collect();
        if cells.len() < 2 || cells[0].is_empty() {
            continue;
        }
        let key = cells[0].to_lowercase().replace(' ', "_");
        detail.attributes.insert(key, cells[1].clone());
    }

    Ok(detail)
}

/// Reads the open/closed banner
///
/// Fails when the banner is missing so the caller can fall back to the calendar.
pub fn parse_status(html: &str, rules: &StatusRules) -> Result<MarketStatus, SourceError> {
    let document = Html::parse_document(html);
    let block = document
        .select(&selector(rules.block)?)
        .next()
        .ok_or_else(|| SourceError::Parse("market status block not found".to_string()))?;

    let status_text = text_of(block);
    Ok(MarketStatus {
        is_open: status_text.contains("Open"),
        status_text,
        origin: StatusOrigin::Live,
    })
}
