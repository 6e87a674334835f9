//! Background data refresh system
//!
//! A single loop force-refreshes today's prices and the market summary every
//! cycle, plus the company list once per day. The cycle length depends on
//! whether the market is open. Progress is reported as [`RefreshMessage`]s on
//! a channel; fetch failures are logged and never stop the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::mpsc;

use crate::cache::FetchOutcome;
use crate::config::{Config, ConfigError};
use crate::data::Feed;
use crate::market::{DailySchedule, MarketCalendar};
use crate::service::MarketData;

/// Messages sent from the background refresher
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshMessage {
    /// A cycle began
    CycleStarted { market_open: bool },
    /// A feed was refreshed with new data
    FeedRefreshed { feed: String, records: usize },
    /// Every source failed; the feed keeps its previous data
    FeedStale { feed: String },
    /// The daily company list refresh succeeded
    CompanyListRefreshed { records: usize },
    /// A cycle ended; the next one starts after `next_in`
    CycleCompleted { next_in: Duration },
}

/// Configuration for refresh intervals
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Cycle length while the market is open
    pub market_open_interval: Duration,
    /// Cycle length outside trading hours
    pub market_closed_interval: Duration,
    /// Local time after which the company list is refreshed, once per day
    pub company_list_at: NaiveTime,
    /// Whether the refresher runs at all
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            market_open_interval: Duration::from_secs(300),    // 5 minutes
            market_closed_interval: Duration::from_secs(1800), // 30 minutes
            company_list_at: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            enabled: true,
        }
    }
}

impl RefreshConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            market_open_interval: Duration::from_secs(config.refresh.market_open_interval_secs),
            market_closed_interval: Duration::from_secs(config.refresh.market_closed_interval_secs),
            company_list_at: config.company_list_at()?,
            enabled: config.refresh.enabled,
        })
    }

    /// Cycle length for the given market state
    pub fn interval_for(&self, market_open: bool) -> Duration {
        if market_open {
            self.market_open_interval
        } else {
            self.market_closed_interval
        }
    }
}

/// State carried between cycles
struct Refresher {
    data: Arc<MarketData>,
    calendar: MarketCalendar,
    config: RefreshConfig,
    company_list: DailySchedule,
    tx: mpsc::Sender<RefreshMessage>,
}

impl Refresher {
    fn new(data: Arc<MarketData>, config: RefreshConfig, tx: mpsc::Sender<RefreshMessage>) -> Self {
        Self {
            calendar: data.calendar().clone(),
            company_list: DailySchedule::new(config.company_list_at),
            data,
            config,
            tx,
        }
    }

    /// Runs one cycle at `now` and returns how long to sleep before the next
    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Duration {
        let market_open = self.calendar.is_open(&now);
        let next_in = self.config.interval_for(market_open);
        tracing::debug!(market_open, "Refresh cycle started");
        self.notify(RefreshMessage::CycleStarted { market_open });

        let (prices, summary) = futures::future::join(
            self.data.refresh(&Feed::TodaysPrices),
            self.data.refresh(&Feed::MarketSummary),
        )
        .await;
        self.report(Feed::TodaysPrices, prices);
        self.report(Feed::MarketSummary, summary);

        let local = self.calendar.local(&now);
        if self.company_list.is_due(&local) {
            let (records, outcome) = self.data.refresh(&Feed::CompanyList).await;
            if outcome.is_refreshed() {
                self.company_list.mark_ran(&local);
                tracing::info!(records, "Daily company list refresh done");
                self.notify(RefreshMessage::CompanyListRefreshed { records });
            } else {
                // Not marked as run, so the next cycle retries
                self.report(Feed::CompanyList, (records, outcome));
            }
        }

        self.notify(RefreshMessage::CycleCompleted { next_in });
        next_in
    }

    fn report(&self, feed: Feed, (records, outcome): (usize, FetchOutcome)) {
        let feed = feed.key();
        if outcome.is_refreshed() {
            self.notify(RefreshMessage::FeedRefreshed { feed, records });
        } else {
            tracing::warn!(%feed, "Refresh failed, keeping previous data");
            self.notify(RefreshMessage::FeedStale { feed });
        }
    }

    /// Never blocks the loop; messages are dropped when nobody is reading
    fn notify(&self, message: RefreshMessage) {
        if self.tx.try_send(message).is_err() {
            tracing::trace!("Refresh message dropped");
        }
    }
}

/// Handle for controlling the background refresh system
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    /// Signals the loop to stop
    shutdown_tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Spawns the refresh loop over `data`
    ///
    /// The first cycle runs immediately. With `config.enabled` false no task
    /// is spawned and the receiver stays empty.
    pub fn spawn(data: Arc<MarketData>, config: RefreshConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        if config.enabled {
            let mut refresher = Refresher::new(data, config, msg_tx);

            tokio::spawn(async move {
                tracing::info!("Background refresher started");
                loop {
                    let next_in = refresher.run_cycle(Utc::now()).await;

                    tokio::select! {
                        _ = tokio::time::sleep(next_in) => {}
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                    }
                }
                tracing::info!("Background refresher stopped");
            });
        }

        Self {
            receiver: msg_rx,
            shutdown_tx,
        }
    }

    /// Shuts down the background refresh task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Checks for pending refresh messages without blocking
pub fn try_recv(handle: &mut RefreshHandle) -> Option<RefreshMessage> {
    handle.receiver.try_recv().ok()
}
