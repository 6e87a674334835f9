//! nepse-feed - cached NEPSE market data from the command line
//!
//! Every data command answers from the persisted cache when it is fresh and
//! scrapes the exchange pages otherwise. `run` keeps the cache warm with the
//! background refresher until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nepse_feed::cli::{self, Cli, Command, ConfigAction, StartupConfig};
use nepse_feed::config::Config;
use nepse_feed::data::{Direction, Feed};
use nepse_feed::market::MarketCalendar;
use nepse_feed::refresh::{RefreshConfig, RefreshHandle, RefreshMessage};
use nepse_feed::service::{is_valid_symbol, sectors_of, top_movers, MarketData, ServiceError};

fn init_logging(startup: &StartupConfig) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| startup.log_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs the refresher and logs its events until Ctrl-C
async fn run(data: Arc<MarketData>, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let refresh_config = RefreshConfig::from_config(config)?;
    if !refresh_config.enabled {
        tracing::warn!("Background refresh is disabled in configuration");
    }
    let mut handle = RefreshHandle::spawn(data, refresh_config);

    loop {
        tokio::select! {
            message = handle.receiver.recv() => match message {
                Some(RefreshMessage::CycleCompleted { next_in }) => {
                    tracing::info!(next_in_secs = next_in.as_secs(), "Refresh cycle completed");
                }
                Some(message) => tracing::debug!(?message, "Refresh event"),
                None => {
                    // Refresher disabled or stopped; keep serving until interrupted
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let startup = StartupConfig::from_cli(&cli)?;
    init_logging(&startup);

    let mut config = Config::load(startup.config_path.as_deref())?;
    startup.apply(&mut config);
    config.validate()?;

    match &cli.command {
        Command::Config { action } => {
            match action {
                ConfigAction::Check => print_json(&json!({ "valid": true }))?,
                ConfigAction::Show => print_json(&config)?,
            }
            return Ok(());
        }
        Command::MarketOpen { at } => {
            let calendar = MarketCalendar::from_config(&config)?;
            let at = match at {
                Some(s) => cli::parse_at_arg(s, calendar.timezone())?,
                None => Utc::now(),
            };
            print_json(&json!({
                "at": calendar.local(&at).to_rfc3339(),
                "is_open": calendar.is_open(&at),
            }))?;
            return Ok(());
        }
        _ => {}
    }

    let query = cli::price_query(&cli.command)?;
    let data = Arc::new(MarketData::from_config(&config)?);

    match cli.command {
        Command::Run => run(data, &config).await?,
        Command::Prices { refresh, .. } => {
            let query = query.unwrap_or_default();
            print_json(&data.prices_filtered(&query, refresh).await)?;
        }
        Command::Gainers { limit, refresh } => {
            let prices = data.prices(refresh).await;
            print_json(&top_movers(&prices, limit, Direction::Positive))?;
        }
        Command::Losers { limit, refresh } => {
            let prices = data.prices(refresh).await;
            print_json(&top_movers(&prices, limit, Direction::Negative))?;
        }
        Command::Sectors { refresh } => {
            print_json(&sectors_of(&data.companies(refresh).await))?;
        }
        Command::Companies { sector, search, refresh } => {
            let companies = data
                .companies_filtered(sector.as_deref(), search.as_deref(), refresh)
                .await;
            print_json(&companies)?;
        }
        Command::Summary { refresh } => {
            print_json(&data.snapshot(&Feed::MarketSummary, refresh).await)?;
        }
        Command::Company { symbol, refresh } => {
            let symbol = symbol.trim().to_uppercase();
            if !is_valid_symbol(&symbol) {
                return Err(ServiceError::InvalidSymbol(symbol).into());
            }
            let feed = Feed::CompanyDetail(symbol);
            print_json(&data.snapshot(&feed, refresh).await)?;
        }
        Command::Status => print_json(&data.market_status().await)?,
        Command::ExportCsv { path, refresh } => {
            let rows = data.export_csv(&path, refresh).await?;
            print_json(&json!({ "path": path, "rows": rows }))?;
        }
        Command::MarketOpen { .. } | Command::Config { .. } => {}
    }

    Ok(())
}
