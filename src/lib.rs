//! NEPSE Feed Library
//!
//! Cached market data for the Nepal Stock Exchange: per-feed caches with
//! persisted snapshots and stale fallback, HTML scraping sources, the trading
//! calendar and the background refresher. The binary in `main.rs` is a thin
//! command-line front end over [`service::MarketData`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod market;
pub mod refresh;
pub mod service;
pub mod source;
