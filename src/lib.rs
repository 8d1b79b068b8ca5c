//! Kraken auto-trader core.
//!
//! Moving-average crossover signals with fixed and trailing stop-loss risk
//! management, driven against a paper exchange that replays recorded bars.

pub mod backtest;
pub mod bot;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod models;
pub mod risk;
pub mod trading;

pub use error::{ExchangeError, Result, TradingError};
