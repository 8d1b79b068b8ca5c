//! Application configuration.
//!
//! Loaded from a TOML file; every section and field falls back to its
//! default, so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::risk::StopLossConfig;
use crate::trading::StrategyConfig;

/// Market and paper-account settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Trading pair, `BASE/QUOTE`
    pub symbol: String,
    pub timeframe: String,
    /// Bars requested per cycle
    pub history_limit: usize,
    /// Starting quote-currency balance of a fresh paper account
    pub paper_balance: f64,
    /// Recorded bar feed for paper trading and backtests
    pub feed_path: Option<PathBuf>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC/USD".to_string(),
            timeframe: "1h".to_string(),
            history_limit: 100,
            paper_balance: 10_000.0,
            feed_path: None,
        }
    }
}

/// Trading loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub poll_interval_secs: u64,
    /// Give up retrying a failed market-data fetch after this long
    pub retry_max_elapsed_secs: u64,
    /// Orders below this base amount are not placed
    pub min_order_size: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            retry_max_elapsed_secs: 30,
            min_order_size: 0.0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub risk: StopLossConfig,
    pub bot: BotConfig,
}

impl AppConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;

        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when the file does not exist.
    ///
    /// A file that exists but fails to parse or validate is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        self.risk.validate()?;

        if self.exchange.history_limit < self.strategy.min_bars() {
            bail!(
                "history_limit {} is below the {} bars the strategy needs",
                self.exchange.history_limit,
                self.strategy.min_bars()
            );
        }
        if !(self.exchange.paper_balance.is_finite() && self.exchange.paper_balance >= 0.0) {
            bail!("paper_balance must be non-negative, got {}", self.exchange.paper_balance);
        }
        if crate::models::split_symbol(&self.exchange.symbol).is_none() {
            bail!("symbol must look like BASE/QUOTE, got {}", self.exchange.symbol);
        }
        if self.bot.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        if !(self.bot.min_order_size >= 0.0) {
            bail!("min_order_size must be non-negative");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
