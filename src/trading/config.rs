//! Strategy configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

/// Which strategy variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MovingAverage,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MovingAverage => "moving_average",
        }
    }
}

/// Configuration for signal generation and strategy-side sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Strategy variant
    pub kind: StrategyKind,

    /// Bars in the fast moving average; also the lag of the trend measure
    pub short_window: usize,

    /// Bars in the slow moving average
    pub long_window: usize,

    /// Fraction of balance to allocate per entry (0.0 to 1.0)
    pub position_size_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::MovingAverage,
            short_window: 5,
            long_window: 10,
            position_size_pct: 0.1, // 10% of balance
        }
    }
}

impl StrategyConfig {
    /// Bars needed before a full signal can be generated.
    pub fn min_bars(&self) -> usize {
        self.long_window + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.short_window == 0 {
            return Err(TradingError::config("short_window must be at least 1"));
        }
        if self.short_window >= self.long_window {
            return Err(TradingError::config(format!(
                "short_window ({}) must be less than long_window ({})",
                self.short_window, self.long_window
            )));
        }
        if !(self.position_size_pct.is_finite()
            && self.position_size_pct > 0.0
            && self.position_size_pct <= 1.0)
        {
            return Err(TradingError::config(format!(
                "position_size_pct must be in (0, 1], got {}",
                self.position_size_pct
            )));
        }
        Ok(())
    }
}
