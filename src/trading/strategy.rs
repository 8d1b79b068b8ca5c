//! Strategy contract and the signals it produces.
//!
//! Every strategy variant implements [`Strategy`]; the orchestrator only ever
//! talks to `dyn Strategy`, so new variants plug in without touching the
//! trading loop.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Order, Position, PositionMetrics, PriceBar};
use crate::risk::StopLossConfig;

use super::config::{StrategyConfig, StrategyKind};
use super::moving_average::MovingAverageStrategy;

/// Trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Buy => "buy",
            SignalType::Sell => "sell",
            SignalType::Hold => "hold",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    BullishCrossover,
    BearishCrossover,
    Uptrend,
    Downtrend,
    StopLoss,
    NoSignal,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::BullishCrossover => "Bullish Crossover",
            SignalReason::BearishCrossover => "Bearish Crossover",
            SignalReason::Uptrend => "Uptrend",
            SignalReason::Downtrend => "Downtrend",
            SignalReason::StopLoss => "Stop Loss",
            SignalReason::NoSignal => "No Signal",
        }
    }
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluation of the strategy on the latest bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub reason: SignalReason,
    pub price: f64,
    pub short_ma: Option<f64>,
    pub long_ma: Option<f64>,
    pub trend: Option<f64>,
    pub ma_diff: Option<f64>,
    pub crossover: i8,

    // Stop state, present only while a position is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_price: Option<f64>,
}

impl Signal {
    pub fn is_buy(&self) -> bool {
        self.signal_type == SignalType::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.signal_type == SignalType::Sell
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_default()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{:.4}", x));

        writeln!(f, "\n{:=^50}", " SIGNAL ")?;
        writeln!(f, "Time:        {}", self.datetime().format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Decision:    {} ({})", self.signal_type.as_str().to_uppercase(), self.reason)?;
        writeln!(f, "Price:       {:.4}", self.price)?;
        writeln!(f, "Short MA:    {}", opt(self.short_ma))?;
        writeln!(f, "Long MA:     {}", opt(self.long_ma))?;
        writeln!(f, "MA Diff:     {}", opt(self.ma_diff))?;
        writeln!(
            f,
            "Trend:       {}",
            self.trend.map_or_else(|| "-".to_string(), |t| format!("{:.2}%", t * 100.0))
        )?;
        writeln!(f, "Crossover:   {}", self.crossover)?;
        if let Some(stop) = self.stop_loss_price {
            writeln!(f, "Stop Price:  {:.4}", stop)?;
            writeln!(f, "Trailing:    {}", self.trailing_active.unwrap_or(false))?;
            writeln!(f, "Peak Price:  {}", opt(self.highest_price))?;
        }
        write!(f, "{:=^50}", "")
    }
}

/// Contract every strategy variant satisfies.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Evaluate the latest bar of `bars`.
    ///
    /// Fails with `InsufficientData` when the series is shorter than the
    /// strategy's warm-up.
    fn generate_signal(&mut self, bars: &[PriceBar]) -> Result<Signal>;

    /// Base-currency size to buy for `signal`; zero for anything but a buy.
    fn calculate_position_size(&self, signal: &Signal, balance: f64) -> f64;

    /// Whether the open position should be closed. Never fails on short
    /// history; it reports `false` instead.
    fn should_exit(&mut self, bars: &[PriceBar]) -> Result<bool>;

    /// Record an executed order: a buy opens the position, a sell clears it.
    fn update_position(&mut self, order: &Order) -> Result<()>;

    fn position(&self) -> Option<&Position>;

    /// Mark-to-market view of the open position at the latest close.
    fn risk_metrics(&self, bars: &[PriceBar]) -> Option<PositionMetrics> {
        let position = self.position()?;
        let last = bars.last()?;
        Some(position.metrics_at(last.close))
    }
}

/// Build the configured strategy variant.
pub fn build_strategy(
    config: &StrategyConfig,
    stop_loss: &StopLossConfig,
) -> Result<Box<dyn Strategy>> {
    match config.kind {
        StrategyKind::MovingAverage => Ok(Box::new(MovingAverageStrategy::new(
            config.clone(),
            stop_loss.clone(),
        )?)),
    }
}
