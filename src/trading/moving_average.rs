//! Moving-average crossover strategy with stop-loss override.

use tracing::{debug, info, warn};

use crate::error::{Result, TradingError};
use crate::models::{Order, OrderSide, Position, PriceBar};
use crate::risk::{RiskManager, StopLossConfig, StopStatus};

use super::config::StrategyConfig;
use super::indicators::{self, IndicatorRow, TREND_THRESHOLD};
use super::strategy::{Signal, SignalReason, SignalType, Strategy};

/// Price tick identity: bar timestamp plus the close's bit pattern, so a
/// still-forming candle with a new close counts as a new tick.
type TickKey = (i64, u64);

fn tick_key(bar: &PriceBar) -> TickKey {
    (bar.timestamp, bar.close.to_bits())
}

/// Short/long SMA crossover with a trend filter.
pub struct MovingAverageStrategy {
    config: StrategyConfig,
    risk: RiskManager,
    position: Option<Position>,
    /// Stop status already folded in for the latest tick
    last_tick: Option<(TickKey, StopStatus)>,
}

impl MovingAverageStrategy {
    pub fn new(config: StrategyConfig, stop_loss: StopLossConfig) -> Result<Self> {
        config.validate()?;
        stop_loss.validate()?;

        Ok(Self {
            config,
            risk: RiskManager::new(stop_loss),
            position: None,
            last_tick: None,
        })
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn risk_manager(&self) -> &RiskManager {
        &self.risk
    }

    fn indicators(&self, bars: &[PriceBar]) -> Vec<IndicatorRow> {
        indicators::calculate(bars, self.config.short_window, self.config.long_window)
    }

    /// Decision from indicators alone. Short history degrades to hold.
    fn detect_signal(&self, rows: &[IndicatorRow]) -> (SignalType, SignalReason) {
        if rows.len() < self.config.min_bars() {
            return (SignalType::Hold, SignalReason::NoSignal);
        }

        let Some(row) = rows.iter().rev().find(|r| r.is_complete()) else {
            return (SignalType::Hold, SignalReason::NoSignal);
        };

        if row.crossover > 0 {
            return (SignalType::Buy, SignalReason::BullishCrossover);
        }
        if row.crossover < 0 {
            return (SignalType::Sell, SignalReason::BearishCrossover);
        }

        if let (Some(trend), Some(diff)) = (row.trend, row.ma_diff) {
            if trend.abs() > TREND_THRESHOLD {
                if trend > 0.0 && diff > 0.0 {
                    return (SignalType::Buy, SignalReason::Uptrend);
                }
                if trend < 0.0 && diff < 0.0 {
                    return (SignalType::Sell, SignalReason::Downtrend);
                }
            }
        }

        (SignalType::Hold, SignalReason::NoSignal)
    }

    /// Fold the latest bar into the stop state, at most once per tick.
    fn risk_tick(&mut self, bar: &PriceBar) -> Result<Option<StopStatus>> {
        if self.position.is_none() {
            return Ok(None);
        }

        let key = tick_key(bar);
        if let Some((seen, status)) = self.last_tick {
            if seen == key {
                return Ok(Some(status));
            }
        }

        let status = self.risk.update(bar.close)?;
        self.last_tick = Some((key, status));
        Ok(Some(status))
    }
}

impl Strategy for MovingAverageStrategy {
    fn name(&self) -> &str {
        "moving_average"
    }

    fn generate_signal(&mut self, bars: &[PriceBar]) -> Result<Signal> {
        let required = self.config.min_bars();
        let Some(last_bar) = bars.last().filter(|_| bars.len() >= required) else {
            return Err(TradingError::InsufficientData {
                required,
                available: bars.len(),
            });
        };

        let rows = self.indicators(bars);
        let (mut signal_type, mut reason) = self.detect_signal(&rows);
        let last = rows[rows.len() - 1];

        let stop = self.risk_tick(last_bar)?;
        if let Some(status) = stop {
            if status.triggered {
                if signal_type != SignalType::Sell {
                    info!(
                        overridden = %signal_type,
                        stop = status.stop_price,
                        "Stop loss overrides strategy signal"
                    );
                }
                signal_type = SignalType::Sell;
                reason = SignalReason::StopLoss;
            }
        }

        debug!(
            signal = %signal_type,
            reason = %reason,
            close = last.close,
            ma_diff = ?last.ma_diff,
            trend = ?last.trend,
            "Generated signal"
        );

        Ok(Signal {
            timestamp: last.timestamp,
            signal_type,
            reason,
            price: last.close,
            short_ma: last.short_ma,
            long_ma: last.long_ma,
            trend: last.trend,
            ma_diff: last.ma_diff,
            crossover: last.crossover,
            stop_loss_price: stop.map(|s| s.stop_price),
            trailing_active: stop.map(|s| s.trailing_active),
            highest_price: stop.map(|s| s.highest_price),
        })
    }

    fn calculate_position_size(&self, signal: &Signal, balance: f64) -> f64 {
        if !signal.is_buy() || !(signal.price > 0.0) || !(balance > 0.0) {
            return 0.0;
        }

        let strategy_size = balance * self.config.position_size_pct / signal.price;
        let risk_size = self.risk.calculate_max_position_size(balance, signal.price);
        let size = strategy_size.min(risk_size);

        debug!(
            strategy_size = strategy_size,
            risk_size = risk_size,
            size = size,
            "Calculated position size"
        );
        size
    }

    fn should_exit(&mut self, bars: &[PriceBar]) -> Result<bool> {
        if self.position.is_none() {
            return Ok(false);
        }
        let Some(last_bar) = bars.last() else {
            return Ok(false);
        };

        if let Some(status) = self.risk_tick(last_bar)? {
            if status.triggered {
                return Ok(true);
            }
        }

        let rows = self.indicators(bars);
        let (signal_type, _) = self.detect_signal(&rows);
        Ok(signal_type == SignalType::Sell)
    }

    fn update_position(&mut self, order: &Order) -> Result<()> {
        match order.side {
            OrderSide::Buy => {
                if self.position.is_some() {
                    return Err(TradingError::invalid_state(
                        "a position is already open; close it before buying again",
                    ));
                }

                let position = Position::from_order(order);
                let stop = self.risk.start_tracking(&position)?;
                info!(
                    order_id = %order.id,
                    entry = position.entry_price,
                    size = position.size,
                    stop = stop,
                    "Position opened"
                );
                self.position = Some(position);
            }
            OrderSide::Sell => match self.position.take() {
                Some(position) => {
                    self.risk.stop_tracking();
                    info!(
                        order_id = %order.id,
                        entry = position.entry_price,
                        exit = order.price,
                        pnl = (order.price - position.entry_price) * position.size,
                        "Position closed"
                    );
                }
                None => warn!(order_id = %order.id, "Sell recorded with no open position"),
            },
        }

        self.last_tick = None;
        Ok(())
    }

    fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }
}
