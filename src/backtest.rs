//! Backtesting engine: replays a recorded feed through the bot.
//!
//! Features:
//! - Runs the live decision cycle bar by bar against an in-memory paper account
//! - Force-closes a position still open when the feed ends
//! - Pairs fills into round-trip trades with their exit reasons
//! - Calculates performance statistics over trades and the equity curve

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::bot::{Bot, CycleOutcome};
use crate::config::AppConfig;
use crate::exchange::{PaperExchange, ReplayFeed};
use crate::metrics::{MetricsCalculator, PerformanceReport};
use crate::models::{Order, OrderSide};

/// Exit reason recorded for positions closed because the data ran out.
pub const END_OF_BACKTEST: &str = "End of Backtest";

/// A completed round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestTrade {
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    /// Fractional return on the entry price
    pub return_pct: f64,
    pub exit_reason: String,
}

impl BacktestTrade {
    pub fn holding_hours(&self) -> f64 {
        (self.exit_time - self.entry_time).num_minutes() as f64 / 60.0
    }
}

/// Backtest results summary.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub symbol: String,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub bars_processed: usize,
    /// Cycles that evaluated nothing (warm-up, undersized buys)
    pub skipped_cycles: usize,
    pub trades: Vec<BacktestTrade>,
    /// Equity after each bar
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub report: PerformanceReport,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BacktestResults {
    /// Trade count and total P&L per exit reason, largest count first.
    pub fn by_exit_reason(&self) -> Vec<(String, usize, f64)> {
        let mut by_reason: HashMap<&str, (usize, f64)> = HashMap::new();
        for trade in &self.trades {
            let entry = by_reason.entry(trade.exit_reason.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += trade.pnl;
        }

        let mut rows: Vec<(String, usize, f64)> = by_reason
            .into_iter()
            .map(|(reason, (count, pnl))| (reason.to_string(), count, pnl))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    pub fn avg_holding_hours(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        self.trades.iter().map(BacktestTrade::holding_hours).sum::<f64>() / self.trades.len() as f64
    }
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol: {}", self.symbol)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Bars:   {} ({} cycles skipped)", self.bars_processed, self.skipped_cycles)?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:       ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:         ${:.2}", self.final_equity)?;
        writeln!(f)?;
        writeln!(f, "{}", self.report)?;
        writeln!(f)?;
        writeln!(f, "--- Timing ---")?;
        writeln!(f, "Avg Hold:      {:.1} hours", self.avg_holding_hours())?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting engine.
pub struct Backtester {
    config: AppConfig,
}

impl Backtester {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Replay the whole feed from its first bar.
    pub async fn run(&self, mut feed: ReplayFeed) -> Result<BacktestResults> {
        feed.seek(1);
        let symbol = feed.symbol().to_string();
        let bars_processed = feed.len();
        let start_time = feed.bars()[0].datetime();
        let end_time = feed.bars()[feed.len() - 1].datetime();
        let initial_capital = self.config.exchange.paper_balance;

        info!(
            symbol = %symbol,
            bars = bars_processed,
            capital = initial_capital,
            "Starting backtest"
        );

        let paper = Arc::new(PaperExchange::with_quote_balance(feed, initial_capital)?);
        let mut bot = Bot::new(paper.clone(), &self.config)?;

        let mut exit_reasons: HashMap<String, String> = HashMap::new();
        let mut equity_curve = Vec::with_capacity(bars_processed);
        let mut skipped_cycles = 0;

        loop {
            let outcome = bot.run_cycle().await.context("Backtest cycle failed")?;
            match &outcome {
                CycleOutcome::Skipped(reason) => {
                    debug!(reason = %reason, "Cycle skipped");
                    skipped_cycles += 1;
                }
                CycleOutcome::Closed { signal, order } => {
                    exit_reasons.insert(order.id.clone(), signal.reason.to_string());
                }
                CycleOutcome::Held(_) | CycleOutcome::Opened { .. } => {}
            }

            let bar = paper.current_bar().await;
            equity_curve.push((bar.datetime(), paper.equity().await?));

            if !paper.advance().await? {
                break;
            }
        }

        if bot.strategy().position().is_some() {
            let order = bot.close_position(END_OF_BACKTEST).await?;
            exit_reasons.insert(order.id.clone(), END_OF_BACKTEST.to_string());
        }

        let final_equity = paper.equity().await?;
        if let Some(last) = equity_curve.last_mut() {
            last.1 = final_equity;
        }

        let trades = pair_trades(&paper.orders().await, &exit_reasons);
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let curve: Vec<f64> = equity_curve.iter().map(|(_, e)| *e).collect();
        let report = MetricsCalculator::calculate(initial_capital, &pnls, &returns, &curve);

        info!(
            trades = trades.len(),
            final_equity = final_equity,
            return_pct = report.total_return_pct * 100.0,
            "Backtest complete"
        );

        Ok(BacktestResults {
            symbol,
            initial_capital,
            final_equity,
            bars_processed,
            skipped_cycles,
            trades,
            equity_curve,
            report,
            start_time,
            end_time,
        })
    }
}

/// Match each sell with the buy before it.
fn pair_trades(orders: &[Order], exit_reasons: &HashMap<String, String>) -> Vec<BacktestTrade> {
    let mut trades = Vec::new();
    let mut entry: Option<&Order> = None;

    for order in orders {
        match order.side {
            OrderSide::Buy => entry = Some(order),
            OrderSide::Sell => {
                let Some(buy) = entry.take() else {
                    continue;
                };
                let return_pct = if buy.price > 0.0 {
                    (order.price - buy.price) / buy.price
                } else {
                    0.0
                };
                trades.push(BacktestTrade {
                    size: order.amount,
                    entry_price: buy.price,
                    exit_price: order.price,
                    entry_time: buy.datetime,
                    exit_time: order.datetime,
                    pnl: (order.price - buy.price) * order.amount,
                    return_pct,
                    exit_reason: exit_reasons
                        .get(&order.id)
                        .cloned()
                        .unwrap_or_else(|| "Signal".to_string()),
                });
            }
        }
    }
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBar;

    fn feed(closes: &[f64]) -> ReplayFeed {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar::new(1_704_067_200_000 + i as i64 * 3_600_000, c, c, c, c, 1.0))
            .collect();
        ReplayFeed::new("BTC/USD", "1h", bars).unwrap()
    }

    fn uptrend(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 2.0 * i as f64).collect()
    }

    fn backtester() -> Backtester {
        let mut config = AppConfig::default();
        config.bot.retry_max_elapsed_secs = 0;
        Backtester::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_stop_loss_round_trip() {
        // Buy on the first full window at 120, ride to 138, stop out at 130
        let mut closes = uptrend(20);
        closes.push(130.0);

        let results = backtester().run(feed(&closes)).await.unwrap();
        assert_eq!(results.bars_processed, 21);
        assert_eq!(results.skipped_cycles, 10);
        assert_eq!(results.trades.len(), 1);

        let trade = &results.trades[0];
        assert_eq!(trade.entry_price, 120.0);
        assert_eq!(trade.exit_price, 130.0);
        assert_eq!(trade.exit_reason, "Stop Loss");
        assert!((trade.pnl - 10.0 * 1000.0 / 120.0).abs() < 1e-6);
        assert!((trade.holding_hours() - 10.0).abs() < 1e-9);

        assert_eq!(results.report.winning_trades, 1);
        assert!((results.final_equity - (10_000.0 + trade.pnl)).abs() < 1e-6);
        assert_eq!(results.equity_curve.len(), 21);
        assert!(results.report.max_drawdown_pct > 0.0);
    }

    #[tokio::test]
    async fn test_open_position_closed_at_end() {
        let results = backtester().run(feed(&uptrend(20))).await.unwrap();

        assert_eq!(results.trades.len(), 1);
        let trade = &results.trades[0];
        assert_eq!(trade.exit_reason, END_OF_BACKTEST);
        assert_eq!(trade.exit_price, 138.0);
        assert!(trade.pnl > 0.0);

        let reasons = results.by_exit_reason();
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].0, END_OF_BACKTEST);
        assert_eq!(reasons[0].1, 1);
    }

    #[tokio::test]
    async fn test_flat_market_never_trades() {
        let results = backtester().run(feed(&[100.0; 30])).await.unwrap();
        assert!(results.trades.is_empty());
        assert_eq!(results.final_equity, 10_000.0);
        assert_eq!(results.report.total_return_pct, 0.0);
        assert!(results.to_string().contains("BACKTEST RESULTS"));
    }

    #[test]
    fn test_pair_trades_ignores_unmatched_sell() {
        let time = Utc::now();
        let order = |id: &str, side, price| Order {
            id: id.to_string(),
            datetime: time,
            symbol: "BTC/USD".to_string(),
            order_type: crate::models::OrderType::Market,
            side,
            amount: 2.0,
            price,
            status: crate::models::OrderStatus::Closed,
        };
        let orders = vec![
            order("paper_0", OrderSide::Sell, 90.0),
            order("paper_1", OrderSide::Buy, 100.0),
            order("paper_2", OrderSide::Sell, 95.0),
        ];

        let trades = pair_trades(&orders, &HashMap::new());
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl, -10.0);
        assert_eq!(trades[0].return_pct, -0.05);
        assert_eq!(trades[0].exit_reason, "Signal");
    }
}
