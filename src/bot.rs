//! Bot runner: one trading decision per cycle against an [`Exchange`].
//!
//! Each cycle:
//! - Fetches recent bars (retried with exponential backoff)
//! - Generates a signal, folding the latest close into the stop state
//! - Closes the open position on exit, or sizes and opens one on a buy

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{ExchangeError, TradingError};
use crate::exchange::{Exchange, PaperExchange};
use crate::models::{split_symbol, Order, OrderRequest, OrderSide, PositionMetrics, PriceBar};
use crate::trading::{build_strategy, Signal, Strategy};

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing evaluated or placed
    Skipped(String),
    /// Signal evaluated, no order placed
    Held(Signal),
    Opened { signal: Signal, order: Order },
    Closed { signal: Signal, order: Order },
}

impl CycleOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            CycleOutcome::Opened { order, .. } | CycleOutcome::Closed { order, .. } => Some(order),
            _ => None,
        }
    }
}

/// Main bot runner.
pub struct Bot {
    exchange: Arc<dyn Exchange>,
    strategy: Box<dyn Strategy>,
    symbol: String,
    quote: String,
    timeframe: String,
    history_limit: usize,
    poll_interval: Duration,
    retry_max_elapsed: Duration,
    min_order_size: f64,
    cycles: u64,
}

impl Bot {
    pub fn new(exchange: Arc<dyn Exchange>, config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let strategy = build_strategy(&config.strategy, &config.risk)?;

        let symbol = config.exchange.symbol.clone();
        let (_, quote) = split_symbol(&symbol)
            .with_context(|| format!("Symbol {symbol} is not BASE/QUOTE"))?;
        let quote = quote.to_string();

        info!(
            exchange = exchange.name(),
            strategy = strategy.name(),
            symbol = %symbol,
            timeframe = %config.exchange.timeframe,
            "Bot created"
        );

        Ok(Self {
            exchange,
            strategy,
            symbol,
            quote,
            timeframe: config.exchange.timeframe.clone(),
            history_limit: config.exchange.history_limit,
            poll_interval: Duration::from_secs(config.bot.poll_interval_secs),
            retry_max_elapsed: Duration::from_secs(config.bot.retry_max_elapsed_secs),
            min_order_size: config.bot.min_order_size,
            cycles: 0,
        })
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Rebuild the open position from a previous session's fills.
    ///
    /// Only the last order matters: a trailing buy means a position is still
    /// open. Stop tracking restarts from that entry.
    pub fn resume(&mut self, orders: &[Order]) -> Result<()> {
        let Some(last) = orders.iter().rev().find(|o| o.symbol == self.symbol) else {
            return Ok(());
        };
        if last.side == OrderSide::Buy {
            self.strategy.update_position(last)?;
            info!(order_id = %last.id, entry = last.price, "Resumed open position");
        }
        Ok(())
    }

    async fn fetch_bars(&self) -> Result<Vec<PriceBar>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(self.retry_max_elapsed))
            .build();

        let exchange = self.exchange.as_ref();
        let (symbol, timeframe, limit) = (self.symbol.as_str(), self.timeframe.as_str(), self.history_limit);

        backoff::future::retry(policy, || async move {
            exchange
                .fetch_ohlcv(symbol, timeframe, limit)
                .await
                .map_err(|e| {
                    if e.downcast_ref::<ExchangeError>().is_some() {
                        return backoff::Error::permanent(e);
                    }
                    warn!(error = %e, "Market data fetch failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
        .context("Failed to fetch market data")
    }

    async fn free_balance(&self, currency: &str) -> Result<f64> {
        let balances = self.exchange.fetch_balance().await?;
        Ok(balances.get(currency).map_or(0.0, |b| b.free))
    }

    /// Run one decision cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.cycles += 1;
        let bars = self.fetch_bars().await?;

        let signal = match self.strategy.generate_signal(&bars) {
            Ok(signal) => signal,
            Err(TradingError::InsufficientData { required, available }) => {
                debug!(required, available, "Not enough history yet");
                return Ok(CycleOutcome::Skipped(format!(
                    "waiting for history ({available}/{required} bars)"
                )));
            }
            Err(e) => return Err(e).context("Signal generation failed"),
        };

        if self.strategy.position().is_some() {
            if !self.strategy.should_exit(&bars)? {
                return Ok(CycleOutcome::Held(signal));
            }
            let order = self.close_position(signal.reason.as_str()).await?;
            return Ok(CycleOutcome::Closed { signal, order });
        }

        if !signal.is_buy() {
            return Ok(CycleOutcome::Held(signal));
        }

        let balance = self.free_balance(&self.quote).await?;
        let size = self.strategy.calculate_position_size(&signal, balance);
        if !(size >= self.min_order_size) || size <= 0.0 {
            info!(size = size, min = self.min_order_size, "Buy signal too small to trade");
            return Ok(CycleOutcome::Skipped(format!("size {size:.8} below minimum")));
        }

        let order = self
            .exchange
            .create_order(OrderRequest::market(&self.symbol, OrderSide::Buy, size))
            .await
            .context("Failed to place buy order")?;
        self.strategy.update_position(&order)?;

        info!(
            order_id = %order.id,
            reason = %signal.reason,
            size = order.amount,
            price = order.price,
            "Opened position"
        );
        Ok(CycleOutcome::Opened { signal, order })
    }

    /// Sell the whole open position at market.
    pub async fn close_position(&mut self, reason: &str) -> Result<Order> {
        let position = self
            .strategy
            .position()
            .cloned()
            .context("No open position to close")?;

        let order = self
            .exchange
            .create_order(OrderRequest::market(&self.symbol, OrderSide::Sell, position.size))
            .await
            .context("Failed to place sell order")?;
        self.strategy.update_position(&order)?;

        info!(
            order_id = %order.id,
            reason = %reason,
            entry = position.entry_price,
            exit = order.price,
            pnl = (order.price - position.entry_price) * order.amount,
            "Closed position"
        );
        Ok(order)
    }

    /// Mark-to-market of the open position at the latest bar.
    pub async fn risk_metrics(&self) -> Result<Option<PositionMetrics>> {
        if self.strategy.position().is_none() {
            return Ok(None);
        }
        let ticker = self.exchange.fetch_ticker(&self.symbol).await?;
        let bar = PriceBar::new(ticker.timestamp, ticker.last, ticker.last, ticker.last, ticker.last, 0.0);
        Ok(self.strategy.risk_metrics(&[bar]))
    }

    /// Paper trading loop: one cycle per poll interval, advancing the feed
    /// after each, until the feed runs out or Ctrl+C.
    pub async fn run_paper(&mut self, paper: &PaperExchange) -> Result<()> {
        info!(
            poll_interval = self.poll_interval.as_secs(),
            "Starting paper trading loop"
        );
        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(outcome) => self.report(&outcome, paper).await,
                        Err(e) => error!(error = %e, "Error in bot cycle"),
                    }

                    if !paper.advance().await? {
                        info!("Replay feed exhausted");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn report(&self, outcome: &CycleOutcome, paper: &PaperExchange) {
        let equity = match paper.equity().await {
            Ok(equity) => format!("${equity:.2}"),
            Err(e) => {
                warn!(error = %e, "Failed to value paper account");
                "n/a".to_string()
            }
        };
        let bar = paper.current_bar().await;

        let action = match outcome {
            CycleOutcome::Skipped(reason) => format!("skip ({reason})"),
            CycleOutcome::Held(signal) => format!("hold ({})", signal.reason),
            CycleOutcome::Opened { order, .. } => format!("BUY {:.6} @ {:.2}", order.amount, order.price),
            CycleOutcome::Closed { signal, order } => {
                format!("SELL {:.6} @ {:.2} ({})", order.amount, order.price, signal.reason)
            }
        };

        let pnl = self
            .strategy
            .risk_metrics(&[bar])
            .map(|m| format!(" | Unrealized: ${:.2} ({:+.2}%)", m.unrealized_pnl, m.pnl_percentage))
            .unwrap_or_default();

        println!(
            "[{}] Close: {:.2} | {} | Equity: {}{}",
            bar.datetime().format("%Y-%m-%d %H:%M"),
            bar.close,
            action,
            equity,
            pnl
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::exchange::ReplayFeed;
    use crate::models::{Balances, Ticker};
    use crate::risk::StopLossConfig;
    use crate::trading::{SignalReason, SignalType};

    fn feed(closes: &[f64]) -> ReplayFeed {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar::new(1_704_067_200_000 + i as i64 * 3_600_000, c, c, c, c, 1.0))
            .collect();
        ReplayFeed::new("BTC/USD", "1h", bars).unwrap()
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.exchange.history_limit = 50;
        config.bot.retry_max_elapsed_secs = 0;
        config
    }

    fn setup(closes: &[f64], visible: usize) -> (Arc<PaperExchange>, Bot) {
        let mut feed = feed(closes);
        feed.seek(visible);
        let paper = Arc::new(PaperExchange::with_quote_balance(feed, 10_000.0).unwrap());
        let bot = Bot::new(paper.clone(), &config()).unwrap();
        (paper, bot)
    }

    fn uptrend(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 2.0 * i as f64).collect()
    }

    #[tokio::test]
    async fn test_skips_until_history_fills() {
        let (_, mut bot) = setup(&uptrend(20), 5);
        let outcome = bot.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped(_)));
        assert!(bot.strategy().position().is_none());
    }

    #[tokio::test]
    async fn test_opens_on_buy_signal() {
        let (paper, mut bot) = setup(&uptrend(20), 20);

        let outcome = bot.run_cycle().await.unwrap();
        let (signal, order) = match outcome {
            CycleOutcome::Opened { signal, order } => (signal, order),
            other => panic!("expected an opened position, got {other:?}"),
        };
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert_eq!(order.price, 138.0);
        // 10% of 10000 at 138
        assert!((order.amount - 1000.0 / 138.0).abs() < 1e-9);

        let position = bot.strategy().position().unwrap();
        assert_eq!(position.entry_price, 138.0);
        assert_eq!(paper.orders().await.len(), 1);

        // Still rising: hold the position
        let outcome = bot.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Held(_)));
    }

    #[tokio::test]
    async fn test_closes_on_stop_loss() {
        let mut closes = uptrend(20);
        closes.push(100.0);
        let (paper, mut bot) = setup(&closes, 20);

        assert!(matches!(bot.run_cycle().await.unwrap(), CycleOutcome::Opened { .. }));
        paper.advance().await.unwrap();

        let outcome = bot.run_cycle().await.unwrap();
        let (signal, order) = match outcome {
            CycleOutcome::Closed { signal, order } => (signal, order),
            other => panic!("expected a closed position, got {other:?}"),
        };
        assert_eq!(signal.reason, SignalReason::StopLoss);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.price, 100.0);
        assert!(bot.strategy().position().is_none());

        let balances = paper.fetch_balance().await.unwrap();
        assert!(balances["BTC"].total.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_downtrend_without_position_holds() {
        let closes: Vec<f64> = (0..20).map(|i| 200.0 - 2.0 * i as f64).collect();
        let (paper, mut bot) = setup(&closes, 20);

        let outcome = bot.run_cycle().await.unwrap();
        let signal = match outcome {
            CycleOutcome::Held(signal) => signal,
            other => panic!("expected hold, got {other:?}"),
        };
        assert!(signal.is_sell());
        assert!(paper.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_tiny_balance_skips_buy() {
        let mut feed = feed(&uptrend(20));
        feed.seek(20);
        let paper = Arc::new(PaperExchange::with_quote_balance(feed, 0.0001).unwrap());
        let mut bot = Bot::new(paper.clone(), &config()).unwrap();

        let outcome = bot.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped(_)));
        assert!(paper.orders().await.is_empty());
    }

    /// Fails the first `failures` bar fetches, then delegates.
    struct FlakyExchange {
        inner: PaperExchange,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Exchange for FlakyExchange {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<PriceBar>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection reset");
            }
            self.inner.fetch_ohlcv(symbol, timeframe, limit).await
        }

        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
            self.inner.fetch_ticker(symbol).await
        }

        async fn fetch_balance(&self) -> Result<Balances> {
            self.inner.fetch_balance().await
        }

        async fn create_order(&self, request: OrderRequest) -> Result<Order> {
            self.inner.create_order(request).await
        }

        async fn fetch_order(&self, order_id: &str) -> Result<Order> {
            self.inner.fetch_order(order_id).await
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            self.inner.cancel_order(order_id).await
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_after_retries() {
        let (_, mut bot) = setup(&uptrend(20), 20);
        bot.timeframe = "5m".to_string();
        assert!(bot.run_cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_market_fails_without_retrying() {
        let (_, mut bot) = setup(&uptrend(20), 20);
        bot.retry_max_elapsed = Duration::from_secs(30);
        bot.symbol = "ETH/USD".to_string();

        let result = tokio::time::timeout(Duration::from_secs(5), bot.run_cycle())
            .await
            .expect("permanent error should not wait out the retry budget");
        let err = result.unwrap_err();
        assert!(err.root_cause().downcast_ref::<ExchangeError>().is_some(), "{err:#}");
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let mut feed = feed(&uptrend(20));
        feed.seek(20);
        let exchange = Arc::new(FlakyExchange {
            inner: PaperExchange::with_quote_balance(feed, 10_000.0).unwrap(),
            failures: AtomicUsize::new(1),
        });
        let mut config = config();
        config.bot.retry_max_elapsed_secs = 10;
        let mut bot = Bot::new(exchange.clone(), &config).unwrap();

        let outcome = bot.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Opened { .. }));
        assert_eq!(exchange.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_restores_position() {
        let (paper, mut bot) = setup(&uptrend(20), 20);
        bot.run_cycle().await.unwrap();

        let mut resumed = Bot::new(paper.clone(), &config()).unwrap();
        resumed.resume(&paper.orders().await).unwrap();
        assert_eq!(resumed.strategy().position().unwrap().entry_price, 138.0);

        let metrics = resumed.risk_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.unrealized_pnl, 0.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let paper = Arc::new(PaperExchange::with_quote_balance(feed(&[1.0]), 1.0).unwrap());
        let mut config = config();
        config.risk = StopLossConfig::fixed(0.0);
        assert!(Bot::new(paper, &config).is_err());
    }
}
