//! Paper-trading exchange over a replayed feed.
//!
//! Orders fill immediately and completely: market orders at the last close,
//! limit orders at their limit price. Balances are kept as exact decimals and,
//! when a store is attached, every fill is persisted so the account survives a
//! restart.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::PaperStore;
use crate::error::ExchangeError;
use crate::models::{
    split_symbol, Balance, Balances, Order, OrderRequest, OrderSide, OrderStatus, OrderType, PriceBar,
    Ticker,
};

use super::{Exchange, ReplayFeed};

#[derive(Debug, Default)]
struct PaperBook {
    balances: HashMap<String, Decimal>,
    orders: Vec<Order>,
}

impl PaperBook {
    fn balance(&self, currency: &str) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Simulated spot account driven by a [`ReplayFeed`].
pub struct PaperExchange {
    feed: Mutex<ReplayFeed>,
    book: Mutex<PaperBook>,
    store: Option<PaperStore>,
}

/// Largest shortfall in base currency a sell absorbs by selling what is held.
const SELL_DUST: Decimal = dec!(0.000000001);

fn to_decimal(value: f64, what: &str) -> Result<Decimal> {
    Decimal::try_from(value).with_context(|| format!("{what} {value} is not representable"))
}

fn to_f64(value: Decimal, what: &str) -> Result<f64> {
    value
        .to_f64()
        .with_context(|| format!("{what} {value} does not fit in f64"))
}

impl PaperExchange {
    /// In-memory account with the given starting balances.
    pub fn new(feed: ReplayFeed, balances: HashMap<String, Decimal>) -> Self {
        Self {
            feed: Mutex::new(feed),
            book: Mutex::new(PaperBook {
                balances,
                orders: Vec::new(),
            }),
            store: None,
        }
    }

    /// In-memory account funded only in the feed's quote currency.
    pub fn with_quote_balance(feed: ReplayFeed, amount: f64) -> Result<Self> {
        let (_, quote) = split_symbol(feed.symbol())
            .with_context(|| format!("Symbol {} is not BASE/QUOTE", feed.symbol()))?;
        let balances = HashMap::from([(quote.to_string(), to_decimal(amount, "Balance")?)]);
        Ok(Self::new(feed, balances))
    }

    /// Persistent account. Restores balances, orders and cursor from `store`;
    /// a store with no balances is seeded with `initial`.
    pub async fn open(mut feed: ReplayFeed, store: PaperStore, initial: HashMap<String, Decimal>) -> Result<Self> {
        let mut balances = store.load_balances().await?;
        let orders = store.load_orders().await?;

        if balances.is_empty() {
            for (currency, amount) in &initial {
                store.save_balance(currency, *amount).await?;
            }
            balances = initial;
            info!("Initialized paper trading account");
        } else {
            info!(orders = orders.len(), "Loaded paper trading state");
        }

        if let Some(cursor) = store.load_cursor().await? {
            feed.seek(cursor);
            debug!(cursor = feed.cursor(), "Restored feed cursor");
        }

        Ok(Self {
            feed: Mutex::new(feed),
            book: Mutex::new(PaperBook { balances, orders }),
            store: Some(store),
        })
    }

    /// Reveal the next bar. Returns `false` when the feed is exhausted.
    pub async fn advance(&self) -> Result<bool> {
        let mut feed = self.feed.lock().await;
        if feed.is_exhausted() {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.save_cursor(feed.cursor() + 1).await?;
        }
        Ok(feed.advance())
    }

    pub async fn is_exhausted(&self) -> bool {
        self.feed.lock().await.is_exhausted()
    }

    pub async fn current_bar(&self) -> PriceBar {
        *self.feed.lock().await.current()
    }

    /// All fills so far, oldest first.
    pub async fn orders(&self) -> Vec<Order> {
        self.book.lock().await.orders.clone()
    }

    /// Account value in the quote currency at the last close.
    pub async fn equity(&self) -> Result<f64> {
        let feed = self.feed.lock().await;
        let (base, quote) = split_symbol(feed.symbol())
            .with_context(|| format!("Symbol {} is not BASE/QUOTE", feed.symbol()))?;
        let price = to_decimal(feed.current().close, "Price")?;

        let book = self.book.lock().await;
        let value = book.balance(quote) + book.balance(base) * price;
        to_f64(value, "Equity")
    }

    fn check_symbol(feed: &ReplayFeed, symbol: &str) -> Result<()> {
        if feed.symbol() != symbol {
            return Err(ExchangeError::UnknownMarket(format!(
                "{symbol} (paper feed trades {})",
                feed.symbol()
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<PriceBar>> {
        let feed = self.feed.lock().await;
        Self::check_symbol(&feed, symbol)?;
        if feed.timeframe() != timeframe {
            return Err(ExchangeError::UnknownMarket(format!(
                "{symbol} {timeframe} (paper feed is {})",
                feed.timeframe()
            ))
            .into());
        }
        if limit == 0 {
            return Err(ExchangeError::InvalidRequest("fetch_ohlcv limit must be at least 1".into()).into());
        }
        Ok(feed.window(limit).to_vec())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let feed = self.feed.lock().await;
        Self::check_symbol(&feed, symbol)?;
        let bar = feed.current();
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: bar.close,
            timestamp: bar.timestamp,
        })
    }

    async fn fetch_balance(&self) -> Result<Balances> {
        let book = self.book.lock().await;
        book.balances
            .iter()
            .map(|(currency, amount)| -> Result<(String, Balance)> {
                let total = to_f64(*amount, currency)?;
                Ok((
                    currency.clone(),
                    Balance {
                        free: total,
                        used: 0.0,
                        total,
                    },
                ))
            })
            .collect()
    }

    async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        if !(request.amount.is_finite() && request.amount > 0.0) {
            bail!("Order amount must be positive, got {}", request.amount);
        }
        let (base, quote) = split_symbol(&request.symbol)
            .with_context(|| format!("Symbol {} is not BASE/QUOTE", request.symbol))?;

        let (last_price, datetime) = {
            let feed = self.feed.lock().await;
            Self::check_symbol(&feed, &request.symbol)?;
            (feed.current().close, feed.current().datetime())
        };

        let execution_price = match request.order_type {
            OrderType::Market => last_price,
            OrderType::Limit => match request.price {
                Some(price) if price.is_finite() && price > 0.0 => price,
                Some(price) => bail!("Limit price must be positive, got {price}"),
                None => bail!("Price is required for limit orders"),
            },
        };

        let price = to_decimal(execution_price, "Price")?;
        let mut amount = to_decimal(request.amount, "Amount")?;

        let mut book = self.book.lock().await;
        let held = book.balance(base);
        let available = book.balance(quote);

        // Selling "everything" after an f64 round trip can overshoot by float noise
        if request.side == OrderSide::Sell && amount > held && amount - held <= SELL_DUST {
            amount = held;
        }
        let cost = amount * price;

        let (base_after, quote_after) = match request.side {
            OrderSide::Buy => {
                if available < cost {
                    warn!(needed = %cost, available = %available, "Paper buy rejected");
                    bail!("Insufficient paper trading balance in {quote}: need {cost}, have {available}");
                }
                (held + amount, available - cost)
            }
            OrderSide::Sell => {
                if held < amount {
                    warn!(needed = %amount, available = %held, "Paper sell rejected");
                    bail!("Insufficient paper trading balance in {base}: need {amount}, have {held}");
                }
                (held - amount, available + cost)
            }
        };

        let order = Order {
            id: format!("paper_{}", book.orders.len()),
            datetime,
            symbol: request.symbol.clone(),
            order_type: request.order_type,
            side: request.side,
            amount: to_f64(amount, "Amount")?,
            price: execution_price,
            status: OrderStatus::Closed,
        };

        // The book only changes once the fill is durable
        if let Some(store) = &self.store {
            store
                .save_fill(&order, &[(base, base_after), (quote, quote_after)])
                .await
                .with_context(|| format!("Failed to record paper order {}", order.id))?;
            debug!(order_id = %order.id, "Saved paper trading state");
        }

        book.balances.insert(base.to_string(), base_after);
        book.balances.insert(quote.to_string(), quote_after);
        book.orders.push(order.clone());

        info!(
            order_id = %order.id,
            side = %order.side.as_str(),
            amount = order.amount,
            price = order.price,
            "Paper order filled"
        );
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Order> {
        let book = self.book.lock().await;
        book.orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .with_context(|| format!("Order {order_id} not found"))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let book = self.book.lock().await;
        if book.orders.iter().any(|o| o.id == order_id) {
            bail!("Order {order_id} is already filled; paper orders cannot be canceled");
        }
        bail!("Order {order_id} not found")
    }
}
