//! Exchange seam: the operations the trading loop consumes.

mod paper;
mod replay;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Balances, Order, OrderRequest, PriceBar, Ticker};

pub use paper::PaperExchange;
pub use replay::ReplayFeed;

/// Spot exchange operations, named after their ccxt counterparts.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Most recent `limit` bars, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<PriceBar>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_balance(&self) -> Result<Balances>;

    async fn create_order(&self, request: OrderRequest) -> Result<Order>;

    async fn fetch_order(&self, order_id: &str) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}
