//! Data models for bars, orders, balances, and positions.

mod bar;
mod order;
mod position;

pub use bar::{PriceBar, Ticker};
pub(crate) use bar::RawBar;
pub use order::{split_symbol, Balance, Balances, Order, OrderRequest, OrderSide, OrderStatus, OrderType};
pub use position::{Position, PositionMetrics};
