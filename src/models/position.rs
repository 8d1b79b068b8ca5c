//! The single open long position the strategy is managing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Order;

/// Currently held position. At most one exists at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Fill price of the opening buy
    pub entry_price: f64,

    /// Base-currency amount held
    pub size: f64,

    /// When the opening order executed
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn new(entry_price: f64, size: f64, opened_at: DateTime<Utc>) -> Self {
        Self {
            entry_price,
            size,
            opened_at,
        }
    }

    /// Build a position from an executed buy order.
    pub fn from_order(order: &Order) -> Self {
        Self::new(order.price, order.amount, order.datetime)
    }

    /// Risk metrics at the given market price.
    pub fn metrics_at(&self, current_price: f64) -> PositionMetrics {
        let unrealized_pnl = (current_price - self.entry_price) * self.size;
        let cost_basis = self.entry_price * self.size;
        let pnl_percentage = if cost_basis != 0.0 {
            unrealized_pnl / cost_basis * 100.0
        } else {
            0.0
        };

        PositionMetrics {
            unrealized_pnl,
            pnl_percentage,
            position_value: current_price * self.size,
        }
    }
}

/// Mark-to-market view of a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMetrics {
    pub unrealized_pnl: f64,
    /// P&L relative to cost basis, in percent
    pub pnl_percentage: f64,
    pub position_value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_metrics() {
        let pos = Position::new(1000.0, 1.0, Utc::now());

        let up = pos.metrics_at(1100.0);
        assert_eq!(up.unrealized_pnl, 100.0);
        assert!((up.pnl_percentage - 10.0).abs() < 1e-9);
        assert_eq!(up.position_value, 1100.0);

        let down = pos.metrics_at(900.0);
        assert_eq!(down.unrealized_pnl, -100.0);
        assert!((down.pnl_percentage + 10.0).abs() < 1e-9);
    }
}
