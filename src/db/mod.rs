//! SQLite persistence for the paper exchange.
//!
//! Stores what a paper account needs to resume after restart:
//! - Currency balances (exact decimals, stored as text)
//! - Every filled order, in placement order
//! - The replay feed cursor

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Order, OrderSide, OrderStatus, OrderType};

/// Paper account store backed by a SQLite pool. Clones share the pool.
#[derive(Clone)]
pub struct PaperStore {
    pool: SqlitePool,
}

/// Stored order record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredOrder {
    id: String,
    symbol: String,
    order_type: String,
    side: String,
    amount: f64,
    price: f64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<StoredOrder> for Order {
    type Error = anyhow::Error;

    fn try_from(row: StoredOrder) -> Result<Self> {
        Ok(Order {
            order_type: OrderType::parse(&row.order_type)
                .with_context(|| format!("Unknown order type '{}' for {}", row.order_type, row.id))?,
            side: OrderSide::parse(&row.side)
                .with_context(|| format!("Unknown order side '{}' for {}", row.side, row.id))?,
            status: OrderStatus::parse(&row.status)
                .with_context(|| format!("Unknown order status '{}' for {}", row.status, row.id))?,
            id: row.id,
            datetime: row.created_at,
            symbol: row.symbol,
            amount: row.amount,
            price: row.price,
        })
    }
}

const UPSERT_BALANCE: &str = r#"
    INSERT INTO paper_balances (currency, amount, updated_at)
    VALUES (?, ?, datetime('now'))
    ON CONFLICT(currency) DO UPDATE SET
        amount = excluded.amount,
        updated_at = datetime('now')
"#;

impl PaperStore {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each connection to an in-memory database sees its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Fresh in-memory store, used by backtests and tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_balances (
                currency TEXT PRIMARY KEY,
                amount TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_orders (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                order_type TEXT NOT NULL,
                side TEXT NOT NULL,
                amount REAL NOT NULL,
                price REAL NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Balances ====================

    pub async fn save_balance(&self, currency: &str, amount: Decimal) -> Result<()> {
        sqlx::query(UPSERT_BALANCE)
            .bind(currency)
            .bind(amount.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to save {currency} balance"))?;

        Ok(())
    }

    pub async fn load_balances(&self) -> Result<HashMap<String, Decimal>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT currency, amount FROM paper_balances")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch balances")?;

        rows.into_iter()
            .map(|(currency, amount)| -> Result<(String, Decimal)> {
                let value = Decimal::from_str(&amount)
                    .with_context(|| format!("Corrupt {currency} balance '{amount}'"))?;
                Ok((currency, value))
            })
            .collect()
    }

    // ==================== Orders ====================

    /// Record a fill and the balances it leaves behind. Either everything is
    /// written or nothing is.
    pub async fn save_fill(&self, order: &Order, balances: &[(&str, Decimal)]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for (currency, amount) in balances {
            sqlx::query(UPSERT_BALANCE)
                .bind(*currency)
                .bind(amount.to_string())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to save {currency} balance"))?;
        }

        sqlx::query(
            r#"
            INSERT INTO paper_orders (id, symbol, order_type, side, amount, price, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.symbol)
        .bind(order.order_type.as_str())
        .bind(order.side.as_str())
        .bind(order.amount)
        .bind(order.price)
        .bind(order.status.as_str())
        .bind(order.datetime)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to save order {}", order.id))?;

        tx.commit().await.context("Failed to commit fill")?;
        Ok(())
    }

    /// All orders, oldest first.
    pub async fn load_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            r#"
            SELECT id, symbol, order_type, side, amount, price, status, created_at
            FROM paper_orders ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders")?;

        rows.into_iter().map(Order::try_from).collect()
    }

    // ==================== Feed cursor ====================

    pub async fn save_cursor(&self, cursor: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO paper_state (key, value) VALUES ('cursor', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(cursor.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save feed cursor")?;

        Ok(())
    }

    pub async fn load_cursor(&self) -> Result<Option<usize>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM paper_state WHERE key = 'cursor'")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch feed cursor")?;

        row.map(|(value,)| {
            value
                .parse::<usize>()
                .with_context(|| format!("Corrupt feed cursor '{value}'"))
        })
        .transpose()
    }

    /// Wipe the paper account.
    pub async fn reset(&self) -> Result<()> {
        for table in ["paper_balances", "paper_orders", "paper_state"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to clear {table}"))?;
        }
        Ok(())
    }

    /// Close the pool. Later writes fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(id: &str, side: OrderSide, price: f64) -> Order {
        Order {
            id: id.to_string(),
            datetime: DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            symbol: "BTC/USD".to_string(),
            order_type: OrderType::Market,
            side,
            amount: 0.25,
            price,
            status: OrderStatus::Closed,
        }
    }

    #[tokio::test]
    async fn test_balances_round_trip_exactly() {
        let store = PaperStore::in_memory().await.unwrap();
        store.save_balance("USD", dec!(10000)).await.unwrap();
        store.save_balance("BTC", dec!(0.12345678)).await.unwrap();
        store.save_balance("USD", dec!(9876.54321)).await.unwrap();

        let balances = store.load_balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances["USD"], dec!(9876.54321));
        assert_eq!(balances["BTC"], dec!(0.12345678));
    }

    #[tokio::test]
    async fn test_orders_keep_placement_order() {
        let store = PaperStore::in_memory().await.unwrap();
        let buy = order("paper_0", OrderSide::Buy, 1000.0);
        let sell = order("paper_1", OrderSide::Sell, 1050.0);
        store.save_fill(&buy, &[]).await.unwrap();
        store.save_fill(&sell, &[]).await.unwrap();

        let orders = store.load_orders().await.unwrap();
        assert_eq!(orders, vec![buy.clone(), sell]);
    }

    #[tokio::test]
    async fn test_fill_is_all_or_nothing() {
        let store = PaperStore::in_memory().await.unwrap();
        let buy = order("paper_0", OrderSide::Buy, 1000.0);
        store
            .save_fill(&buy, &[("USD", dec!(9750)), ("BTC", dec!(0.25))])
            .await
            .unwrap();

        // Duplicate id: the balance update in the same fill is rolled back
        assert!(store.save_fill(&buy, &[("USD", dec!(1))]).await.is_err());

        let balances = store.load_balances().await.unwrap();
        assert_eq!(balances["USD"], dec!(9750));
        assert_eq!(balances["BTC"], dec!(0.25));
        assert_eq!(store.load_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let store = PaperStore::in_memory().await.unwrap();
        store.close().await;
        assert!(store.save_balance("USD", dec!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_and_reset() {
        let store = PaperStore::in_memory().await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), None);

        store.save_cursor(12).await.unwrap();
        store.save_cursor(13).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), Some(13));

        store.save_balance("USD", dec!(1)).await.unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), None);
        assert!(store.load_balances().await.unwrap().is_empty());
    }
}
