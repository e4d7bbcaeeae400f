//! Order log persistence.
//!
//! Every order the caller places is written once when it is created and
//! rewritten as its status changes, so a run can be audited afterwards.
//! The full order is kept as JSON next to the indexed columns.

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::models::{Order, OrderStatus};

/// Narrows [`OrderRepository::orders`]; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub pair: Option<String>,
    pub order_flag: Option<String>,
    pub status: Option<OrderStatus>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, order: &Order) -> Result<()>;

    /// Rewrite a stored order; fails when it was never created.
    async fn update_order(&self, order: &Order) -> Result<()>;

    /// Orders matching the filter, oldest first.
    async fn orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;
}

/// Stored order row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredOrder {
    payload: String,
}

/// SQLite order log.
pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    /// Connect and create the schema. In-memory databases get a single
    /// connection so every query sees the same data.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {}", database_url))?
            .create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let repo = Self { pool };
        repo.run_migrations().await?;
        Ok(repo)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                order_flag TEXT NOT NULL,
                side TEXT NOT NULL,
                position_side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                close_reason TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_pair ON orders(pair, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_flag ON orders(order_flag)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn create_order(&self, order: &Order) -> Result<()> {
        let payload = serde_json::to_string(order).context("Failed to encode order")?;
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, pair, order_flag, side, position_side, order_type, status,
                price, quantity, close_reason, payload, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                price = excluded.price,
                close_reason = excluded.close_reason,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&order.id)
        .bind(&order.pair)
        .bind(&order.order_flag)
        .bind(order.side.as_str())
        .bind(order.position_side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(order.price.to_string())
        .bind(order.quantity.to_string())
        .bind(order.close_reason.map(|r| r.as_str()))
        .bind(payload)
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store order {}", order.id))?;

        debug!(order_id = %order.id, pair = %order.pair, status = order.status.as_str(), "Order stored");
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let payload = serde_json::to_string(order).context("Failed to encode order")?;
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = ?,
                price = ?,
                close_reason = ?,
                payload = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(order.status.as_str())
        .bind(order.price.to_string())
        .bind(order.close_reason.map(|r| r.as_str()))
        .bind(payload)
        .bind(order.updated_at.to_rfc3339())
        .bind(&order.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("order {} not found", order.id);
        }
        Ok(())
    }

    async fn orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, StoredOrder>(
            r#"
            SELECT payload FROM orders
            WHERE (?1 IS NULL OR pair = ?1)
              AND (?2 IS NULL OR order_flag = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(filter.pair.as_deref())
        .bind(filter.order_flag.as_deref())
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_str(&row.payload).context("Failed to decode stored order"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, OrderExtra, OrderType, PositionSide, SideType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(pair: &str, extra: OrderExtra) -> Order {
        Order::new(
            pair,
            SideType::Buy,
            PositionSide::Long,
            OrderType::Limit,
            dec!(0.5),
            dec!(42000.5),
            None,
            extra,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_update_and_filter() {
        let repo = SqliteOrderRepository::new("sqlite::memory:").await.unwrap();

        let entry = order("BTCUSDT", OrderExtra::new_entry(10, 0.75));
        let other = order("ETHUSDT", OrderExtra::new_entry(5, 0.6));
        repo.create_order(&entry).await.unwrap();
        repo.create_order(&other).await.unwrap();
        assert_eq!(repo.orders(&OrderFilter::default()).await.unwrap().len(), 2);

        let mut filled = entry.clone();
        filled.status = OrderStatus::Filled;
        filled.close_reason = Some(CloseReason::Timeout);
        repo.update_order(&filled).await.unwrap();

        let btc_only = OrderFilter {
            pair: Some("BTCUSDT".to_string()),
            ..Default::default()
        };
        let btc = repo.orders(&btc_only).await.unwrap();
        assert_eq!(btc, vec![filled.clone()]);
        assert_eq!(btc[0].price, dec!(42000.5));

        let by_flag = OrderFilter {
            order_flag: Some(other.order_flag.clone()),
            ..Default::default()
        };
        let by_flag = repo.orders(&by_flag).await.unwrap();
        assert_eq!(by_flag.len(), 1);
        assert_eq!(by_flag[0].pair, "ETHUSDT");

        let new_only = OrderFilter {
            status: Some(OrderStatus::New),
            ..Default::default()
        };
        assert_eq!(repo.orders(&new_only).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_order_fails() {
        let repo = SqliteOrderRepository::new("sqlite::memory:").await.unwrap();
        let missing = order("BTCUSDT", OrderExtra::new_entry(10, 0.75));
        assert!(repo.update_order(&missing).await.is_err());

        // create twice is an upsert
        repo.create_order(&missing).await.unwrap();
        repo.create_order(&missing).await.unwrap();
        assert_eq!(repo.orders(&OrderFilter::default()).await.unwrap().len(), 1);
    }
}
