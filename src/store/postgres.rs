use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::dao::{OrderStore, unapplied_outcome};
use super::models::{
    CreateOrderOutcome, EnrichmentInsert, IdempotencyKey, NewOrder, Order, OrderEnrichment,
    OrderItem, OrderStatus, StatusTransition, TransitionOutcome,
};

#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &PgRow, items: Vec<OrderItem>) -> Result<Order> {
        let status: String = row.try_get("status").context("failed to get status")?;
        let status = OrderStatus::from_str(&status)
            .ok_or_else(|| anyhow!("unknown order status in store: {status}"))?;

        Ok(Order {
            id: row.try_get("id").context("failed to get id")?,
            customer_id: row
                .try_get("customer_id")
                .context("failed to get customer_id")?,
            status,
            total_amount: row
                .try_get("total_amount")
                .context("failed to get total_amount")?,
            created_at: row
                .try_get("created_at")
                .context("failed to get created_at")?,
            updated_at: row
                .try_get("updated_at")
                .context("failed to get updated_at")?,
            items,
        })
    }

    fn row_to_item(row: &PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            id: row.try_get("id").context("failed to get item id")?,
            order_id: row
                .try_get("order_id")
                .context("failed to get item order_id")?,
            sku: row.try_get("sku").context("failed to get sku")?,
            qty: row.try_get("qty").context("failed to get qty")?,
        })
    }

    fn row_to_enrichment(row: &PgRow) -> Result<OrderEnrichment> {
        Ok(OrderEnrichment {
            id: row.try_get("id").context("failed to get enrichment id")?,
            order_id: row
                .try_get("order_id")
                .context("failed to get enrichment order_id")?,
            data: row.try_get("data").context("failed to get enrichment data")?,
            created_at: row
                .try_get("created_at")
                .context("failed to get enrichment created_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyKey>> {
        let row = sqlx::query(
            r"
            SELECT key, order_id, created_at
            FROM idempotency_keys
            WHERE key = $1
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up idempotency key")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(IdempotencyKey {
            key: row.try_get("key").context("failed to get key")?,
            order_id: row.try_get("order_id").context("failed to get order_id")?,
            created_at: row
                .try_get("created_at")
                .context("failed to get created_at")?,
        }))
    }

    async fn create_order(&self, order: NewOrder, key: &str) -> Result<CreateOrderOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let row = sqlx::query(
            r"
            INSERT INTO orders (id, customer_id, status, total_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, customer_id, status, total_amount, created_at, updated_at
            ",
        )
        .bind(order.id)
        .bind(&order.customer_id)
        .bind(OrderStatus::Pending.as_str())
        .bind(order.total_amount)
        .bind(order.created_at)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert order")?;

        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let item_row = sqlx::query(
                r"
                INSERT INTO order_items (order_id, sku, qty)
                VALUES ($1, $2, $3)
                RETURNING id, order_id, sku, qty
                ",
            )
            .bind(order.id)
            .bind(&item.sku)
            .bind(item.qty)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert order item")?;
            items.push(Self::row_to_item(&item_row)?);
        }

        // Loser of a concurrent race on the same key blocks here until the winner commits.
        let bound = sqlx::query(
            r"
            INSERT INTO idempotency_keys (key, order_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO NOTHING
            RETURNING order_id
            ",
        )
        .bind(key)
        .bind(order.id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert idempotency key")?;

        if bound.is_none() {
            tx.rollback()
                .await
                .context("failed to rollback transaction")?;
            let existing = self
                .find_idempotency_key(key)
                .await?
                .ok_or_else(|| anyhow!("idempotency key conflict but no bound order found"))?;
            return Ok(CreateOrderOutcome::Existing(existing.order_id));
        }

        let created = Self::row_to_order(&row, items)?;
        tx.commit().await.context("failed to commit transaction")?;

        Ok(CreateOrderOutcome::Created(created))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(
            r"
            SELECT id, customer_id, status, total_amount, created_at, updated_at
            FROM orders
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch order")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item_rows = sqlx::query(
            r"
            SELECT id, order_id, sku, qty
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch order items")?;

        let items = item_rows
            .iter()
            .map(Self::row_to_item)
            .collect::<Result<Vec<_>>>()?;

        Self::row_to_order(&row, items).map(Some)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        transition: StatusTransition,
    ) -> Result<TransitionOutcome> {
        let updated = sqlx::query(
            r"
            UPDATE orders
            SET status = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING id
            ",
        )
        .bind(id)
        .bind(transition.target().as_str())
        .bind(transition.source().as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to update order status")?;

        if updated.is_some() {
            return Ok(TransitionOutcome::Applied);
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read current order status")?;

        let current = current
            .map(|status| {
                OrderStatus::from_str(&status)
                    .ok_or_else(|| anyhow!("unknown order status in store: {status}"))
            })
            .transpose()?;

        Ok(unapplied_outcome(transition, current))
    }

    async fn insert_enrichment(&self, order_id: Uuid, data: Value) -> Result<EnrichmentInsert> {
        let row = sqlx::query(
            r"
            INSERT INTO order_enrichments (order_id, data, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (order_id) DO NOTHING
            RETURNING id, order_id, data, created_at
            ",
        )
        .bind(order_id)
        .bind(data)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert order enrichment")?;

        match row {
            Some(row) => Ok(EnrichmentInsert::Inserted(Self::row_to_enrichment(&row)?)),
            None => Ok(EnrichmentInsert::AlreadyPresent),
        }
    }

    async fn get_enrichment(&self, order_id: Uuid) -> Result<Option<OrderEnrichment>> {
        let row = sqlx::query(
            r"
            SELECT id, order_id, data, created_at
            FROM order_enrichments
            WHERE order_id = $1
            ",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch order enrichment")?;

        row.as_ref().map(Self::row_to_enrichment).transpose()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("failed to ping order database")?;
        Ok(())
    }
}
