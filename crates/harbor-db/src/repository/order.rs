//! # Pending Order Repository
//!
//! Durable queue of orders completed on the terminal, online or not.
//!
//! ## The Queue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SALES FLOW (never waits on the network)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO pending_orders (local_id, payload, status='PENDING')      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            FLUSH (sync cycle, after dataset sync)               │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT ... WHERE status = 'PENDING'                         │   │
//! │  │       OR (status = 'FAILED' AND retry_count < max) ORDER BY seq │   │
//! │  │                                                                 │   │
//! │  │  2. For each order, one delivery attempt:                      │   │
//! │  │     SUCCESS   → mark_synced    (server ids stored)             │   │
//! │  │     CONFLICT  → mark_conflict  (operator review, no auto-retry)│   │
//! │  │     ERROR/4xx → mark_failed    (retry_count += 1)              │   │
//! │  │     network   → record_retry   (status kept, retry_count += 1) │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • local_id is unique and never reassigned                             │
//! │  • seq preserves creation order                                        │
//! │  • PENDING rows are always eligible; the cap applies to FAILED only    │
//! │  • only SYNCED rows are ever deleted (retention sweep)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use ts_rs::TS;

use crate::error::{DbError, DbResult};
use harbor_core::{OrderStatus, PendingOrder};

#[derive(Debug, FromRow)]
struct PendingOrderRow {
    local_id: String,
    payload: String,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    retry_count: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    server_order_id: Option<String>,
    server_order_number: Option<String>,
    conflict_reason: Option<String>,
    synced_at: Option<DateTime<Utc>>,
}

impl TryFrom<PendingOrderRow> for PendingOrder {
    type Error = DbError;

    fn try_from(row: PendingOrderRow) -> DbResult<Self> {
        Ok(PendingOrder {
            local_id: row.local_id,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status,
            created_at: row.created_at,
            retry_count: row.retry_count,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
            server_order_id: row.server_order_id,
            server_order_number: row.server_order_number,
            conflict_reason: row.conflict_reason,
            synced_at: row.synced_at,
        })
    }
}

const SELECT_ORDER: &str = r#"
    SELECT
        local_id, payload, status, created_at, retry_count,
        last_attempt_at, last_error, server_order_id, server_order_number,
        conflict_reason, synced_at
    FROM pending_orders
"#;

/// Number of queued orders in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
    pub conflict: i64,
    pub synced: i64,
}

impl QueueCounts {
    /// Orders still waiting for delivery (PENDING + FAILED).
    pub fn depth(&self) -> i64 {
        self.pending + self.failed
    }

    pub fn total(&self) -> i64 {
        self.pending + self.failed + self.conflict + self.synced
    }
}

/// Repository for the pending order queue.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Appends an order to the queue.
    pub async fn insert(&self, order: &PendingOrder) -> DbResult<()> {
        debug!(local_id = %order.local_id, "Queuing order");

        let payload = serde_json::to_string(&order.payload)?;

        sqlx::query(
            r#"
            INSERT INTO pending_orders (
                local_id, payload, status, created_at, retry_count,
                last_attempt_at, last_error, server_order_id, server_order_number,
                conflict_reason, synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&order.local_id)
        .bind(payload)
        .bind(order.status)
        .bind(order.created_at)
        .bind(order.retry_count)
        .bind(order.last_attempt_at)
        .bind(&order.last_error)
        .bind(&order.server_order_id)
        .bind(&order.server_order_number)
        .bind(&order.conflict_reason)
        .bind(order.synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: order.local_id.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    /// Gets an order by `local_id`.
    pub async fn get(&self, local_id: &str) -> DbResult<Option<PendingOrder>> {
        let row: Option<PendingOrderRow> =
            sqlx::query_as(&format!("{SELECT_ORDER} WHERE local_id = ?1"))
                .bind(local_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(PendingOrder::try_from).transpose()
    }

    /// Orders eligible for automatic delivery, oldest first.
    ///
    /// Every PENDING order, however many transient failures it has seen, plus
    /// FAILED orders whose `retry_count` is below `max_attempts`.
    pub async fn next_batch(&self, max_attempts: i64, limit: u32) -> DbResult<Vec<PendingOrder>> {
        let rows: Vec<PendingOrderRow> = sqlx::query_as(&format!(
            "{SELECT_ORDER}
            WHERE status = 'PENDING'
               OR (status = 'FAILED' AND retry_count < ?1)
            ORDER BY seq ASC
            LIMIT ?2"
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingOrder::try_from).collect()
    }

    /// Every order in `status`, oldest first.
    pub async fn list_by_status(&self, status: OrderStatus) -> DbResult<Vec<PendingOrder>> {
        let rows: Vec<PendingOrderRow> = sqlx::query_as(&format!(
            "{SELECT_ORDER} WHERE status = ?1 ORDER BY seq ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingOrder::try_from).collect()
    }

    /// Records a successful (or duplicate-acknowledged) delivery.
    pub async fn mark_synced(
        &self,
        local_id: &str,
        server_order_id: Option<&str>,
        server_order_number: Option<&str>,
        at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders SET
                status = 'SYNCED',
                server_order_id = ?2,
                server_order_number = ?3,
                last_attempt_at = ?4,
                synced_at = ?4,
                last_error = NULL,
                conflict_reason = NULL
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id)
        .bind(server_order_id)
        .bind(server_order_number)
        .bind(at)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), local_id)
    }

    /// Parks an order for operator review.
    pub async fn mark_conflict(&self, local_id: &str, reason: &str, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders SET
                status = 'CONFLICT',
                conflict_reason = ?2,
                last_attempt_at = ?3
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), local_id)
    }

    /// Records a rejected delivery (server validation error or 4xx).
    pub async fn mark_failed(&self, local_id: &str, error: &str, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders SET
                status = 'FAILED',
                retry_count = retry_count + 1,
                last_error = ?2,
                last_attempt_at = ?3
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), local_id)
    }

    /// Records a transient failure; the status is left unchanged.
    pub async fn record_retry(&self, local_id: &str, error: &str, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders SET
                retry_count = retry_count + 1,
                last_error = ?2,
                last_attempt_at = ?3
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;

        expect_row(result.rows_affected(), local_id)
    }

    /// Moves a FAILED or CONFLICT order back to PENDING with a fresh retry
    /// budget. Returns false if the order is already SYNCED.
    pub async fn requeue(&self, local_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders SET
                status = 'PENDING',
                retry_count = 0,
                conflict_reason = NULL,
                last_error = NULL
            WHERE local_id = ?1 AND status != 'SYNCED'
            "#,
        )
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(local_id = %local_id, "Order requeued by operator");
            return Ok(true);
        }
        match self.get(local_id).await? {
            Some(_) => Ok(false),
            None => Err(DbError::not_found("PendingOrder", local_id)),
        }
    }

    /// Counts orders by status.
    pub async fn counts(&self) -> DbResult<QueueCounts> {
        let rows: Vec<(OrderStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM pending_orders GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            match status {
                OrderStatus::Pending => counts.pending = n,
                OrderStatus::Failed => counts.failed = n,
                OrderStatus::Conflict => counts.conflict = n,
                OrderStatus::Synced => counts.synced = n,
            }
        }
        Ok(counts)
    }

    /// Deletes SYNCED orders synced before `cutoff`. Returns rows removed.
    pub async fn sweep_synced(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_orders
            WHERE status = 'SYNCED'
            AND synced_at IS NOT NULL
            AND synced_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn expect_row(rows_affected: u64, local_id: &str) -> DbResult<()> {
    if rows_affected == 0 {
        return Err(DbError::not_found("PendingOrder", local_id));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
