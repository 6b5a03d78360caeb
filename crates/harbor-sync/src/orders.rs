//! # Order Queue
//!
//! Durable queue of completed orders and their delivery to the backend.
//!
//! ## Flush
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  versions = snapshot of dataset cursors (taken after dataset sync)     │
//! │                                                                         │
//! │  for order in next_batch() (oldest first):                             │
//! │     op = IngestOperation { fresh operation_id, nonce, created_at,      │
//! │                            same local_id, versions }                   │
//! │     POST /sync/offline-orders/ (signed)                                │
//! │        SUCCESS ─────────────► SYNCED    (server ids stored)            │
//! │        CONFLICT / 409 ──────► CONFLICT  (reason stored, no auto-retry) │
//! │        ERROR / other 4xx ───► FAILED    (retry_count += 1)             │
//! │        network / 5xx ───────► PENDING   (retry_count += 1), stop       │
//! │        401 / 403 ───────────► unchanged, stop                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A transient failure stops the flush so later orders never overtake an
//! earlier one. PENDING orders have no attempt cap: an outage of any length
//! ends with every one of them delivered, oldest first. `max_order_attempts`
//! only limits automatic retries of FAILED (rejected) orders.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use harbor_core::{
    validation::{validate_order_snapshot, validate_uuid}, IngestOperation, OrderSnapshot, OrderStatus,
    PendingOrder,
};
use harbor_db::{OrderRepository, QueueCounts, VersionRepository};

use crate::client::{Clock, SyncBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceSession;
use crate::protocol::IngestStatus;

/// Result of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Orders left PENDING after a transient error.
    pub retrying: usize,
    /// One `OrderConflict` per order moved to CONFLICT.
    pub conflicts: Vec<SyncError>,
    /// Why the flush stopped early, if it did.
    pub stopped_by: Option<SyncError>,
}

impl FlushReport {
    /// True when every attempted order got a definitive answer.
    pub fn is_clean(&self) -> bool {
        self.stopped_by.is_none()
    }
}

/// Durable order queue.
pub struct OrderQueue {
    backend: Arc<dyn SyncBackend>,
    orders: OrderRepository,
    versions: VersionRepository,
    clock: Arc<dyn Clock>,
    max_attempts: i64,
    batch_size: u32,
}

impl OrderQueue {
    pub fn new(
        config: &SyncConfig,
        backend: Arc<dyn SyncBackend>,
        orders: OrderRepository,
        versions: VersionRepository,
        clock: Arc<dyn Clock>,
    ) -> Self {
        OrderQueue {
            backend,
            orders,
            versions,
            clock,
            max_attempts: i64::from(config.sync.max_order_attempts),
            batch_size: config.sync.order_batch_size,
        }
    }

    // =========================================================================
    // Sales Flow
    // =========================================================================

    /// Queues a completed order. Never touches the network.
    ///
    /// Amounts and quantities are stored as recorded; only an order with no
    /// lines is refused.
    pub async fn enqueue(&self, snapshot: OrderSnapshot) -> SyncResult<PendingOrder> {
        validate_order_snapshot(&snapshot)?;

        let order = PendingOrder::new(snapshot, self.clock.now());
        self.orders.insert(&order).await?;

        info!(
            local_id = %order.local_id,
            items = order.payload.items.len(),
            total_cents = order.payload.total_cents,
            "Order queued"
        );
        Ok(order)
    }

    /// Builds the ingest operation an attempt would send, without sending.
    pub async fn build_operation(
        &self,
        session: &DeviceSession,
        order: &PendingOrder,
    ) -> SyncResult<IngestOperation> {
        let versions = self.versions.snapshot().await?;
        Ok(IngestOperation::new(
            order,
            session.device_id(),
            versions,
            self.clock.now(),
        ))
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Delivers eligible orders, oldest first.
    ///
    /// Storage errors abort the flush; delivery outcomes are recorded per
    /// order and summarized in the report.
    pub async fn flush(&self, session: &DeviceSession) -> SyncResult<FlushReport> {
        let batch = self
            .orders
            .next_batch(self.max_attempts, self.batch_size)
            .await?;
        let mut report = FlushReport::default();

        if batch.is_empty() {
            debug!("No orders to flush");
            return Ok(report);
        }

        let versions = self.versions.snapshot().await?;
        info!(count = batch.len(), "Flushing queued orders");

        for order in batch {
            let operation = IngestOperation::new(
                &order,
                session.device_id(),
                versions.clone(),
                self.clock.now(),
            );
            report.attempted += 1;

            let result = self.backend.submit_order(session, &operation).await;
            let now = self.clock.now();

            match result {
                Ok(response) => match response.status {
                    IngestStatus::Success => {
                        self.orders
                            .mark_synced(
                                &order.local_id,
                                response.order_id.as_deref(),
                                response.order_number.as_deref(),
                                now,
                            )
                            .await?;
                        report.synced += 1;
                        info!(
                            local_id = %order.local_id,
                            order_id = ?response.order_id,
                            duplicate = response.duplicate,
                            "Order delivered"
                        );
                    }
                    IngestStatus::Conflict => {
                        let reason = response.conflict_reason();
                        self.orders
                            .mark_conflict(&order.local_id, &reason, now)
                            .await?;
                        warn!(local_id = %order.local_id, reason = %reason, "Order conflict");
                        report.conflicts.push(SyncError::OrderConflict {
                            local_id: order.local_id.clone(),
                            reason,
                        });
                    }
                    IngestStatus::Error => {
                        let summary = response.error_summary();
                        self.orders
                            .mark_failed(&order.local_id, &summary, now)
                            .await?;
                        report.failed += 1;
                        warn!(local_id = %order.local_id, error = %summary, "Order rejected");
                    }
                },
                Err(e) if e.is_authentication() => {
                    warn!(local_id = %order.local_id, error = %e, "Flush stopped: device rejected");
                    report.stopped_by = Some(e);
                    break;
                }
                Err(e) if e.is_transient() => {
                    self.orders
                        .record_retry(&order.local_id, &e.to_string(), now)
                        .await?;
                    report.retrying += 1;
                    warn!(
                        local_id = %order.local_id,
                        attempt = order.retry_count + 1,
                        error = %e,
                        "Order delivery failed, will retry"
                    );
                    report.stopped_by = Some(e);
                    break;
                }
                Err(e) => {
                    self.orders
                        .mark_failed(&order.local_id, &e.to_string(), now)
                        .await?;
                    report.failed += 1;
                    warn!(local_id = %order.local_id, error = %e, "Order delivery failed");
                }
            }
        }

        Ok(report)
    }

    // =========================================================================
    // Operator Surface
    // =========================================================================

    pub async fn get(&self, local_id: &str) -> SyncResult<Option<PendingOrder>> {
        Ok(self.orders.get(local_id).await?)
    }

    pub async fn list_by_status(&self, status: OrderStatus) -> SyncResult<Vec<PendingOrder>> {
        Ok(self.orders.list_by_status(status).await?)
    }

    pub async fn queue_counts(&self) -> SyncResult<QueueCounts> {
        Ok(self.orders.counts().await?)
    }

    /// Moves a CONFLICT or FAILED order back to PENDING with a fresh retry
    /// budget. Returns false for an order that is already SYNCED.
    pub async fn requeue(&self, local_id: &str) -> SyncResult<bool> {
        validate_uuid(local_id)?;
        Ok(self.orders.requeue(local_id).await?)
    }

    /// Deletes SYNCED orders older than `retention_days`. Zero keeps them.
    pub async fn sweep_synced(&self, retention_days: u32) -> SyncResult<u64> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        Ok(self.orders.sweep_synced(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IngestConflict, IngestResponse};
    use crate::testing::{
        database, offline, order_snapshot as snapshot, session, success, FakeBackend, FixedClock,
    };

    fn queue(backend: Arc<FakeBackend>, db: &harbor_db::Database) -> OrderQueue {
        queue_with(backend, db, Arc::new(FixedClock::new()))
    }

    fn queue_with(
        backend: Arc<FakeBackend>,
        db: &harbor_db::Database,
        clock: Arc<FixedClock>,
    ) -> OrderQueue {
        let mut config = SyncConfig::default();
        config.sync.max_order_attempts = 3;
        OrderQueue::new(&config, backend, db.orders(), db.versions(), clock)
    }

    fn conflict(message: &str) -> IngestResponse {
        IngestResponse {
            status: IngestStatus::Conflict,
            order_id: None,
            order_number: None,
            duplicate: false,
            conflicts: vec![IngestConflict {
                message: message.into(),
            }],
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_local_and_validated() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        let queue = queue(backend.clone(), &db);

        let order = queue.enqueue(snapshot("p1")).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(backend.calls(), 0);
        assert_eq!(queue.get(&order.local_id).await.unwrap().unwrap(), order);

        let err = queue.enqueue(OrderSnapshot::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Core(_)));
        assert_eq!(queue.queue_counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_restart_then_flush_delivers_once() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        let session = session();
        db.versions()
            .set(harbor_core::DatasetKey::Products, "p7", chrono::Utc::now())
            .await
            .unwrap();

        let order = queue(backend.clone(), &db)
            .enqueue(snapshot("p1"))
            .await
            .unwrap();
        let dry_run = queue(backend.clone(), &db)
            .build_operation(&session, &order)
            .await
            .unwrap();

        // A new queue over the same database stands in for a restart.
        let restarted = queue(backend.clone(), &db);
        let report = restarted.flush(&session).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(restarted.flush(&session).await.unwrap().attempted == 0);

        let sent = backend.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].order.local_id, order.local_id);
        assert_ne!(sent[0].operation_id, dry_run.operation_id);
        assert_ne!(sent[0].nonce, dry_run.nonce);
        assert_eq!(sent[0].dataset_versions["products"], "p7");

        let stored = restarted.get(&order.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Synced);
        assert_eq!(stored.server_order_id.as_deref(), Some(order.local_id.as_str()));
    }

    #[tokio::test]
    async fn test_conflict_is_terminal() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        backend.push_ingest(Ok(conflict("catalog version too old")));
        let queue = queue(backend.clone(), &db);
        let session = session();

        let order = queue.enqueue(snapshot("p1")).await.unwrap();
        let report = queue.flush(&session).await.unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.conflicts[0].is_conflict());

        let stored = queue.get(&order.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Conflict);
        assert_eq!(stored.conflict_reason.as_deref(), Some("catalog version too old"));

        let again = queue.flush(&session).await.unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(backend.submitted().len(), 1);
        assert_eq!(queue.list_by_status(OrderStatus::Conflict).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_keeps_order_pending_and_stops() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        backend.push_ingest(Err(offline()));
        let queue = queue(backend.clone(), &db);
        let session = session();

        let first = queue.enqueue(snapshot("p1")).await.unwrap();
        let second = queue.enqueue(snapshot("p2")).await.unwrap();

        let report = queue.flush(&session).await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(report.stopped_by.as_ref().unwrap().is_transient());
        assert_eq!(backend.submitted().len(), 1);

        let stored = queue.get(&first.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.retry_count, 1);

        // Next flush retries in creation order.
        let report = queue.flush(&session).await.unwrap();
        assert_eq!(report.synced, 2);
        let sent: Vec<String> = backend
            .submitted()
            .iter()
            .map(|op| op.order.local_id.clone())
            .collect();
        assert_eq!(sent, vec![first.local_id.clone(), first.local_id, second.local_id]);
    }

    #[tokio::test]
    async fn test_refund_and_bulk_orders_are_queued() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        let queue = queue(backend.clone(), &db);

        let mut bulk = snapshot("p1");
        bulk.items[0].quantity = 1000;
        let mut refund = snapshot("p2");
        refund.items[0].quantity = -2;
        refund.payments[0].amount_cents = -900;
        refund.total_cents = -900;

        let bulk = queue.enqueue(bulk).await.unwrap();
        let refund = queue.enqueue(refund).await.unwrap();
        assert_eq!(queue.queue_counts().await.unwrap().pending, 2);
        assert_eq!(backend.calls(), 0);

        queue.flush(&session()).await.unwrap();
        let sent = backend.submitted();
        assert_eq!(sent[0].order.local_id, bulk.local_id);
        assert_eq!(sent[1].order.local_id, refund.local_id);
        assert_eq!(sent[0].order.items[0].quantity, 1000);
        assert_eq!(sent[1].payments[0].amount_cents, -900);
    }

    #[tokio::test]
    async fn test_outage_longer_than_attempt_cap_then_recovery() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        // Cap is 3; the outage lasts 5 flushes.
        for _ in 0..5 {
            backend.push_ingest(Err(offline()));
        }
        let queue = queue(backend.clone(), &db);
        let session = session();

        let first = queue.enqueue(snapshot("p1")).await.unwrap();
        let second = queue.enqueue(snapshot("p2")).await.unwrap();

        for _ in 0..5 {
            let report = queue.flush(&session).await.unwrap();
            assert_eq!(report.attempted, 1);
            assert_eq!(report.retrying, 1);
        }
        let stored = queue.get(&first.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.retry_count, 5);

        // Connectivity is back.
        let report = queue.flush(&session).await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(report.is_clean());

        let sent: Vec<String> = backend
            .submitted()
            .iter()
            .map(|op| op.order.local_id.clone())
            .collect();
        assert_eq!(sent.len(), 7);
        assert_eq!(sent[5], first.local_id);
        assert_eq!(sent[6], second.local_id);
        assert!(!sent[..5].contains(&second.local_id));

        for id in [&first.local_id, &second.local_id] {
            let stored = queue.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, OrderStatus::Synced);
        }
    }

    #[tokio::test]
    async fn test_rejection_marks_failed_and_continues() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        backend.push_ingest(Err(SyncError::from_status(422, "bad payload")));
        backend.push_ingest(Ok(success("srv-2")));
        let queue = queue(backend, &db);

        let first = queue.enqueue(snapshot("p1")).await.unwrap();
        queue.enqueue(snapshot("p2")).await.unwrap();

        let report = queue.flush(&session()).await.unwrap();
        assert_eq!((report.failed, report.synced), (1, 1));

        let stored = queue.get(&first.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.unwrap().contains("bad payload"));
    }

    #[tokio::test]
    async fn test_failed_orders_retry_until_cap() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        for _ in 0..3 {
            backend.push_ingest(Ok(IngestResponse {
                status: IngestStatus::Error,
                order_id: None,
                order_number: None,
                duplicate: false,
                conflicts: Vec::new(),
                errors: vec![serde_json::json!("total mismatch")],
            }));
        }
        let queue = queue(backend.clone(), &db);
        let session = session();
        let order = queue.enqueue(snapshot("p1")).await.unwrap();

        for _ in 0..5 {
            queue.flush(&session).await.unwrap();
        }
        assert_eq!(backend.submitted().len(), 3);

        // Operator requeue restores the budget.
        assert!(queue.requeue("not-an-id").await.is_err());
        assert!(queue.requeue(&order.local_id).await.unwrap());
        queue.flush(&session).await.unwrap();
        let stored = queue.get(&order.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Synced);
    }

    #[tokio::test]
    async fn test_authentication_failure_stops_without_consuming_retries() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        backend.push_ingest(Err(SyncError::Unauthorized { status: 401 }));
        let queue = queue(backend.clone(), &db);

        let order = queue.enqueue(snapshot("p1")).await.unwrap();
        queue.enqueue(snapshot("p2")).await.unwrap();

        let report = queue.flush(&session()).await.unwrap();
        assert!(report.stopped_by.unwrap().is_authentication());
        assert_eq!(backend.submitted().len(), 1);

        let stored = queue.get(&order.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_synced_respects_retention() {
        let db = database().await;
        let backend = Arc::new(FakeBackend::new());
        let clock = Arc::new(FixedClock::new());
        let queue = queue_with(backend, &db, clock.clone());

        let old = queue.enqueue(snapshot("p1")).await.unwrap();
        queue.flush(&session()).await.unwrap();
        let open = queue.enqueue(snapshot("p2")).await.unwrap();

        clock.advance(chrono::Duration::days(10));
        assert_eq!(queue.sweep_synced(30).await.unwrap(), 0);
        assert_eq!(queue.sweep_synced(0).await.unwrap(), 0);
        assert_eq!(queue.sweep_synced(7).await.unwrap(), 1);

        assert!(queue.get(&old.local_id).await.unwrap().is_none());
        assert!(queue.get(&open.local_id).await.unwrap().is_some());
    }
}
