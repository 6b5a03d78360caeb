//! # Validation Module
//!
//! Local checks applied to an order snapshot before it enters the queue.
//!
//! ## Where Validation Runs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Sales flow completes order                                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  validate_order_snapshot ← THIS MODULE (no I/O, never network-bound)   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  OrderQueue::enqueue → pending_orders (SQLite)                         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Backend ingest recomputes totals and is the authority                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Totals are not checked against the lines. The client calculator is a
//! preview only, and a completed sale is always kept.

use crate::error::ValidationError;
use crate::types::OrderSnapshot;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Order Snapshot
// =============================================================================

/// Checks that a completed order can be stored at all.
///
/// Only an order with no lines is refused. Quantities, prices and payment
/// amounts are taken as recorded: refunds carry negative amounts, bulk
/// sales carry large quantities, and the backend decides whether it accepts
/// them. A rejection there marks the order FAILED; it is never lost here.
///
/// ## Example
/// ```rust
/// use harbor_core::types::{OrderItem, OrderSnapshot};
/// use harbor_core::validation::validate_order_snapshot;
///
/// let empty = OrderSnapshot::default();
/// assert!(validate_order_snapshot(&empty).is_err());
///
/// let order = OrderSnapshot {
///     items: vec![OrderItem {
///         product_id: "p-1".into(),
///         name: "Espresso".into(),
///         quantity: 2,
///         unit_price_cents: 250,
///         modifiers: vec![],
///         notes: None,
///     }],
///     ..Default::default()
/// };
/// assert!(validate_order_snapshot(&order).is_ok());
/// ```
pub fn validate_order_snapshot(order: &OrderSnapshot) -> ValidationResult<()> {
    if order.items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a UUID string, e.g. a `local_id` passed in by an operator.
///
/// ## Example
/// ```rust
/// use harbor_core::validation::validate_uuid;
///
/// assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("not-a-uuid").is_err());
/// ```
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
