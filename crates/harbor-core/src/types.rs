//! # Domain Types
//!
//! Core domain types shared by the storage and sync layers.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   DatasetKey    │   │     Record      │   │ DatasetVersion  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  users          │   │  id             │   │  dataset_key    │       │
//! │  │  taxes          │   │  parent_id?     │   │  version_token  │       │
//! │  │  categories     │   │  payload (JSON) │   │  synced_at      │       │
//! │  │  products ...   │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  PendingOrder   │   │ IngestOperation │   │DeviceCredential │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  local_id       │──►│  operation_id   │   │  device_id      │       │
//! │  │  payload        │   │  nonce          │   │  location_id    │       │
//! │  │  status         │   │  created_at     │   │  signing_secret │       │
//! │  │  retry_count    │   │  order{local_id}│   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Rules
//! - `local_id` is generated once at enqueue time and never reused.
//! - `operation_id` and `nonce` are regenerated for every delivery attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Dataset Key
// =============================================================================

/// The server-owned datasets replicated onto the terminal.
///
/// ## Sync Order
/// ```text
/// users ─► taxes ─► categories ─► products ─► inventory ─► [order flush] ─► settings
///                        ▲             │           ▲            │
///                        └─ parent ────┘           └─ product ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKey {
    Users,
    Taxes,
    Categories,
    Products,
    Inventory,
    Settings,
}

impl DatasetKey {
    /// Datasets pulled before the order flush, in dependency order.
    pub const REFERENCE_ORDER: [DatasetKey; 5] = [
        DatasetKey::Users,
        DatasetKey::Taxes,
        DatasetKey::Categories,
        DatasetKey::Products,
        DatasetKey::Inventory,
    ];

    /// Every dataset, in the order a full cycle touches them.
    pub const ALL: [DatasetKey; 6] = [
        DatasetKey::Users,
        DatasetKey::Taxes,
        DatasetKey::Categories,
        DatasetKey::Products,
        DatasetKey::Inventory,
        DatasetKey::Settings,
    ];

    /// Stable name used for storage keys and endpoints.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DatasetKey::Users => "users",
            DatasetKey::Taxes => "taxes",
            DatasetKey::Categories => "categories",
            DatasetKey::Products => "products",
            DatasetKey::Inventory => "inventory",
            DatasetKey::Settings => "settings",
        }
    }

    /// Backend path for this dataset's sync endpoint.
    pub fn endpoint(&self) -> String {
        format!("/sync/{}/", self.as_str())
    }

    /// Field of a backend item that references another record.
    ///
    /// Categories reference their parent category; products reference the
    /// category they belong to.
    pub const fn reference_field(&self) -> Option<&'static str> {
        match self {
            DatasetKey::Categories => Some("parent_id"),
            DatasetKey::Products => Some("category_id"),
            _ => None,
        }
    }

    /// Returns true for tree-shaped datasets that need wave insertion.
    pub const fn is_hierarchical(&self) -> bool {
        matches!(self, DatasetKey::Categories)
    }

    /// Datasets that must have synced in the same pass before this one runs.
    pub const fn depends_on(&self) -> &'static [DatasetKey] {
        match self {
            DatasetKey::Products => &[DatasetKey::Categories],
            DatasetKey::Inventory => &[DatasetKey::Products],
            _ => &[],
        }
    }

    /// Datasets holding references into this one.
    ///
    /// A destructive replace of this dataset clears these first.
    pub const fn structural_dependents(&self) -> &'static [DatasetKey] {
        match self {
            DatasetKey::Categories => &[DatasetKey::Products],
            _ => &[],
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| CoreError::UnknownDataset(s.to_string()))
    }
}

// =============================================================================
// Record Envelope
// =============================================================================

/// A replicated record: stable identifier, optional parent reference and the
/// opaque payload exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Record {
    /// Identifier, unique within its dataset.
    pub id: String,

    /// Weak reference into the same dataset (categories) or the parent
    /// dataset (products → categories).
    pub parent_id: Option<String>,

    /// Full backend payload.
    #[ts(type = "unknown")]
    pub payload: Value,
}

impl Record {
    /// Creates a record without a parent reference.
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Record {
            id: id.into(),
            parent_id: None,
            payload,
        }
    }

    /// Sets the parent reference.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Builds an envelope from a backend item.
    ///
    /// `id` may be a string or an integer; both are normalized to a string.
    /// The reference field is read only for datasets that declare one.
    pub fn from_backend(dataset: DatasetKey, item: Value) -> CoreResult<Self> {
        let id = item
            .get("id")
            .and_then(id_from_value)
            .ok_or_else(|| CoreError::MalformedRecord {
                dataset: dataset.to_string(),
                reason: "missing or empty id".to_string(),
            })?;

        let parent_id = dataset
            .reference_field()
            .and_then(|field| item.get(field))
            .and_then(id_from_value);

        Ok(Record {
            id,
            parent_id,
            payload: item,
        })
    }
}

/// Normalizes a JSON identifier (string or integer) into a string.
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Dataset Version
// =============================================================================

/// How far a dataset's change history has been applied locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DatasetVersion {
    pub dataset_key: DatasetKey,
    /// Opaque token returned by the backend as `next_version`.
    pub version_token: String,
    #[ts(as = "String")]
    pub synced_at: DateTime<Utc>,
}

// =============================================================================
// Order Snapshot
// =============================================================================

/// Full order snapshot captured at completion time.
///
/// Monetary totals come from the client-side calculator and are informational;
/// the backend recomputes them on ingest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderSnapshot {
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub adjustments: Vec<OrderAdjustment>,
    #[serde(default)]
    pub discounts: Vec<OrderDiscount>,
    #[serde(default)]
    pub payments: Vec<OrderPayment>,
    #[serde(default)]
    pub subtotal_cents: i64,
    #[serde(default)]
    pub tax_cents: i64,
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default)]
    pub total_cents: i64,
    #[serde(default)]
    pub cashier_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A line in the order. Name and price are frozen at time of sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub modifiers: Vec<OrderItemModifier>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderItemModifier {
    pub modifier_id: String,
    pub name: String,
    pub price_delta_cents: i64,
}

/// Manual adjustment (service charge, rounding, tip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderAdjustment {
    pub kind: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderDiscount {
    #[serde(default)]
    pub discount_id: Option<String>,
    pub name: String,
    pub amount_cents: i64,
    /// Index into `items` for line discounts; `None` for order-level.
    #[serde(default)]
    pub line_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderPayment {
    pub method: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub tendered_cents: Option<i64>,
    #[serde(default)]
    pub change_cents: Option<i64>,
    #[serde(default)]
    pub reference: Option<String>,
}

// =============================================================================
// Order Status
// =============================================================================

/// Delivery state of a queued order.
///
/// ```text
///            flush: SUCCESS
///  PENDING ─────────────────► SYNCED
///    │  ▲
///    │  │ transient error (retry_count += 1)
///    │  └──────┐
///    │ ERROR   │      flush: CONFLICT
///    ├──────► FAILED ─────────────────► CONFLICT (operator review)
///    └────────────────────────────────►
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Synced,
    Failed,
    Conflict,
}

impl OrderStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Synced => "SYNCED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Conflict => "CONFLICT",
        }
    }

    /// Returns true if the scheduler may pick this order up on its own.
    pub const fn is_auto_retryable(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Failed)
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Pending
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Pending Order
// =============================================================================

/// An order waiting for (or done with) delivery to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PendingOrder {
    /// Durable idempotency anchor.
    pub local_id: String,
    pub payload: OrderSnapshot,
    pub status: OrderStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub server_order_id: Option<String>,
    pub server_order_number: Option<String>,
    pub conflict_reason: Option<String>,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl PendingOrder {
    /// Creates a fresh PENDING order with a newly minted `local_id`.
    pub fn new(payload: OrderSnapshot, created_at: DateTime<Utc>) -> Self {
        PendingOrder {
            local_id: Uuid::new_v4().to_string(),
            payload,
            status: OrderStatus::Pending,
            created_at,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            server_order_id: None,
            server_order_number: None,
            conflict_reason: None,
            synced_at: None,
        }
    }
}

// =============================================================================
// Device Credential
// =============================================================================

/// Credential issued when pairing completes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub device_id: String,
    pub tenant_id: String,
    pub tenant_slug: String,
    pub location_id: String,
    /// Hex-encoded HMAC key. Never logged.
    pub signing_secret: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("device_id", &self.device_id)
            .field("tenant_id", &self.tenant_id)
            .field("tenant_slug", &self.tenant_slug)
            .field("location_id", &self.location_id)
            .field("signing_secret", &"<redacted>")
            .field("nickname", &self.nickname)
            .finish()
    }
}

// =============================================================================
// Ingest Operation
// =============================================================================

/// The order section of an ingest request. Carries `local_id` so the backend
/// can recognize retried deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOrder {
    pub local_id: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
    pub adjustments: Vec<OrderAdjustment>,
    pub discounts: Vec<OrderDiscount>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub cashier_id: Option<String>,
    pub notes: Option<String>,
}

/// One delivery attempt of a queued order. Built per attempt, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOperation {
    /// Fresh per attempt.
    pub operation_id: String,
    pub device_id: String,
    /// Fresh per attempt.
    pub nonce: String,
    /// Fresh per attempt.
    pub created_at: DateTime<Utc>,
    /// dataset key → version token at the time of the attempt.
    pub dataset_versions: BTreeMap<String, String>,
    pub order: IngestOrder,
    pub payments: Vec<OrderPayment>,
}

impl IngestOperation {
    /// Builds a new attempt for `order`.
    pub fn new(
        order: &PendingOrder,
        device_id: &str,
        dataset_versions: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        let snapshot = &order.payload;

        IngestOperation {
            operation_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            nonce: Uuid::new_v4().to_string(),
            created_at: now,
            dataset_versions,
            order: IngestOrder {
                local_id: order.local_id.clone(),
                created_at: order.created_at,
                items: snapshot.items.clone(),
                adjustments: snapshot.adjustments.clone(),
                discounts: snapshot.discounts.clone(),
                subtotal_cents: snapshot.subtotal_cents,
                tax_cents: snapshot.tax_cents,
                discount_cents: snapshot.discount_cents,
                total_cents: snapshot.total_cents,
                cashier_id: snapshot.cashier_id.clone(),
                notes: snapshot.notes.clone(),
            },
            payments: snapshot.payments.clone(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
