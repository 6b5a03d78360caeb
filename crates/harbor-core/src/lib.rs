//! # harbor-core: Pure Domain Logic for Harbor POS Sync
//!
//! Types and pure functions shared by the storage and sync layers. Nothing in
//! this crate touches the database, the network or the file system.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Harbor Offline-Resilience Layer                     │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 harbor-agent (headless binary)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   harbor-sync: identity, dataset engine, order queue, scheduler │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   harbor-db: SQLite replica, cursors, queue, credential         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ harbor-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  signing  │  │ hierarchy │  │ validation│  │   │
//! │  │   │  Record   │  │ canonical │  │   waves   │  │   order   │  │   │
//! │  │   │  Order    │  │   HMAC    │  │  orphans  │  │  snapshot │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Dataset keys, record envelope, orders, credentials
//! - [`signing`] - Canonical JSON and HMAC-SHA256 request signatures
//! - [`hierarchy`] - Wave-based insertion planning for tree-shaped datasets
//! - [`validation`] - Order snapshot checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use harbor_core::hierarchy::{plan_hierarchical_insert, StoredParents};
//! use harbor_core::types::Record;
//! use serde_json::json;
//!
//! let batch = vec![
//!     Record::new("2", json!({})).with_parent("1"),
//!     Record::new("1", json!({})),
//! ];
//! let plan = plan_hierarchical_insert(batch, &StoredParents::new());
//! let order: Vec<_> = plan.ordered().map(|r| r.id.as_str()).collect();
//! assert_eq!(order, ["1", "2"]);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod hierarchy;
pub mod signing;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use hierarchy::{
    plan_hierarchical_insert, InsertPlan, StoredParents, UnresolvedReason, UnresolvedRecord,
};
pub use signing::{canonical_json, sign, RequestSigner};
pub use types::*;
