//! # harbor-db: Local Replica Storage for Harbor POS
//!
//! SQLite storage for everything the terminal must remember across restarts:
//! replicated datasets, their version cursors, the pending order queue and
//! the device credential.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harbor Data Flow                                 │
//! │                                                                         │
//! │  harbor-sync (single writer)          UI / calculator (readers)        │
//! │       │                                     │                           │
//! │       ▼                                     ▼                           │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     harbor-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ DatasetStore  │    │ 001_initial  │  │   │
//! │  │   │ SqlitePool    │◄───│ Versions      │    │              │  │   │
//! │  │   │ WAL, FKs on   │    │ Orders        │    │              │  │   │
//! │  │   │               │    │ Credentials   │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ~/.local/share/pos/harbor.db                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("harbor.db")).await?;
//! let categories = db.datasets().list(DatasetKey::Categories).await?;
//! let depth = db.orders().counts().await?.depth();
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::credential::{CredentialRepository, StoredCredential};
pub use repository::dataset::{ApplyReport, DatasetStore, SyncBatch, SyncMode};
pub use repository::order::{OrderRepository, QueueCounts};
pub use repository::version::VersionRepository;
