//! # Repository Module
//!
//! Repository implementations for the local replica.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  harbor-sync                                                           │
//! │       │                                                                 │
//! │       │  db.datasets().apply_sync(key, batch, now)                     │
//! │       ▼                                                                 │
//! │  DatasetStore / VersionRepository / OrderRepository /                  │
//! │  CredentialRepository                                                  │
//! │       │                                                                 │
//! │       │  SQL (one transaction per batch)                                │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`DatasetStore`](dataset::DatasetStore) - Replicated records, hierarchical insert
//! - [`VersionRepository`](version::VersionRepository) - Per-dataset cursors
//! - [`OrderRepository`](order::OrderRepository) - Pending order queue
//! - [`CredentialRepository`](credential::CredentialRepository) - Device credential cache

pub mod credential;
pub mod dataset;
pub mod order;
pub mod version;
