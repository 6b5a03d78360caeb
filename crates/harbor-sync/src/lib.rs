//! # harbor-sync: Offline Sync Engine for Harbor POS
//!
//! Keeps the local replica in step with the backend and delivers orders that
//! were completed while the terminal was offline. Sales never wait on this
//! crate: orders are queued locally and flushed by the scheduler.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncScheduler (orchestrator)                   │  │
//! │  │                                                                  │  │
//! │  │  Timer + online probe, one cycle at a time, failure backoff      │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ DeviceIdentity │  │ DatasetSync    │  │ OrderQueue             │    │
//! │  │ Manager        │  │ Engine         │  │                        │    │
//! │  │                │  │                │  │ enqueue (local only)   │    │
//! │  │ fingerprint,   │  │ cursors,       │  │ flush in creation      │    │
//! │  │ pairing,       │  │ full / delta,  │  │ order, outcome         │    │
//! │  │ signed session │  │ dependents     │  │ mapping                │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │         │                     │                     │                   │
//! │         └─────────────────────┼─────────────────────┘                  │
//! │                               ▼                                         │
//! │                 SyncBackend (HttpBackend / fakes)                       │
//! │                 harbor-db (replica, cursors, queue)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - Backend, probe and clock seams with reqwest implementations
//! - [`config`] - Sync configuration (TOML file + `HARBOR_*` overrides)
//! - [`datasets`] - Dataset pull and replica apply
//! - [`error`] - Sync error types and classification
//! - [`identity`] - Device fingerprint, pairing and signed sessions
//! - [`orders`] - Durable order queue and flush
//! - [`protocol`] - Wire types for the backend endpoints
//! - [`scheduler`] - Cycle orchestration and status
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_sync::{SyncConfig, SyncScheduler};
//!
//! let config = SyncConfig::load_or_default(None);
//! // ... build identity, engine and queue over a harbor_db::Database
//! let scheduler = SyncScheduler::new(&config, identity, engine, queue, db.versions(), probe, clock);
//!
//! scheduler.force_sync().await;
//! let status = scheduler.status().await?;
//! println!("Queued orders: {}", status.queue.depth());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod datasets;
pub mod error;
pub mod identity;
pub mod orders;
pub mod protocol;
pub mod scheduler;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{Clock, ConnectivityProbe, HttpBackend, HttpProbe, SyncBackend, SystemClock};
pub use config::SyncConfig;
pub use datasets::{DatasetOutcome, DatasetSummary, DatasetSyncEngine, PassReport};
pub use error::{SyncError, SyncResult};
pub use identity::{
    DeviceIdentityManager, DeviceSession, FingerprintSource, HostFingerprint, IdentityState,
};
pub use orders::{FlushReport, OrderQueue};
pub use protocol::DeviceAuthorization;
pub use scheduler::{
    CycleOutcome, CycleReport, NoOpObserver, RunExit, SyncObserver, SyncScheduler, SyncStatus,
};
