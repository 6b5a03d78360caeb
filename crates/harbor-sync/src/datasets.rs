//! # Dataset Sync Engine
//!
//! Pulls each reference dataset from the backend and applies it to the
//! local replica, one version cursor per dataset.
//!
//! ## One Dataset
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  cursor = dataset_versions[key]                                        │
//! │     │                                                                   │
//! │     ├── none  ──► POST /sync/<key>/ { }            (full snapshot)      │
//! │     └── token ──► POST /sync/<key>/ { since }      (delta)              │
//! │                         │                                               │
//! │                         ▼                                               │
//! │  { data, next_version, deleted_ids }                                   │
//! │     │                                                                   │
//! │     ▼  ONE TRANSACTION                                                  │
//! │  upsert data (replace when full) → delete ids → cursor = next_version  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## One Pass
//! Datasets run in a fixed dependency order. A failed dataset does not stop
//! the pass; only datasets that structurally depend on it are skipped.

use std::sync::Arc;
use tracing::{debug, info, warn};

use harbor_core::{DatasetKey, Record};
use harbor_db::{ApplyReport, DatasetStore, SyncBatch, SyncMode, VersionRepository};

use crate::client::{Clock, SyncBackend};
use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceSession;
use crate::protocol::DatasetSyncRequest;

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to one dataset in a pass.
#[derive(Debug)]
pub enum DatasetOutcome {
    Synced(DatasetSummary),
    Failed(SyncError),
    /// Not attempted because a dataset it depends on failed in this pass.
    Skipped { blocked_by: DatasetKey },
}

/// Details of a successful dataset sync.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub mode: SyncMode,
    pub next_version: String,
    pub report: ApplyReport,
    /// Items without a usable id, never applied.
    pub malformed: usize,
}

/// Result of a pass over several datasets.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<(DatasetKey, DatasetOutcome)>,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, DatasetOutcome::Synced(_)))
    }

    pub fn outcome(&self, key: DatasetKey) -> Option<&DatasetOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == key).map(|(_, o)| o)
    }

    /// The first failure, if any.
    pub fn first_error(&self) -> Option<(DatasetKey, &SyncError)> {
        self.outcomes.iter().find_map(|(k, o)| match o {
            DatasetOutcome::Failed(e) => Some((*k, e)),
            _ => None,
        })
    }

    /// True when any dataset was rejected with 401/403.
    pub fn has_authentication_failure(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, o)| matches!(o, DatasetOutcome::Failed(e) if e.is_authentication()))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Syncs reference datasets into the local replica.
pub struct DatasetSyncEngine {
    backend: Arc<dyn SyncBackend>,
    store: DatasetStore,
    versions: VersionRepository,
    clock: Arc<dyn Clock>,
}

impl DatasetSyncEngine {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        store: DatasetStore,
        versions: VersionRepository,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DatasetSyncEngine {
            backend,
            store,
            versions,
            clock,
        }
    }

    /// Syncs one dataset. The cursor advances only if the whole response
    /// was applied.
    pub async fn sync_dataset(
        &self,
        session: &DeviceSession,
        key: DatasetKey,
    ) -> SyncResult<DatasetSummary> {
        let since = self.versions.get(key).await?.map(|v| v.version_token);
        let mode = if since.is_some() {
            SyncMode::Incremental
        } else {
            SyncMode::Full
        };

        debug!(dataset = %key, ?mode, since = ?since, "Requesting dataset");
        let request = DatasetSyncRequest::new(session.device_id(), since, self.clock.now());
        let response = self.backend.sync_dataset(session, key, &request).await?;

        let mut records = Vec::with_capacity(response.data.len());
        let mut malformed = 0;
        for item in response.data {
            match Record::from_backend(key, item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    malformed += 1;
                    warn!(dataset = %key, error = %e, "Skipping malformed record");
                }
            }
        }

        let batch = SyncBatch {
            mode,
            records,
            deleted_ids: response.deleted_ids,
            next_version: response.next_version.clone(),
        };
        let report = self.store.apply_sync(key, batch, self.clock.now()).await?;

        info!(
            dataset = %key,
            ?mode,
            upserted = report.upserted,
            deleted = report.deleted,
            unresolved = report.unresolved.len(),
            malformed,
            version = %response.next_version,
            "Dataset synced"
        );

        Ok(DatasetSummary {
            mode,
            next_version: response.next_version,
            report,
            malformed,
        })
    }

    /// Syncs `keys` in order.
    ///
    /// A dataset whose dependency failed earlier in the same pass is skipped;
    /// everything else is attempted.
    pub async fn sync_all(&self, session: &DeviceSession, keys: &[DatasetKey]) -> PassReport {
        let mut report = PassReport::default();
        let mut unavailable: Vec<DatasetKey> = Vec::new();

        for &key in keys {
            if let Some(&blocked_by) = key.depends_on().iter().find(|d| unavailable.contains(d)) {
                warn!(dataset = %key, blocked_by = %blocked_by, "Skipping dataset");
                unavailable.push(key);
                report
                    .outcomes
                    .push((key, DatasetOutcome::Skipped { blocked_by }));
                continue;
            }

            match self.sync_dataset(session, key).await {
                Ok(summary) => report.outcomes.push((key, DatasetOutcome::Synced(summary))),
                Err(e) => {
                    warn!(dataset = %key, error = %e, "Dataset sync failed");
                    unavailable.push(key);
                    report.outcomes.push((key, DatasetOutcome::Failed(e)));
                }
            }
        }

        report
    }
}
