//! # Sync Scheduler
//!
//! Drives the sync cycle on a timer and owns the "sync in progress" guard.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           One Sync Cycle                                │
//! │                                                                         │
//! │  tick ──► guard taken? ──yes──► AlreadyRunning (no-op)                 │
//! │              │ no                                                       │
//! │              ▼                                                          │
//! │         probe online? ──no──► Offline (zero network calls)             │
//! │              │ yes                                                      │
//! │              ▼                                                          │
//! │         identity (re-resolve unless Confirmed)                         │
//! │              │                                                          │
//! │              ▼                                                          │
//! │   ┌────────────────────────────────────────────────────────────────┐   │
//! │   │ users → taxes → categories → products → inventory              │   │
//! │   └────────────────────────────────────────────────────────────────┘   │
//! │              │                                                          │
//! │              ▼                                                          │
//! │         order flush (sees the cursors just stored)                     │
//! │              │                                                          │
//! │              ▼                                                          │
//! │         settings ──► retention sweep ──► status + observer             │
//! │                                                                         │
//! │  NEXT DELAY:                                                           │
//! │  • success / offline / skipped tick → interval                         │
//! │  • failed cycle → exponential backoff, capped at max_backoff           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown is only observed between cycles. A cycle cut short by process
//! exit leaves only fully applied steps behind and resumes on next start.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use harbor_core::{DatasetKey, DatasetVersion};
use harbor_db::{QueueCounts, VersionRepository};

use crate::client::{Clock, ConnectivityProbe};
use crate::config::SyncConfig;
use crate::datasets::{DatasetOutcome, DatasetSyncEngine, PassReport};
use crate::error::{SyncError, SyncResult};
use crate::identity::{DeviceIdentityManager, DeviceSession, IdentityState};
use crate::orders::{FlushReport, OrderQueue};

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot for the operator surface.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct SyncStatus {
    /// Result of the most recent probe.
    pub online: bool,

    /// A cycle is running right now.
    pub syncing: bool,

    pub identity: IdentityState,

    /// One entry per dataset that has synced at least once.
    pub cursors: Vec<DatasetVersion>,

    pub queue: QueueCounts,

    /// Last cycle that finished without errors.
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub consecutive_failures: u32,

    /// Delay before the next scheduled cycle (seconds).
    pub next_delay_secs: Option<u64>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            online: false,
            syncing: false,
            identity: IdentityState::Unresolved,
            cursors: Vec::new(),
            queue: QueueCounts::default(),
            last_sync_at: None,
            last_attempt_at: None,
            last_error: None,
            consecutive_failures: 0,
            next_delay_secs: None,
        }
    }
}

// =============================================================================
// Observer Trait
// =============================================================================

/// Receives scheduler events (status surface, tray icon, logs shipping).
pub trait SyncObserver: Send + Sync {
    /// Called after every status change.
    fn on_status(&self, status: &SyncStatus);

    /// Called once per completed cycle.
    fn on_cycle(&self, report: &CycleReport);

    /// Called for each error worth surfacing, order conflicts included.
    fn on_error(&self, error: &SyncError);
}

/// Observer that ignores everything.
pub struct NoOpObserver;

impl SyncObserver for NoOpObserver {
    fn on_status(&self, _status: &SyncStatus) {}
    fn on_cycle(&self, _report: &CycleReport) {}
    fn on_error(&self, _error: &SyncError) {}
}

// =============================================================================
// Cycle Results
// =============================================================================

/// What a single tick did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle held the guard.
    AlreadyRunning,
    /// The probe reported the backend unreachable.
    Offline,
    Completed(CycleReport),
}

impl CycleOutcome {
    /// True only for a completed cycle that hit an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Completed(report) if !report.is_success())
    }

    /// True when the cycle stopped because the device has no usable identity.
    pub fn needs_pairing(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Completed(CycleReport {
                error: Some(SyncError::PairingRequired),
                ..
            })
        )
    }
}

/// Why [`SyncScheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// Identity was lost; pair the device, then call `run` again.
    PairingRequired,
}

/// Everything a completed cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub datasets: PassReport,
    /// `None` when the cycle stopped before the flush.
    pub flush: Option<FlushReport>,
    pub settings: Option<DatasetOutcome>,
    /// SYNCED orders removed by the retention sweep.
    pub swept: u64,
    /// Error that ended the cycle early (identity, storage).
    pub error: Option<SyncError>,
}

impl CycleReport {
    fn aborted(error: SyncError) -> Self {
        CycleReport {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.last_error().is_none()
    }

    /// The error that best explains a failed cycle.
    pub fn last_error(&self) -> Option<&SyncError> {
        if let Some(e) = &self.error {
            return Some(e);
        }
        if let Some((_, e)) = self.datasets.first_error() {
            return Some(e);
        }
        if let Some(e) = self.flush.as_ref().and_then(|f| f.stopped_by.as_ref()) {
            return Some(e);
        }
        match &self.settings {
            Some(DatasetOutcome::Failed(e)) => Some(e),
            _ => None,
        }
    }

    /// True when the backend rejected the device's signature.
    pub fn rejected_device(&self) -> bool {
        self.datasets.has_authentication_failure()
            || self
                .flush
                .as_ref()
                .and_then(|f| f.stopped_by.as_ref())
                .is_some_and(SyncError::is_authentication)
            || matches!(&self.settings, Some(DatasetOutcome::Failed(e)) if e.is_authentication())
    }
}

// =============================================================================
// In-Flight Guard
// =============================================================================

/// Clears the in-flight flag when the cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Timer-driven orchestration of dataset sync and order delivery.
pub struct SyncScheduler {
    identity: Arc<DeviceIdentityManager>,
    datasets: DatasetSyncEngine,
    queue: Arc<OrderQueue>,
    versions: VersionRepository,
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SyncObserver>,

    interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    retention_days: u32,

    in_flight: AtomicBool,
    status: RwLock<SyncStatus>,
}

impl SyncScheduler {
    pub fn new(
        config: &SyncConfig,
        identity: Arc<DeviceIdentityManager>,
        datasets: DatasetSyncEngine,
        queue: Arc<OrderQueue>,
        versions: VersionRepository,
        probe: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SyncScheduler {
            identity,
            datasets,
            queue,
            versions,
            probe,
            clock,
            observer: Arc::new(NoOpObserver),
            interval: config.interval(),
            initial_backoff: Duration::from_millis(config.sync.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.sync.max_backoff_secs),
            retention_days: config.sync.retention_days,
            in_flight: AtomicBool::new(false),
            status: RwLock::new(SyncStatus::default()),
        }
    }

    /// Replaces the no-op observer.
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn identity(&self) -> &Arc<DeviceIdentityManager> {
        &self.identity
    }

    /// The order queue, for the sales flow.
    pub fn queue(&self) -> &Arc<OrderQueue> {
        &self.queue
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Current status with cursors and queue counts read fresh from storage.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.refresh_status().await?;
        Ok(self.status.read().await.clone())
    }

    async fn refresh_status(&self) -> SyncResult<()> {
        let cursors = self.versions.all().await?;
        let queue = self.queue.queue_counts().await?;
        let identity = self.identity.state().await;

        let mut status = self.status.write().await;
        status.cursors = cursors;
        status.queue = queue;
        status.identity = identity;
        status.syncing = self.is_syncing();
        Ok(())
    }

    async fn update_status(&self, update: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status.write().await;
            update(&mut status);
            status.clone()
        };
        self.observer.on_status(&snapshot);
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Runs a cycle now, unless one is already in flight.
    pub async fn force_sync(&self) -> CycleOutcome {
        info!("Sync requested");
        self.tick().await
    }

    /// One timer tick.
    pub async fn tick(&self) -> CycleOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Sync cycle already in flight; tick skipped");
            return CycleOutcome::AlreadyRunning;
        };

        let started = self.clock.now();
        self.update_status(|s| {
            s.syncing = true;
            s.last_attempt_at = Some(started);
        })
        .await;

        if !self.probe.is_online().await {
            info!("Backend unreachable; cycle skipped");
            self.update_status(|s| {
                s.online = false;
                s.syncing = false;
            })
            .await;
            return CycleOutcome::Offline;
        }

        let report = self.run_cycle().await;
        self.finish_cycle(&report).await;
        CycleOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => return CycleReport::aborted(e),
        };

        let mut report = CycleReport {
            datasets: self
                .datasets
                .sync_all(&session, &DatasetKey::REFERENCE_ORDER)
                .await,
            ..Default::default()
        };
        if report.datasets.has_authentication_failure() {
            self.identity.mark_unrecognized().await;
            return report;
        }

        match self.queue.flush(&session).await {
            Ok(flush) => {
                let rejected = flush
                    .stopped_by
                    .as_ref()
                    .is_some_and(SyncError::is_authentication);
                report.flush = Some(flush);
                if rejected {
                    self.identity.mark_unrecognized().await;
                    return report;
                }
            }
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        }

        let settings = match self.datasets.sync_dataset(&session, DatasetKey::Settings).await {
            Ok(summary) => DatasetOutcome::Synced(summary),
            Err(e) => {
                if e.is_authentication() {
                    self.identity.mark_unrecognized().await;
                }
                DatasetOutcome::Failed(e)
            }
        };
        report.settings = Some(settings);

        match self.queue.sweep_synced(self.retention_days).await {
            Ok(swept) => report.swept = swept,
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }

        report
    }

    /// The session to sign with, re-resolving unless the backend confirmed it.
    async fn session(&self) -> SyncResult<DeviceSession> {
        let state = self.identity.state().await;
        match self.identity.session().await {
            Some(session) if state == IdentityState::Confirmed => Ok(session),
            _ => {
                debug!(?state, "Resolving device identity");
                self.identity.resolve_identity().await
            }
        }
    }

    async fn finish_cycle(&self, report: &CycleReport) {
        let finished = self.clock.now();

        if let Some(flush) = &report.flush {
            for conflict in &flush.conflicts {
                self.observer.on_error(conflict);
            }
        }

        let last_error = report.last_error();
        match last_error {
            Some(e) => {
                error!(error = %e, "Sync cycle failed");
                self.observer.on_error(e);
            }
            None => {
                info!(
                    synced_orders = report.flush.as_ref().map_or(0, |f| f.synced),
                    swept = report.swept,
                    "Sync cycle complete"
                );
            }
        }

        if let Err(e) = self.refresh_status().await {
            warn!(error = %e, "Could not refresh sync status");
        }

        let message = last_error.map(ToString::to_string);
        self.update_status(|s| {
            s.online = true;
            s.syncing = false;
            match message {
                Some(message) => {
                    s.last_error = Some(message);
                    s.consecutive_failures += 1;
                }
                None => {
                    s.last_error = None;
                    s.consecutive_failures = 0;
                    s.last_sync_at = Some(finished);
                }
            }
        })
        .await;

        self.observer.on_cycle(report);
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Interval after a good cycle, backoff after a failed one.
    fn next_delay(&self, outcome: &CycleOutcome, backoff: &mut ExponentialBackoff) -> Duration {
        if outcome.is_failure() {
            backoff
                .next_backoff()
                .unwrap_or(self.max_backoff)
                .min(self.max_backoff)
        } else {
            backoff.reset();
            self.interval
        }
    }

    /// Ticks until `shutdown` is cancelled or a cycle finds the device
    /// unpaired. The first cycle runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) -> RunExit {
        info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

        let mut backoff = self.backoff();
        let exit = loop {
            let outcome = self.tick().await;
            if outcome.needs_pairing() {
                warn!("Device is not paired; sync scheduler paused");
                break RunExit::PairingRequired;
            }
            let delay = self.next_delay(&outcome, &mut backoff);
            debug!(delay_ms = delay.as_millis() as u64, "Next sync cycle scheduled");
            self.update_status(|s| s.next_delay_secs = Some(delay.as_secs()))
                .await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break RunExit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        info!(?exit, "Sync scheduler stopped");
        exit
    }
}
