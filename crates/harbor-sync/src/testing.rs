//! In-memory fakes for the backend, probe, clock and fingerprint seams.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use harbor_core::{DatasetKey, DeviceCredential, IngestOperation, OrderItem, OrderPayment, OrderSnapshot};
use harbor_db::{Database, DbConfig};

use crate::client::{Clock, ConnectivityProbe, SyncBackend};
use crate::error::{SyncError, SyncResult};
use crate::identity::{DeviceSession, FingerprintSource};
use crate::protocol::{
    DatasetSyncRequest, DatasetSyncResponse, DeviceAuthorization, DeviceAuthorizationRequest,
    IngestResponse, IngestStatus, Registration, TokenPoll, TokenRequest,
};

pub const SECRET: &str = "6b6579";

pub fn credential() -> DeviceCredential {
    DeviceCredential {
        device_id: "dev-1".into(),
        tenant_id: "tenant-1".into(),
        tenant_slug: "harbor-cafe".into(),
        location_id: "loc-1".into(),
        signing_secret: SECRET.into(),
        nickname: Some("Front till".into()),
    }
}

pub fn session() -> DeviceSession {
    DeviceSession::new(credential()).unwrap()
}

pub async fn database() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

/// The backend's view of [`credential`], including the signing secret.
pub fn registration() -> Registration {
    let c = credential();
    Registration {
        device_id: c.device_id,
        tenant_id: c.tenant_id,
        tenant_slug: c.tenant_slug,
        location_id: c.location_id,
        signing_secret: Some(c.signing_secret),
        nickname: c.nickname,
    }
}

/// One flat white, paid in cash.
pub fn order_snapshot(product: &str) -> OrderSnapshot {
    OrderSnapshot {
        items: vec![OrderItem {
            product_id: product.into(),
            name: "Flat white".into(),
            quantity: 2,
            unit_price_cents: 450,
            modifiers: Vec::new(),
            notes: None,
        }],
        payments: vec![OrderPayment {
            method: "cash".into(),
            amount_cents: 900,
            tendered_cents: Some(1000),
            change_cents: Some(100),
            reference: None,
        }],
        subtotal_cents: 900,
        total_cents: 900,
        ..Default::default()
    }
}

pub fn offline() -> SyncError {
    SyncError::ConnectionFailed("connection refused".into())
}

pub fn response(data: Vec<serde_json::Value>, next: &str, deleted: &[&str]) -> DatasetSyncResponse {
    DatasetSyncResponse {
        data,
        next_version: next.to_string(),
        deleted_ids: deleted.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn success(order_id: &str) -> IngestResponse {
    IngestResponse {
        status: IngestStatus::Success,
        order_id: Some(order_id.into()),
        order_number: Some(format!("N-{}", order_id)),
        duplicate: false,
        conflicts: Vec::new(),
        errors: Vec::new(),
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Scripted backend. Queued replies are consumed in order; when a queue is
/// empty the default reply is used.
#[derive(Default)]
pub struct FakeBackend {
    pub datasets: Mutex<HashMap<DatasetKey, VecDeque<SyncResult<DatasetSyncResponse>>>>,
    pub dataset_requests: Mutex<Vec<(DatasetKey, DatasetSyncRequest)>>,
    pub ingest: Mutex<VecDeque<SyncResult<IngestResponse>>>,
    pub submitted: Mutex<Vec<IngestOperation>>,
    pub authorization: Mutex<Option<DeviceAuthorization>>,
    pub tokens: Mutex<VecDeque<SyncResult<TokenPoll>>>,
    pub token_polls: AtomicUsize,
    pub registration: Mutex<VecDeque<SyncResult<Option<Registration>>>>,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Simulated latency for dataset calls.
    pub latency: Mutex<Option<Duration>>,
    pub reject_all: AtomicBool,
    /// Every signed call in order: `sync:<dataset>` or `order:<local_id>`.
    pub events: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_dataset(&self, key: DatasetKey, reply: SyncResult<DatasetSyncResponse>) {
        self.datasets
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(reply);
    }

    pub fn push_ingest(&self, reply: SyncResult<IngestResponse>) {
        self.ingest.lock().unwrap().push_back(reply);
    }

    pub fn push_token(&self, reply: SyncResult<TokenPoll>) {
        self.tokens.lock().unwrap().push_back(reply);
    }

    pub fn push_registration(&self, reply: SyncResult<Option<Registration>>) {
        self.registration.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<(DatasetKey, DatasetSyncRequest)> {
        self.dataset_requests.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<IngestOperation> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncBackend for FakeBackend {
    async fn sync_dataset(
        &self,
        _session: &DeviceSession,
        dataset: DatasetKey,
        request: &DatasetSyncRequest,
    ) -> SyncResult<DatasetSyncResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.dataset_requests
            .lock()
            .unwrap()
            .push((dataset, request.clone()));
        self.events.lock().unwrap().push(format!("sync:{}", dataset));

        if self.reject_all.load(Ordering::SeqCst) {
            return Err(SyncError::Unauthorized { status: 401 });
        }

        self.datasets
            .lock()
            .unwrap()
            .get_mut(&dataset)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(response(Vec::new(), "v1", &[])))
    }

    async fn submit_order(
        &self,
        _session: &DeviceSession,
        operation: &IngestOperation,
    ) -> SyncResult<IngestResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(operation.clone());
        self.events
            .lock()
            .unwrap()
            .push(format!("order:{}", operation.order.local_id));

        if self.reject_all.load(Ordering::SeqCst) {
            return Err(SyncError::Unauthorized { status: 401 });
        }

        self.ingest
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(success(&operation.order.local_id)))
    }

    async fn request_device_authorization(
        &self,
        _request: &DeviceAuthorizationRequest,
    ) -> SyncResult<DeviceAuthorization> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.authorization
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(offline)
    }

    async fn poll_token(&self, _request: &TokenRequest) -> SyncResult<TokenPoll> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token_polls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TokenPoll::Pending))
    }

    async fn lookup_registration(&self, _fingerprint: &str) -> SyncResult<Option<Registration>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.registration
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(offline()))
    }
}

// =============================================================================
// Probe / Clock / Fingerprint
// =============================================================================

#[derive(Default)]
pub struct FakeProbe {
    pub online: AtomicBool,
    pub probes: AtomicUsize,
}

impl FakeProbe {
    pub fn new(online: bool) -> Self {
        FakeProbe {
            online: AtomicBool::new(online),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn is_online(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }
}

/// Clock pinned to a settable instant.
pub struct FixedClock(pub Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new() -> Self {
        FixedClock(Mutex::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap(),
        ))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub struct FixedFingerprint(pub &'static str);

#[async_trait]
impl FingerprintSource for FixedFingerprint {
    async fn fingerprint(&self) -> SyncResult<String> {
        Ok(self.0.to_string())
    }
}
