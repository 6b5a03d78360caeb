//! # Backend Client
//!
//! The seams between the sync engine and the outside world, plus their
//! production implementations.
//!
//! ## Seams
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncBackend        ── HttpBackend (reqwest)     ── fakes in tests     │
//! │  ConnectivityProbe  ── HttpProbe (GET probe_path)                      │
//! │  Clock              ── SystemClock                                      │
//! │                                                                         │
//! │  Signed request:                                                       │
//! │    body  = { device_id, nonce, created_at, ... }                       │
//! │    X-Device-ID  = body.device_id                                       │
//! │    X-Nonce      = body.nonce                                           │
//! │    X-Signature  = HMAC(canonical(body) || nonce)                       │
//! │    X-Location-ID                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call has a bounded timeout. There is no mid-flight cancellation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use harbor_core::{DatasetKey, IngestOperation};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceSession;
use crate::protocol::{
    registration_path, DatasetSyncRequest, DatasetSyncResponse, DeviceAuthorization,
    DeviceAuthorizationRequest, IngestConflict, IngestResponse, IngestStatus, Registration,
    TokenPoll, TokenRequest, DEVICE_AUTHORIZATION_PATH, ORDER_INGEST_PATH, TOKEN_PATH,
};

// =============================================================================
// Seams
// =============================================================================

/// The backend as seen by the sync engine.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// `POST /sync/<dataset>/` (signed).
    async fn sync_dataset(
        &self,
        session: &DeviceSession,
        dataset: DatasetKey,
        request: &DatasetSyncRequest,
    ) -> SyncResult<DatasetSyncResponse>;

    /// `POST /sync/offline-orders/` (signed).
    async fn submit_order(
        &self,
        session: &DeviceSession,
        operation: &IngestOperation,
    ) -> SyncResult<IngestResponse>;

    /// Step one of pairing.
    async fn request_device_authorization(
        &self,
        request: &DeviceAuthorizationRequest,
    ) -> SyncResult<DeviceAuthorization>;

    /// Step two of pairing, called once per poll.
    async fn poll_token(&self, request: &TokenRequest) -> SyncResult<TokenPoll>;

    /// Authoritative identity for `fingerprint`; `None` when the backend does
    /// not know this hardware.
    async fn lookup_registration(&self, fingerprint: &str) -> SyncResult<Option<Registration>>;
}

/// Lightweight reachability check run before each cycle.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Source of wall-clock timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// HTTP Backend
// =============================================================================

/// reqwest implementation of [`SyncBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    timeout_secs: u64,
}

impl HttpBackend {
    /// Builds a client for the configured backend.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client: {}", e)))?;

        Ok(HttpBackend {
            client,
            base_url: normalize_base(config.base_url()?),
            timeout_secs: config.backend.request_timeout_secs,
        })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout_secs)
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }

    /// Sends a signed POST and returns the raw response.
    async fn signed_post<T: Serialize + ?Sized>(
        &self,
        session: &DeviceSession,
        path: &str,
        body: &T,
    ) -> SyncResult<reqwest::Response> {
        let body = serde_json::to_value(body)?;
        let headers = session.signed_headers(&body)?;
        let url = self.endpoint(path)?;

        trace!(%url, "Signed POST");

        let mut request = self.client.post(url).json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        request.send().await.map_err(|e| self.transport_error(e))
    }

    /// Plain POST for the pairing endpoints.
    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> SyncResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn parse<R: DeserializeOwned>(&self, response: reqwest::Response) -> SyncResult<R> {
        let status = response.status();
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        response
            .json::<R>()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("HTTP {}: {}", status, e)))
    }
}

/// Url::join drops the last path segment unless the base ends in '/'.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

async fn error_for(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unreadable body".to_string());
    SyncError::from_status(status, message)
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn sync_dataset(
        &self,
        session: &DeviceSession,
        dataset: DatasetKey,
        request: &DatasetSyncRequest,
    ) -> SyncResult<DatasetSyncResponse> {
        let response = self
            .signed_post(session, &dataset.endpoint(), request)
            .await?;
        self.parse(response).await
    }

    async fn submit_order(
        &self,
        session: &DeviceSession,
        operation: &IngestOperation,
    ) -> SyncResult<IngestResponse> {
        let response = self
            .signed_post(session, ORDER_INGEST_PATH, operation)
            .await?;

        // 409 carries a conflict, with or without a structured body.
        if response.status() == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            return Ok(serde_json::from_str::<IngestResponse>(&text).unwrap_or_else(|_| {
                IngestResponse {
                    status: IngestStatus::Conflict,
                    order_id: None,
                    order_number: None,
                    duplicate: false,
                    conflicts: vec![IngestConflict { message: text }],
                    errors: Vec::new(),
                }
            }));
        }

        self.parse(response).await
    }

    async fn request_device_authorization(
        &self,
        request: &DeviceAuthorizationRequest,
    ) -> SyncResult<DeviceAuthorization> {
        let response = self.post(DEVICE_AUTHORIZATION_PATH, request).await?;
        self.parse(response).await
    }

    async fn poll_token(&self, request: &TokenRequest) -> SyncResult<TokenPoll> {
        let response = self.post(TOKEN_PATH, request).await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::BAD_REQUEST {
            let body: Value = response
                .json()
                .await
                .map_err(|e| SyncError::InvalidResponse(e.to_string()))?;
            return TokenPoll::from_body(body);
        }

        Err(error_for(response).await)
    }

    async fn lookup_registration(&self, fingerprint: &str) -> SyncResult<Option<Registration>> {
        let url = self.endpoint(&registration_path(fingerprint))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Backend has no registration for this fingerprint");
            return Ok(None);
        }

        self.parse(response).await.map(Some)
    }
}

// =============================================================================
// HTTP Probe
// =============================================================================

/// Online check: any non-5xx answer from `probe_path` counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client: {}", e)))?;
        let url = normalize_base(config.base_url()?)
            .join(config.backend.probe_path.trim_start_matches('/'))?;

        Ok(HttpProbe { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(error = %e, "Connectivity probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.backend.base_url = base.into();
        config
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let backend = HttpBackend::new(&config("https://pos.example.com/api")).unwrap();
        assert_eq!(
            backend.endpoint("/sync/products/").unwrap().as_str(),
            "https://pos.example.com/api/sync/products/"
        );

        let backend = HttpBackend::new(&config("https://pos.example.com")).unwrap();
        assert_eq!(
            backend
                .endpoint(&registration_path("abc123"))
                .unwrap()
                .as_str(),
            "https://pos.example.com/terminals/registrations/by-fingerprint/abc123/"
        );
    }

    #[test]
    fn test_probe_url() {
        let probe = HttpProbe::new(&config("http://localhost:8000/")).unwrap();
        assert_eq!(probe.url.as_str(), "http://localhost:8000/health/");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(HttpBackend::new(&config("::nope")).is_err());
    }
}
