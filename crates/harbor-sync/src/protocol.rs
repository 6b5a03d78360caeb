//! # Backend Protocol
//!
//! Request and response bodies for the backend's REST endpoints.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Backend Endpoints                                │
//! │                                                                         │
//! │  DATASET SYNC (signed)                                                 │
//! │  ─────────────────────                                                 │
//! │  POST /sync/<dataset>/        { since? }                               │
//! │                          ◄─── { data, next_version, deleted_ids? }     │
//! │                                                                         │
//! │  ORDER INGEST (signed)                                                 │
//! │  ─────────────────────                                                 │
//! │  POST /sync/offline-orders/   IngestOperation                          │
//! │                          ◄─── { status, order_id?, conflicts?, ... }   │
//! │                                                                         │
//! │  PAIRING (fingerprint only)                                            │
//! │  ──────────────────────────                                            │
//! │  POST /terminals/pairing/device-authorization/                         │
//! │                          ◄─── { device_code, user_code, ... }          │
//! │  POST /terminals/pairing/token/                                        │
//! │                          ◄─── credential | { error }                   │
//! │  GET  /terminals/registrations/by-fingerprint/<fp>/                    │
//! │                          ◄─── registration | 404                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Signed Requests
//! Signed bodies embed `device_id`, `nonce` and `created_at`. The same
//! `device_id` and `nonce` travel in the `X-Device-ID` / `X-Nonce` headers
//! next to `X-Signature`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use harbor_core::{id_from_value, DeviceCredential};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Paths & Headers
// =============================================================================

pub const ORDER_INGEST_PATH: &str = "/sync/offline-orders/";
pub const DEVICE_AUTHORIZATION_PATH: &str = "/terminals/pairing/device-authorization/";
pub const TOKEN_PATH: &str = "/terminals/pairing/token/";

/// Registration lookup path for `fingerprint`.
pub fn registration_path(fingerprint: &str) -> String {
    format!("/terminals/registrations/by-fingerprint/{}/", fingerprint)
}

pub const HEADER_DEVICE_ID: &str = "X-Device-ID";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_LOCATION_ID: &str = "X-Location-ID";

/// RFC 8628 grant type for token polling.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

// =============================================================================
// Dataset Sync
// =============================================================================

/// Body of `POST /sync/<dataset>/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSyncRequest {
    pub device_id: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    /// Absent for a full snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

impl DatasetSyncRequest {
    /// Builds a request with a fresh nonce.
    pub fn new(device_id: &str, since: Option<String>, now: DateTime<Utc>) -> Self {
        DatasetSyncRequest {
            device_id: device_id.to_string(),
            nonce: Uuid::new_v4().to_string(),
            created_at: now,
            since,
        }
    }

    pub fn is_full(&self) -> bool {
        self.since.is_none()
    }
}

/// Response of `POST /sync/<dataset>/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSyncResponse {
    #[serde(default)]
    pub data: Vec<Value>,

    /// Cursor to store once `data` and `deleted_ids` are applied.
    #[serde(deserialize_with = "version_token")]
    pub next_version: String,

    #[serde(default, deserialize_with = "id_list")]
    pub deleted_ids: Vec<String>,
}

fn version_token<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "next_version must be a non-empty string or number, got {}",
            other
        ))),
    }
}

fn id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    values
        .iter()
        .map(|v| {
            id_from_value(v)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid deleted id: {}", v)))
        })
        .collect()
}

// =============================================================================
// Order Ingest
// =============================================================================

/// Outcome reported by the ingest endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestStatus {
    Success,
    Conflict,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConflict {
    pub message: String,
}

/// Response of `POST /sync/offline-orders/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: IngestStatus,

    #[serde(default, deserialize_with = "optional_id")]
    pub order_id: Option<String>,

    #[serde(default, deserialize_with = "optional_id")]
    pub order_number: Option<String>,

    /// Set when the backend recognized the `local_id` from an earlier attempt.
    #[serde(default)]
    pub duplicate: bool,

    #[serde(default)]
    pub conflicts: Vec<IngestConflict>,

    #[serde(default)]
    pub errors: Vec<Value>,
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}

impl IngestResponse {
    /// Conflict explanation stored on the order.
    pub fn conflict_reason(&self) -> String {
        if self.conflicts.is_empty() {
            return "Backend reported a conflict without details".to_string();
        }
        self.conflicts
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Error summary stored on the order.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "Backend rejected the order".to_string();
        }
        self.errors
            .iter()
            .map(|e| match e {
                Value::String(s) => s.clone(),
                Value::Object(map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// =============================================================================
// Pairing
// =============================================================================

/// Body of the device-authorization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAuthorizationRequest {
    pub client_id: String,
    pub device_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Codes returned by the device-authorization endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    /// Shown to the operator.
    pub user_code: String,
    pub verification_uri: String,
    /// Seconds until `device_code` expires.
    pub expires_in: u64,
    /// Minimum seconds between token polls.
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// Body of a token poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub device_code: String,
    pub client_id: String,
}

impl TokenRequest {
    pub fn new(device_code: &str, client_id: &str) -> Self {
        TokenRequest {
            grant_type: DEVICE_CODE_GRANT.to_string(),
            device_code: device_code.to_string(),
            client_id: client_id.to_string(),
        }
    }
}

/// Result of one token poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    /// The operator approved; the credential is issued.
    Approved(DeviceCredential),
    /// `authorization_pending`
    Pending,
    /// `slow_down`: poll less often.
    SlowDown,
    /// `expired_token`
    Expired,
    /// `access_denied`
    Denied,
}

impl TokenPoll {
    /// Interprets a token endpoint body.
    ///
    /// RFC 8628 servers answer pending/denied/expired with HTTP 400 and an
    /// `error` field, so this is used for both 200 and 400 responses.
    pub fn from_body(body: Value) -> SyncResult<Self> {
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return match error {
                "authorization_pending" => Ok(TokenPoll::Pending),
                "slow_down" => Ok(TokenPoll::SlowDown),
                "expired_token" => Ok(TokenPoll::Expired),
                "access_denied" => Ok(TokenPoll::Denied),
                other => Err(SyncError::InvalidResponse(format!(
                    "Unknown token error: {}",
                    other
                ))),
            };
        }

        let credential: DeviceCredential = serde_json::from_value(body)
            .map_err(|e| SyncError::InvalidResponse(format!("Invalid credential: {}", e)))?;
        Ok(TokenPoll::Approved(credential))
    }
}

/// Authoritative identity returned by the by-fingerprint lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub device_id: String,
    pub tenant_id: String,
    pub tenant_slug: String,
    pub location_id: String,
    /// Present only when the backend rotates the key.
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Registration {
    /// Merges the registration with the cached credential.
    ///
    /// The backend's fields win. The cached signing secret is reused only for
    /// the same `device_id`; without any secret there is no usable identity.
    pub fn into_credential(self, cached: Option<&DeviceCredential>) -> Option<DeviceCredential> {
        let signing_secret = match self.signing_secret {
            Some(secret) => secret,
            None => cached
                .filter(|c| c.device_id == self.device_id)
                .map(|c| c.signing_secret.clone())?,
        };

        Some(DeviceCredential {
            device_id: self.device_id,
            tenant_id: self.tenant_id,
            tenant_slug: self.tenant_slug,
            location_id: self.location_id,
            signing_secret,
            nickname: self.nickname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dataset_request_omits_since_for_full_sync() {
        let req = DatasetSyncRequest::new("dev-1", None, Utc::now());
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("since").is_none());
        assert!(req.is_full());

        let req = DatasetSyncRequest::new("dev-1", Some("v7".into()), Utc::now());
        assert_eq!(serde_json::to_value(&req).unwrap()["since"], "v7");
    }

    #[test]
    fn test_dataset_response_normalizes_ids_and_versions() {
        let resp: DatasetSyncResponse = serde_json::from_value(json!({
            "data": [{"id": 1}],
            "next_version": 42,
            "deleted_ids": [3, "x"]
        }))
        .unwrap();
        assert_eq!(resp.next_version, "42");
        assert_eq!(resp.deleted_ids, vec!["3", "x"]);

        let resp: DatasetSyncResponse =
            serde_json::from_value(json!({"data": [], "next_version": "v2", "deleted_ids": null}))
                .unwrap();
        assert!(resp.deleted_ids.is_empty());

        assert!(serde_json::from_value::<DatasetSyncResponse>(json!({"data": []})).is_err());
        assert!(
            serde_json::from_value::<DatasetSyncResponse>(json!({"next_version": null})).is_err()
        );
    }

    #[test]
    fn test_ingest_response_messages() {
        let resp: IngestResponse = serde_json::from_value(json!({
            "status": "CONFLICT",
            "conflicts": [{"message": "price changed"}, {"message": "item retired"}]
        }))
        .unwrap();
        assert_eq!(resp.status, IngestStatus::Conflict);
        assert_eq!(resp.conflict_reason(), "price changed; item retired");

        let resp: IngestResponse = serde_json::from_value(json!({
            "status": "SUCCESS", "order_id": 981, "order_number": "A-17", "duplicate": true
        }))
        .unwrap();
        assert_eq!(resp.order_id.as_deref(), Some("981"));
        assert!(resp.duplicate);

        let resp: IngestResponse = serde_json::from_value(json!({
            "status": "ERROR", "errors": ["bad total", {"message": "unknown product"}]
        }))
        .unwrap();
        assert_eq!(resp.error_summary(), "bad total; unknown product");
    }

    #[test]
    fn test_token_poll_parsing() {
        assert_eq!(
            TokenPoll::from_body(json!({"error": "authorization_pending"})).unwrap(),
            TokenPoll::Pending
        );
        assert_eq!(
            TokenPoll::from_body(json!({"error": "access_denied"})).unwrap(),
            TokenPoll::Denied
        );
        assert!(TokenPoll::from_body(json!({"error": "teapot"})).is_err());

        let approved = TokenPoll::from_body(json!({
            "device_id": "d", "tenant_id": "t", "tenant_slug": "s",
            "location_id": "l", "signing_secret": "00ff"
        }))
        .unwrap();
        assert!(matches!(approved, TokenPoll::Approved(c) if c.device_id == "d"));
    }

    #[test]
    fn test_registration_reuses_secret_only_for_same_device() {
        let cached = DeviceCredential {
            device_id: "d1".into(),
            tenant_id: "t".into(),
            tenant_slug: "s".into(),
            location_id: "old".into(),
            signing_secret: "abcd".into(),
            nickname: None,
        };
        let reg = Registration {
            device_id: "d1".into(),
            tenant_id: "t".into(),
            tenant_slug: "s".into(),
            location_id: "new".into(),
            signing_secret: None,
            nickname: None,
        };

        let merged = reg.clone().into_credential(Some(&cached)).unwrap();
        assert_eq!(merged.location_id, "new");
        assert_eq!(merged.signing_secret, "abcd");

        let other = Registration {
            device_id: "d2".into(),
            ..reg
        };
        assert!(other.into_credential(Some(&cached)).is_none());
    }
}
