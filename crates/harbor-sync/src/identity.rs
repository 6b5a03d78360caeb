//! # Device Identity
//!
//! Hardware fingerprint, device-authorization pairing and the credential
//! used to sign every outbound request.
//!
//! ## Pairing Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Terminal                         Backend                Operator       │
//! │     │ device-authorization(fp)      │                       │           │
//! │     │──────────────────────────────►│                       │           │
//! │     │◄── device_code, user_code ────│                       │           │
//! │     │    verification_uri, interval │                       │           │
//! │     │                               │◄── approve user_code ─│           │
//! │     │ token(device_code) every      │                       │           │
//! │     │ `interval` until deadline     │                       │           │
//! │     │──────────────────────────────►│                       │           │
//! │     │◄── pending | slow_down ───────│                       │           │
//! │     │◄── credential ────────────────│                       │           │
//! │     │                               │                       │           │
//! │  persist credential (cache) ── sign requests with its secret            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cold Start
//! 1. Look up the registration by fingerprint (authoritative).
//! 2. Backend unreachable → use the cached credential.
//! 3. Backend does not know the device → clear the cache, pairing required.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ts_rs::TS;

use harbor_core::{DeviceCredential, RequestSigner};
use harbor_db::CredentialRepository;

use crate::client::{Clock, SyncBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    DeviceAuthorization, DeviceAuthorizationRequest, TokenPoll, TokenRequest, HEADER_DEVICE_ID,
    HEADER_LOCATION_ID, HEADER_NONCE, HEADER_SIGNATURE,
};

/// Extra wait added on every `slow_down` reply.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Bound on the poll sent at the deadline.
const LAST_POLL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Fingerprint
// =============================================================================

/// Source of the hardware-derived device fingerprint.
#[async_trait]
pub trait FingerprintSource: Send + Sync {
    async fn fingerprint(&self) -> SyncResult<String>;
}

/// Fingerprint from the host's machine id, hashed with SHA-256.
///
/// ## Sources, first usable wins
/// 1. Machine id files (`/etc/machine-id` and the dbus copy on Linux)
/// 2. Platform id: `MachineGuid` from the registry on Windows,
///    `IOPlatformUUID` from `ioreg` on macOS
/// 3. Fallback file holding a generated id, created on first use
///
/// Sources 1 and 2 survive reinstalls of the application. The fallback only
/// lives as long as its file.
#[derive(Debug, Clone)]
pub struct HostFingerprint {
    sources: Vec<PathBuf>,
    platform: bool,
    fallback: Option<PathBuf>,
}

impl HostFingerprint {
    pub fn new() -> Self {
        let sources = if cfg!(target_os = "linux") {
            vec![
                PathBuf::from("/etc/machine-id"),
                PathBuf::from("/var/lib/dbus/machine-id"),
            ]
        } else {
            Vec::new()
        };

        HostFingerprint {
            sources,
            platform: true,
            fallback: None,
        }
    }

    /// Reads the identifier from `sources` only, first readable wins.
    pub fn with_sources(sources: Vec<PathBuf>) -> Self {
        HostFingerprint {
            sources,
            platform: false,
            fallback: None,
        }
    }

    /// File used when no hardware id is readable.
    pub fn with_fallback(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback = Some(path.into());
        self
    }

    async fn machine_id(&self) -> SyncResult<Option<String>> {
        for path in &self.sources {
            match tokio::fs::read_to_string(path).await {
                Ok(raw) if !raw.trim().is_empty() => return Ok(Some(raw.trim().to_string())),
                Ok(_) => debug!(?path, "Machine id source is empty"),
                Err(e) => debug!(?path, error = %e, "Machine id source unreadable"),
            }
        }

        if self.platform {
            if let Some(id) = platform_machine_id().await {
                return Ok(Some(id));
            }
        }

        match &self.fallback {
            Some(path) => fallback_machine_id(path).await.map(Some),
            None => Ok(None),
        }
    }
}

impl Default for HostFingerprint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FingerprintSource for HostFingerprint {
    async fn fingerprint(&self) -> SyncResult<String> {
        let id = self.machine_id().await?.ok_or_else(|| {
            SyncError::FingerprintUnavailable("no machine id source readable".into())
        })?;

        let mut hasher = Sha256::new();
        hasher.update(b"harbor-pos:");
        hasher.update(id.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Reads the generated id at `path`, creating it on first use.
async fn fallback_machine_id(path: &Path) -> SyncResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
        Ok(_) => debug!(?path, "Fallback id file is empty, regenerating"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::FingerprintUnavailable(e.to_string())),
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::FingerprintUnavailable(e.to_string()))?;
    }
    tokio::fs::write(path, &id)
        .await
        .map_err(|e| SyncError::FingerprintUnavailable(e.to_string()))?;

    warn!(?path, "No hardware id readable, generated a persistent device id");
    Ok(id)
}

#[cfg(windows)]
async fn platform_machine_id() -> Option<String> {
    let out = command_stdout(
        "reg",
        &[
            "query",
            r"HKLM\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ],
    )
    .await?;
    parse_reg_machine_guid(&out)
}

#[cfg(target_os = "macos")]
async fn platform_machine_id() -> Option<String> {
    let out = command_stdout("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).await?;
    parse_ioreg_platform_uuid(&out)
}

#[cfg(not(any(windows, target_os = "macos")))]
async fn platform_machine_id() -> Option<String> {
    None
}

#[cfg(any(windows, target_os = "macos"))]
async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(program, status = ?out.status, "Platform id command failed");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "Platform id command unavailable");
            None
        }
    }
}

/// `MachineGuid    REG_SZ    <guid>` line of `reg query` output.
#[cfg(any(windows, test))]
fn parse_reg_machine_guid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("MachineGuid"), Some("REG_SZ"), Some(guid)) => Some(guid.to_string()),
            _ => None,
        }
    })
}

/// `"IOPlatformUUID" = "<uuid>"` line of `ioreg` output.
#[cfg(any(target_os = "macos", test))]
fn parse_ioreg_platform_uuid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim().trim_matches('"') != "IOPlatformUUID" {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

// =============================================================================
// Device Session
// =============================================================================

/// A usable credential plus its decoded signer.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    credential: DeviceCredential,
    signer: RequestSigner,
}

impl DeviceSession {
    /// Fails if the signing secret is not valid hex.
    pub fn new(credential: DeviceCredential) -> SyncResult<Self> {
        let signer = RequestSigner::from_hex(&credential.signing_secret)?;
        Ok(DeviceSession { credential, signer })
    }

    pub fn device_id(&self) -> &str {
        &self.credential.device_id
    }

    pub fn location_id(&self) -> &str {
        &self.credential.location_id
    }

    pub fn credential(&self) -> &DeviceCredential {
        &self.credential
    }

    /// Headers for a signed request body.
    ///
    /// `X-Device-ID` and `X-Nonce` are read from the body itself, so they
    /// always match the signed fields.
    pub fn signed_headers(&self, body: &Value) -> SyncResult<Vec<(&'static str, String)>> {
        let device_id = body
            .get("device_id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Internal("signed body has no device_id".into()))?;
        let nonce = body
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Internal("signed body has no nonce".into()))?;

        if body.get("created_at").is_none() {
            return Err(SyncError::Internal("signed body has no created_at".into()));
        }
        if device_id != self.credential.device_id {
            return Err(SyncError::Internal(format!(
                "signed body is for device {}, session is {}",
                device_id, self.credential.device_id
            )));
        }

        Ok(vec![
            (HEADER_DEVICE_ID, device_id.to_string()),
            (HEADER_NONCE, nonce.to_string()),
            (HEADER_SIGNATURE, self.signer.sign(body, nonce)),
            (HEADER_LOCATION_ID, self.credential.location_id.clone()),
        ])
    }
}

// =============================================================================
// Identity State
// =============================================================================

/// Where the current identity came from, for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Nothing resolved yet.
    Unresolved,
    /// Confirmed by the backend (lookup or fresh pairing).
    Confirmed,
    /// Loaded from the local cache because the backend was unreachable.
    Cached,
    /// No usable credential.
    PairingRequired,
    /// The backend rejected the signature ("device not recognized").
    Unrecognized,
}

// =============================================================================
// Identity Manager
// =============================================================================

/// Owns the device credential and the pairing flow.
pub struct DeviceIdentityManager {
    backend: Arc<dyn SyncBackend>,
    credentials: CredentialRepository,
    fingerprints: Arc<dyn FingerprintSource>,
    clock: Arc<dyn Clock>,
    client_id: String,
    nickname: Option<String>,
    max_wait: Duration,
    fingerprint: OnceCell<String>,
    session: RwLock<Option<DeviceSession>>,
    state: RwLock<IdentityState>,
}

impl DeviceIdentityManager {
    pub fn new(
        config: &SyncConfig,
        backend: Arc<dyn SyncBackend>,
        credentials: CredentialRepository,
        fingerprints: Arc<dyn FingerprintSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DeviceIdentityManager {
            backend,
            credentials,
            fingerprints,
            clock,
            client_id: config.device.client_id.clone(),
            nickname: config.device.nickname.clone(),
            max_wait: config.pairing_max_wait(),
            fingerprint: OnceCell::new(),
            session: RwLock::new(None),
            state: RwLock::new(IdentityState::Unresolved),
        }
    }

    /// The hardware fingerprint, read once per process.
    pub async fn fingerprint(&self) -> SyncResult<String> {
        self.fingerprint
            .get_or_try_init(|| self.fingerprints.fingerprint())
            .await
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub async fn session(&self) -> Option<DeviceSession> {
        self.session.read().await.clone()
    }

    pub async fn location_id(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.location_id().to_string())
    }

    pub async fn device_id(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.device_id().to_string())
    }

    pub async fn state(&self) -> IdentityState {
        *self.state.read().await
    }

    /// Records that the backend rejected this device's signature.
    ///
    /// The session is kept; the next cycle re-resolves identity first.
    pub async fn mark_unrecognized(&self) {
        let mut state = self.state.write().await;
        if *state != IdentityState::Unrecognized {
            warn!("Backend no longer recognizes this device");
        }
        *state = IdentityState::Unrecognized;
    }

    // -------------------------------------------------------------------------
    // Cold Start
    // -------------------------------------------------------------------------

    /// Resolves identity: backend lookup first, cache only when unreachable.
    pub async fn resolve_identity(&self) -> SyncResult<DeviceSession> {
        let fingerprint = self.fingerprint().await?;
        let cached = self.credentials.load().await?;

        match self.backend.lookup_registration(&fingerprint).await {
            Ok(Some(registration)) => {
                let device_id = registration.device_id.clone();
                let cached_credential = cached.as_ref().map(|s| &s.credential);
                match registration.into_credential(cached_credential) {
                    Some(credential) => {
                        info!(device_id = %device_id, "Identity confirmed by backend");
                        self.install(credential, &fingerprint, IdentityState::Confirmed)
                            .await
                    }
                    None => {
                        warn!(
                            device_id = %device_id,
                            "Backend registration has no usable signing secret"
                        );
                        self.clear_identity().await?;
                        Err(SyncError::PairingRequired)
                    }
                }
            }
            Ok(None) => {
                info!("Backend does not know this device");
                self.clear_identity().await?;
                Err(SyncError::PairingRequired)
            }
            Err(e) if e.is_transient() => match cached {
                Some(stored) if stored.fingerprint == fingerprint => {
                    warn!(
                        error = %e,
                        device_id = %stored.credential.device_id,
                        "Backend unreachable, using cached identity"
                    );
                    let session = DeviceSession::new(stored.credential)?;
                    *self.session.write().await = Some(session.clone());
                    *self.state.write().await = IdentityState::Cached;
                    Ok(session)
                }
                Some(_) => {
                    warn!("Cached credential belongs to different hardware");
                    *self.state.write().await = IdentityState::PairingRequired;
                    Err(SyncError::PairingRequired)
                }
                None => {
                    *self.state.write().await = IdentityState::PairingRequired;
                    Err(SyncError::PairingRequired)
                }
            },
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Pairing
    // -------------------------------------------------------------------------

    /// Requests device and user codes. Show `user_code` and
    /// `verification_uri` to the operator, then call
    /// [`poll_for_credential`](Self::poll_for_credential).
    pub async fn start_pairing(&self) -> SyncResult<DeviceAuthorization> {
        let request = DeviceAuthorizationRequest {
            client_id: self.client_id.clone(),
            device_fingerprint: self.fingerprint().await?,
            nickname: self.nickname.clone(),
        };

        let authorization = self.backend.request_device_authorization(&request).await?;
        info!(
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            expires_in = authorization.expires_in,
            "Pairing started"
        );
        Ok(authorization)
    }

    /// Polls the token endpoint until approval, denial, expiry or cancel.
    ///
    /// The deadline is the earlier of the code's `expires_in` and the
    /// configured maximum wait, and also bounds each poll request. One last
    /// poll is always sent at the deadline before giving up.
    pub async fn poll_for_credential(
        &self,
        authorization: &DeviceAuthorization,
        cancel: &CancellationToken,
    ) -> SyncResult<DeviceSession> {
        let lifetime = Duration::from_secs(authorization.expires_in).min(self.max_wait);
        let deadline = Instant::now() + lifetime;
        let mut interval = Duration::from_secs(authorization.interval.max(1));
        let request = TokenRequest::new(&authorization.device_code, &self.client_id);
        let mut attempt: u32 = 0;

        loop {
            // The last poll lands on the deadline itself.
            let wake = (Instant::now() + interval).min(deadline);
            let last_chance = wake >= deadline;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(attempt, "Pairing cancelled");
                    return Err(SyncError::PairingCancelled);
                }
                _ = sleep_until(wake) => {}
            }

            attempt += 1;
            let bound = if last_chance {
                Instant::now() + LAST_POLL_TIMEOUT
            } else {
                deadline
            };
            let poll = match timeout_at(bound, self.backend.poll_token(&request)).await {
                Ok(poll) => poll,
                Err(_) => {
                    warn!(attempt, "Pairing code expired during poll");
                    return Err(SyncError::PairingExpired);
                }
            };

            match poll {
                Ok(TokenPoll::Approved(credential)) => {
                    info!(
                        attempt,
                        device_id = %credential.device_id,
                        location_id = %credential.location_id,
                        "Pairing approved"
                    );
                    let fingerprint = self.fingerprint().await?;
                    return self
                        .install(credential, &fingerprint, IdentityState::Confirmed)
                        .await;
                }
                Ok(TokenPoll::Pending) => debug!(attempt, "Authorization pending"),
                Ok(TokenPoll::SlowDown) => {
                    interval += SLOW_DOWN_STEP;
                    debug!(attempt, interval_secs = interval.as_secs(), "Slowing down");
                }
                Ok(TokenPoll::Expired) => return Err(SyncError::PairingExpired),
                Ok(TokenPoll::Denied) => {
                    warn!(attempt, "Pairing denied by operator");
                    return Err(SyncError::PairingDenied);
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Token poll failed, retrying");
                }
                Err(e) => return Err(e),
            }

            if last_chance {
                warn!(attempt, "Pairing code expired before approval");
                return Err(SyncError::PairingExpired);
            }
        }
    }

    /// Clears the cached credential and the in-memory session.
    pub async fn forget(&self) -> SyncResult<bool> {
        let existed = self.credentials.clear().await?;
        *self.session.write().await = None;
        *self.state.write().await = IdentityState::PairingRequired;
        Ok(existed)
    }

    async fn install(
        &self,
        credential: DeviceCredential,
        fingerprint: &str,
        state: IdentityState,
    ) -> SyncResult<DeviceSession> {
        let session = DeviceSession::new(credential)?;
        self.credentials
            .save(session.credential(), fingerprint, self.clock.now())
            .await?;
        *self.session.write().await = Some(session.clone());
        *self.state.write().await = state;
        Ok(session)
    }

    async fn clear_identity(&self) -> SyncResult<()> {
        self.forget().await.map(|_| ())
    }
}
