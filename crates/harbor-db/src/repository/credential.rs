//! # Device Credential Repository
//!
//! Single-row cache of the credential issued at pairing.
//!
//! The backend's by-fingerprint lookup is authoritative; this row only lets
//! the terminal keep working when the backend is unreachable at startup.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use crate::error::DbResult;
use harbor_core::DeviceCredential;

/// A cached credential with the fingerprint it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub credential: DeviceCredential,
    pub fingerprint: String,
    pub paired_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct CredentialRow {
    device_id: String,
    tenant_id: String,
    tenant_slug: String,
    location_id: String,
    signing_secret: String,
    nickname: Option<String>,
    fingerprint: String,
    paired_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CredentialRow> for StoredCredential {
    fn from(row: CredentialRow) -> Self {
        StoredCredential {
            credential: DeviceCredential {
                device_id: row.device_id,
                tenant_id: row.tenant_id,
                tenant_slug: row.tenant_slug,
                location_id: row.location_id,
                signing_secret: row.signing_secret,
                nickname: row.nickname,
            },
            fingerprint: row.fingerprint,
            paired_at: row.paired_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for the device credential.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    /// Creates a new CredentialRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CredentialRepository { pool }
    }

    /// Stores `credential`, replacing any previous one.
    ///
    /// `paired_at` is kept when the same device is refreshed from the backend.
    pub async fn save(
        &self,
        credential: &DeviceCredential,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_credential (
                slot, device_id, tenant_id, tenant_slug, location_id,
                signing_secret, nickname, fingerprint, paired_at, updated_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(slot) DO UPDATE SET
                paired_at = CASE
                    WHEN device_credential.device_id = excluded.device_id
                    THEN device_credential.paired_at
                    ELSE excluded.paired_at
                END,
                device_id = excluded.device_id,
                tenant_id = excluded.tenant_id,
                tenant_slug = excluded.tenant_slug,
                location_id = excluded.location_id,
                signing_secret = excluded.signing_secret,
                nickname = excluded.nickname,
                fingerprint = excluded.fingerprint,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.device_id)
        .bind(&credential.tenant_id)
        .bind(&credential.tenant_slug)
        .bind(&credential.location_id)
        .bind(&credential.signing_secret)
        .bind(&credential.nickname)
        .bind(fingerprint)
        .bind(at)
        .execute(&self.pool)
        .await?;

        info!(
            device_id = %credential.device_id,
            location_id = %credential.location_id,
            "Device credential stored"
        );
        Ok(())
    }

    /// Loads the cached credential, if any.
    pub async fn load(&self) -> DbResult<Option<StoredCredential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT device_id, tenant_id, tenant_slug, location_id, signing_secret,
                   nickname, fingerprint, paired_at, updated_at
            FROM device_credential
            WHERE slot = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredCredential::from))
    }

    /// Removes the cached credential. Returns true if one existed.
    pub async fn clear(&self) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM device_credential")
            .execute(&self.pool)
            .await?;
        let cleared = result.rows_affected() > 0;
        if cleared {
            warn!("Device credential cleared");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;

    fn credential(device: &str, location: &str) -> DeviceCredential {
        DeviceCredential {
            device_id: device.into(),
            tenant_id: "tenant-1".into(),
            tenant_slug: "harbor-cafe".into(),
            location_id: location.into(),
            signing_secret: "a1b2c3d4".into(),
            nickname: Some("Front till".into()),
        }
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.credentials();
        assert!(repo.load().await.unwrap().is_none());

        let paired = Utc::now() - Duration::days(3);
        repo.save(&credential("dev-1", "loc-1"), "fp-1", paired)
            .await
            .unwrap();

        let stored = repo.load().await.unwrap().unwrap();
        assert_eq!(stored.credential, credential("dev-1", "loc-1"));
        assert_eq!(stored.fingerprint, "fp-1");

        assert!(repo.clear().await.unwrap());
        assert!(!repo.clear().await.unwrap());
        assert!(repo.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_single_row_and_paired_at() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.credentials();
        let paired = Utc::now() - Duration::days(3);
        let refreshed = Utc::now();

        repo.save(&credential("dev-1", "loc-1"), "fp", paired)
            .await
            .unwrap();
        repo.save(&credential("dev-1", "loc-2"), "fp", refreshed)
            .await
            .unwrap();

        let stored = repo.load().await.unwrap().unwrap();
        assert_eq!(stored.credential.location_id, "loc-2");
        assert_eq!(stored.paired_at, paired);
        assert_eq!(stored.updated_at, refreshed);

        repo.save(&credential("dev-2", "loc-2"), "fp", refreshed)
            .await
            .unwrap();
        assert_eq!(repo.load().await.unwrap().unwrap().paired_at, refreshed);
    }
}
