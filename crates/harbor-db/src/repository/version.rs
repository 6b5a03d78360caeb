//! # Version Cursor Repository
//!
//! One row per dataset recording the last `next_version` fully applied.
//!
//! Cursors are written inside the same transaction as the dataset changes
//! they describe (see [`DatasetStore::apply_sync`]), so a cursor can never
//! point past data that was not committed.
//!
//! [`DatasetStore::apply_sync`]: crate::repository::dataset::DatasetStore::apply_sync

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use harbor_core::{DatasetKey, DatasetVersion};

#[derive(Debug, FromRow)]
struct VersionRow {
    dataset_key: String,
    version_token: String,
    synced_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for DatasetVersion {
    type Error = DbError;

    fn try_from(row: VersionRow) -> DbResult<Self> {
        Ok(DatasetVersion {
            dataset_key: row
                .dataset_key
                .parse()
                .map_err(|e| DbError::corrupt("dataset_key", e))?,
            version_token: row.version_token,
            synced_at: row.synced_at,
        })
    }
}

/// Repository for dataset version cursors.
#[derive(Debug, Clone)]
pub struct VersionRepository {
    pool: SqlitePool,
}

impl VersionRepository {
    /// Creates a new VersionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        VersionRepository { pool }
    }

    /// Returns the cursor for `key`, if the dataset has ever synced.
    pub async fn get(&self, key: DatasetKey) -> DbResult<Option<DatasetVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            r#"
            SELECT dataset_key, version_token, synced_at
            FROM dataset_versions
            WHERE dataset_key = ?1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DatasetVersion::try_from).transpose()
    }

    /// Returns every stored cursor, ordered by dataset name.
    pub async fn all(&self) -> DbResult<Vec<DatasetVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            r#"
            SELECT dataset_key, version_token, synced_at
            FROM dataset_versions
            ORDER BY dataset_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DatasetVersion::try_from).collect()
    }

    /// `dataset → version_token` for every synced dataset.
    ///
    /// This is the snapshot attached to each order delivery attempt.
    pub async fn snapshot(&self) -> DbResult<BTreeMap<String, String>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .map(|v| (v.dataset_key.to_string(), v.version_token))
            .collect())
    }

    /// Sets the cursor outside a dataset apply.
    pub async fn set(&self, key: DatasetKey, token: &str, at: DateTime<Utc>) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_in(&mut conn, key, token, at).await
    }

    /// Drops the cursor so the next pass performs a full sync.
    pub async fn reset(&self, key: DatasetKey) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        delete_in(&mut conn, key).await
    }
}

// =============================================================================
// Transaction-scoped helpers
// =============================================================================

pub(crate) async fn upsert_in(
    conn: &mut SqliteConnection,
    key: DatasetKey,
    token: &str,
    at: DateTime<Utc>,
) -> DbResult<()> {
    debug!(dataset = %key, version = %token, "Advancing dataset cursor");

    sqlx::query(
        r#"
        INSERT INTO dataset_versions (dataset_key, version_token, synced_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(dataset_key) DO UPDATE SET
            version_token = excluded.version_token,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(key.as_str())
    .bind(token)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn delete_in(conn: &mut SqliteConnection, key: DatasetKey) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM dataset_versions WHERE dataset_key = ?1")
        .bind(key.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}
