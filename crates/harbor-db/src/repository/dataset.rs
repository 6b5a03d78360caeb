//! # Dataset Store
//!
//! Local replica of the server-owned datasets.
//!
//! ## Table Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DatasetKey      Table              Reference column                    │
//! │  ──────────────  ─────────────────  ─────────────────────────────────   │
//! │  categories      categories         parent_id   → categories(id)        │
//! │  products        products           category_id → categories(id)        │
//! │  users, taxes,   dataset_records    (none)                              │
//! │  inventory,      (dataset, id)                                          │
//! │  settings                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Entry Points
//! ```text
//! replace_all(key, records)        full snapshot, one transaction
//! update_from_backend(key, records) per-id upsert, one transaction
//! delete_records(key, ids)          tombstones, one transaction
//! apply_sync(key, batch)            upsert → delete → cursor, one transaction
//! ```
//!
//! Categories always go through the hierarchical planner, so a child is never
//! written before its parent. Orphans and cycles are reported in the
//! [`ApplyReport`] and left out. A product pointing at a category that does not
//! exist is reported the same way.
//!
//! ## Full Replace With Dependents
//! ```text
//! replace_all(categories):
//!   1. DELETE FROM products             (rows that reference categories)
//!   2. drop the products cursor         (products re-sync in full)
//!   3. DELETE FROM categories
//!   4. insert new categories wave by wave
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::repository::version;
use harbor_core::{
    plan_hierarchical_insert, DatasetKey, Record, StoredParents, UnresolvedReason,
    UnresolvedRecord,
};

// =============================================================================
// Reports & Batches
// =============================================================================

/// Outcome of a write to one dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Rows inserted or updated.
    pub upserted: usize,
    /// Rows removed by tombstones.
    pub deleted: usize,
    /// Records left out because their reference could not be satisfied.
    pub unresolved: Vec<UnresolvedRecord>,
    /// Rows cleared from structurally dependent datasets by a full replace.
    pub cleared_dependents: Vec<DatasetKey>,
}

/// Whether a sync response is a full snapshot or a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// A decoded sync response ready to be applied.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub mode: SyncMode,
    pub records: Vec<Record>,
    pub deleted_ids: Vec<String>,
    pub next_version: String,
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    parent_id: Option<String>,
    payload: String,
}

impl TryFrom<RecordRow> for Record {
    type Error = DbError;

    fn try_from(row: RecordRow) -> DbResult<Self> {
        Ok(Record {
            id: row.id,
            parent_id: row.parent_id,
            payload: serde_json::from_str(&row.payload)?,
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// Repository for replicated dataset records.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    pool: SqlitePool,
}

impl DatasetStore {
    /// Creates a new DatasetStore.
    pub fn new(pool: SqlitePool) -> Self {
        DatasetStore { pool }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Replaces the whole dataset with `records`.
    ///
    /// Either every surviving record is written or nothing changes.
    pub async fn replace_all(
        &self,
        key: DatasetKey,
        records: Vec<Record>,
        at: DateTime<Utc>,
    ) -> DbResult<ApplyReport> {
        let mut tx = self.pool.begin().await?;
        let report = replace_in(&mut tx, key, records, at).await?;
        tx.commit().await?;
        log_report(key, "replace", &report);
        Ok(report)
    }

    /// Inserts or updates `records` by id.
    pub async fn update_from_backend(
        &self,
        key: DatasetKey,
        records: Vec<Record>,
        at: DateTime<Utc>,
    ) -> DbResult<ApplyReport> {
        let mut tx = self.pool.begin().await?;
        let report = write_in(&mut tx, key, records, at).await?;
        tx.commit().await?;
        log_report(key, "upsert", &report);
        Ok(report)
    }

    /// Removes tombstoned ids. Unknown ids are ignored.
    pub async fn delete_records(&self, key: DatasetKey, ids: &[String]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_in(&mut tx, key, ids).await?;
        tx.commit().await?;
        debug!(dataset = %key, deleted, "Deleted tombstoned records");
        Ok(deleted)
    }

    /// Applies a sync response and advances the cursor in one transaction.
    ///
    /// The data step (replace or upsert) runs first, then tombstones, then the
    /// cursor moves to `next_version`. Any error rolls everything back, so the
    /// stored cursor still points at data that is fully present.
    pub async fn apply_sync(
        &self,
        key: DatasetKey,
        batch: SyncBatch,
        at: DateTime<Utc>,
    ) -> DbResult<ApplyReport> {
        let mut tx = self.pool.begin().await?;

        let mut report = match batch.mode {
            SyncMode::Full => replace_in(&mut tx, key, batch.records, at).await?,
            SyncMode::Incremental => write_in(&mut tx, key, batch.records, at).await?,
        };
        report.deleted = delete_in(&mut tx, key, &batch.deleted_ids).await?;
        version::upsert_in(&mut tx, key, &batch.next_version, at).await?;

        tx.commit().await?;

        log_report(key, "sync", &report);
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Every record of the dataset, ordered by id.
    pub async fn list(&self, key: DatasetKey) -> DbResult<Vec<Record>> {
        let sql = format!("{} ORDER BY id", select_sql(key));
        let mut query = sqlx::query_as::<_, RecordRow>(&sql);
        if let Table::Flat = Table::of(key) {
            query = query.bind(key.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Record::try_from).collect()
    }

    /// A single record by id.
    pub async fn get(&self, key: DatasetKey, id: &str) -> DbResult<Option<Record>> {
        let sql = match Table::of(key) {
            Table::Flat => format!("{} AND id = ?2", select_sql(key)),
            _ => format!("{} WHERE id = ?1", select_sql(key)),
        };
        let mut query = sqlx::query_as::<_, RecordRow>(&sql);
        if let Table::Flat = Table::of(key) {
            query = query.bind(key.as_str());
        }
        let row = query.bind(id).fetch_optional(&self.pool).await?;
        row.map(Record::try_from).transpose()
    }

    /// Deserializes a record's payload into `T`.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let tax: Option<TaxRule> = db.datasets().get_as(DatasetKey::Taxes, "vat").await?;
    /// ```
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        key: DatasetKey,
        id: &str,
    ) -> DbResult<Option<T>> {
        match self.get(key, id).await? {
            Some(record) => Ok(Some(serde_json::from_value(record.payload)?)),
            None => Ok(None),
        }
    }

    /// Number of records in the dataset.
    pub async fn count(&self, key: DatasetKey) -> DbResult<i64> {
        let count: i64 = match Table::of(key) {
            Table::Flat => {
                sqlx::query_scalar("SELECT COUNT(*) FROM dataset_records WHERE dataset = ?1")
                    .bind(key.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            table => {
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name()))
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

// =============================================================================
// Table Routing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Categories,
    Products,
    Flat,
}

impl Table {
    fn of(key: DatasetKey) -> Self {
        match key {
            DatasetKey::Categories => Table::Categories,
            DatasetKey::Products => Table::Products,
            _ => Table::Flat,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Table::Categories => "categories",
            Table::Products => "products",
            Table::Flat => "dataset_records",
        }
    }
}

fn select_sql(key: DatasetKey) -> &'static str {
    match Table::of(key) {
        Table::Categories => "SELECT id, parent_id, payload FROM categories",
        Table::Products => "SELECT id, category_id AS parent_id, payload FROM products",
        Table::Flat => {
            "SELECT id, NULL AS parent_id, payload FROM dataset_records WHERE dataset = ?1"
        }
    }
}

// =============================================================================
// Transaction-scoped helpers
// =============================================================================

async fn replace_in(
    conn: &mut SqliteConnection,
    key: DatasetKey,
    records: Vec<Record>,
    at: DateTime<Utc>,
) -> DbResult<ApplyReport> {
    let mut cleared = Vec::new();

    // Dependents go first; their rows reference the rows about to be removed.
    for dependent in key.structural_dependents() {
        clear_in(conn, *dependent).await?;
        version::delete_in(conn, *dependent).await?;
        info!(
            dataset = %key,
            dependent = %dependent,
            "Cleared dependent dataset ahead of full replace"
        );
        cleared.push(*dependent);
    }
    clear_in(conn, key).await?;

    let mut report = write_in(conn, key, records, at).await?;
    report.cleared_dependents = cleared;
    Ok(report)
}

async fn write_in(
    conn: &mut SqliteConnection,
    key: DatasetKey,
    records: Vec<Record>,
    at: DateTime<Utc>,
) -> DbResult<ApplyReport> {
    match Table::of(key) {
        Table::Categories => {
            let stored = category_parents(conn).await?;
            let plan = plan_hierarchical_insert(records, &stored);
            let unresolved = plan.unresolved.clone();
            let mut upserted = 0;
            for (wave_no, wave) in plan.waves.into_iter().enumerate() {
                debug!(dataset = %key, wave = wave_no + 1, size = wave.len(), "Writing wave");
                for record in &wave {
                    upsert_category(conn, record, at).await?;
                    upserted += 1;
                }
            }
            Ok(ApplyReport {
                upserted,
                unresolved,
                ..Default::default()
            })
        }
        Table::Products => {
            let categories: HashSet<String> = category_parents(conn).await?.into_keys().collect();
            let mut report = ApplyReport::default();
            for record in records {
                match record.parent_id.as_deref() {
                    Some(category) if !categories.contains(category) => {
                        report.unresolved.push(UnresolvedRecord {
                            id: record.id.clone(),
                            parent_id: category.to_string(),
                            reason: UnresolvedReason::Orphan {
                                missing_parent: category.to_string(),
                            },
                        });
                    }
                    _ => {
                        upsert_product(conn, &record, at).await?;
                        report.upserted += 1;
                    }
                }
            }
            Ok(report)
        }
        Table::Flat => {
            let mut upserted = 0;
            for record in &records {
                upsert_flat(conn, key, record, at).await?;
                upserted += 1;
            }
            Ok(ApplyReport {
                upserted,
                ..Default::default()
            })
        }
    }
}

async fn delete_in(conn: &mut SqliteConnection, key: DatasetKey, ids: &[String]) -> DbResult<usize> {
    let mut deleted = 0;
    for id in ids {
        let result = match Table::of(key) {
            Table::Flat => {
                sqlx::query("DELETE FROM dataset_records WHERE dataset = ?1 AND id = ?2")
                    .bind(key.as_str())
                    .bind(id)
                    .execute(&mut *conn)
                    .await?
            }
            table => {
                sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", table.name()))
                    .bind(id)
                    .execute(&mut *conn)
                    .await?
            }
        };
        deleted += result.rows_affected() as usize;
    }
    Ok(deleted)
}

async fn clear_in(conn: &mut SqliteConnection, key: DatasetKey) -> DbResult<()> {
    match Table::of(key) {
        Table::Flat => {
            sqlx::query("DELETE FROM dataset_records WHERE dataset = ?1")
                .bind(key.as_str())
                .execute(&mut *conn)
                .await?;
        }
        table => {
            sqlx::query(&format!("DELETE FROM {}", table.name()))
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn category_parents(conn: &mut SqliteConnection) -> DbResult<StoredParents> {
    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT id, parent_id FROM categories")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect::<HashMap<_, _>>())
}

async fn upsert_category(
    conn: &mut SqliteConnection,
    record: &Record,
    at: DateTime<Utc>,
) -> DbResult<()> {
    // ON CONFLICT keeps the row in place; REPLACE would delete it and null
    // out every child's parent_id.
    sqlx::query(
        r#"
        INSERT INTO categories (id, parent_id, payload, synced_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            parent_id = excluded.parent_id,
            payload = excluded.payload,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(&record.id)
    .bind(&record.parent_id)
    .bind(record.payload.to_string())
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_product(
    conn: &mut SqliteConnection,
    record: &Record,
    at: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO products (id, category_id, payload, synced_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            category_id = excluded.category_id,
            payload = excluded.payload,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(&record.id)
    .bind(&record.parent_id)
    .bind(record.payload.to_string())
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_flat(
    conn: &mut SqliteConnection,
    key: DatasetKey,
    record: &Record,
    at: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dataset_records (dataset, id, payload, synced_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(dataset, id) DO UPDATE SET
            payload = excluded.payload,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(key.as_str())
    .bind(&record.id)
    .bind(record.payload.to_string())
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn log_report(key: DatasetKey, op: &str, report: &ApplyReport) {
    for skipped in &report.unresolved {
        warn!(
            dataset = %key,
            id = %skipped.id,
            parent = %skipped.parent_id,
            reason = ?skipped.reason,
            "Excluded record with unresolvable reference"
        );
    }
    debug!(
        dataset = %key,
        op,
        upserted = report.upserted,
        deleted = report.deleted,
        excluded = report.unresolved.len(),
        "Dataset write committed"
    );
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde::Deserialize;
    use serde_json::json;

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn cat(id: &str, parent: Option<&str>) -> Record {
        let record = Record::new(id, json!({"id": id, "name": format!("cat {id}")}));
        match parent {
            Some(p) => record.with_parent(p),
            None => record,
        }
    }

    fn product(id: &str, category: Option<&str>) -> Record {
        let record = Record::new(id, json!({"id": id, "category_id": category}));
        match category {
            Some(c) => record.with_parent(c),
            None => record,
        }
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_replace_all_hierarchical_reports_orphan() {
        let db = db().await;
        let store = db.datasets();

        let report = store
            .replace_all(
                DatasetKey::Categories,
                vec![cat("3", Some("99")), cat("2", Some("1")), cat("1", None)],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(report.upserted, 2);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].id, "3");

        let stored = store.list(DatasetKey::Categories).await.unwrap();
        assert_eq!(ids(&stored), vec!["1", "2"]);
        assert_eq!(stored[1].parent_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_replace_all_cycle_inserts_nothing() {
        let db = db().await;
        let report = db
            .datasets()
            .replace_all(
                DatasetKey::Categories,
                vec![cat("1", Some("2")), cat("2", Some("1"))],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(report.upserted, 0);
        assert_eq!(report.unresolved.len(), 2);
        assert_eq!(db.datasets().count(DatasetKey::Categories).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_categories_clears_products_and_cursor() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .replace_all(DatasetKey::Categories, vec![cat("c1", None)], now)
            .await
            .unwrap();
        store
            .replace_all(DatasetKey::Products, vec![product("p1", Some("c1"))], now)
            .await
            .unwrap();
        db.versions().set(DatasetKey::Products, "7", now).await.unwrap();

        let report = store
            .replace_all(DatasetKey::Categories, vec![cat("c2", None)], now)
            .await
            .unwrap();

        assert_eq!(report.cleared_dependents, vec![DatasetKey::Products]);
        assert_eq!(store.count(DatasetKey::Products).await.unwrap(), 0);
        assert!(db.versions().get(DatasetKey::Products).await.unwrap().is_none());
        assert_eq!(
            ids(&store.list(DatasetKey::Categories).await.unwrap()),
            vec!["c2"]
        );
    }

    #[tokio::test]
    async fn test_product_with_missing_category_excluded() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .replace_all(DatasetKey::Categories, vec![cat("c1", None)], now)
            .await
            .unwrap();
        let report = store
            .update_from_backend(
                DatasetKey::Products,
                vec![
                    product("p1", Some("c1")),
                    product("p2", Some("gone")),
                    product("p3", None),
                ],
                now,
            )
            .await
            .unwrap();

        assert_eq!(report.upserted, 2);
        assert_eq!(report.unresolved[0].id, "p2");
        assert_eq!(
            ids(&store.list(DatasetKey::Products).await.unwrap()),
            vec!["p1", "p3"]
        );
    }

    #[tokio::test]
    async fn test_update_from_backend_upserts_and_attaches_to_stored_parent() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .replace_all(DatasetKey::Categories, vec![cat("root", None)], now)
            .await
            .unwrap();
        store
            .update_from_backend(
                DatasetKey::Categories,
                vec![
                    cat("leaf", Some("mid")),
                    cat("mid", Some("root")),
                    Record::new("root", json!({"id": "root", "name": "renamed"})),
                ],
                now,
            )
            .await
            .unwrap();

        let root = store.get(DatasetKey::Categories, "root").await.unwrap().unwrap();
        assert_eq!(root.payload["name"], "renamed");
        assert_eq!(store.count(DatasetKey::Categories).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_deleting_category_nulls_product_reference() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .replace_all(DatasetKey::Categories, vec![cat("c1", None)], now)
            .await
            .unwrap();
        store
            .update_from_backend(DatasetKey::Products, vec![product("p1", Some("c1"))], now)
            .await
            .unwrap();

        let deleted = store
            .delete_records(DatasetKey::Categories, &["c1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let p1 = store.get(DatasetKey::Products, "p1").await.unwrap().unwrap();
        assert_eq!(p1.parent_id, None);
    }

    #[tokio::test]
    async fn test_flat_datasets_are_isolated() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .replace_all(DatasetKey::Users, vec![Record::new("1", json!({"id": 1}))], now)
            .await
            .unwrap();
        store
            .replace_all(DatasetKey::Taxes, vec![Record::new("1", json!({"id": 1}))], now)
            .await
            .unwrap();
        store
            .replace_all(DatasetKey::Users, vec![Record::new("2", json!({"id": 2}))], now)
            .await
            .unwrap();

        assert_eq!(ids(&store.list(DatasetKey::Users).await.unwrap()), vec!["2"]);
        assert_eq!(store.count(DatasetKey::Taxes).await.unwrap(), 1);
        assert!(store.get(DatasetKey::Users, "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_sync_advances_cursor_with_data() {
        let db = db().await;
        let store = db.datasets();
        let now = Utc::now();

        store
            .apply_sync(
                DatasetKey::Taxes,
                SyncBatch {
                    mode: SyncMode::Full,
                    records: vec![
                        Record::new("vat", json!({"id": "vat", "rate_bps": 2000})),
                        Record::new("old", json!({"id": "old"})),
                    ],
                    deleted_ids: vec![],
                    next_version: "1".into(),
                },
                now,
            )
            .await
            .unwrap();

        let report = store
            .apply_sync(
                DatasetKey::Taxes,
                SyncBatch {
                    mode: SyncMode::Incremental,
                    records: vec![Record::new("vat", json!({"id": "vat", "rate_bps": 2100}))],
                    deleted_ids: vec!["old".into()],
                    next_version: "2".into(),
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(report.upserted, 1);
        assert_eq!(report.deleted, 1);
        let cursor = db.versions().get(DatasetKey::Taxes).await.unwrap().unwrap();
        assert_eq!(cursor.version_token, "2");
        assert_eq!(ids(&store.list(DatasetKey::Taxes).await.unwrap()), vec!["vat"]);
    }

    #[tokio::test]
    async fn test_resume_after_crash_before_cursor_matches_uninterrupted() {
        let delta = SyncBatch {
            mode: SyncMode::Incremental,
            records: vec![Record::new("a", json!({"id": "a", "v": 2}))],
            deleted_ids: vec!["b".into()],
            next_version: "2".into(),
        };
        let base = vec![
            Record::new("a", json!({"id": "a", "v": 1})),
            Record::new("b", json!({"id": "b"})),
        ];
        let now = Utc::now();

        // Uninterrupted run.
        let clean = db().await;
        clean
            .datasets()
            .replace_all(DatasetKey::Inventory, base.clone(), now)
            .await
            .unwrap();
        clean
            .datasets()
            .apply_sync(DatasetKey::Inventory, delta.clone(), now)
            .await
            .unwrap();

        // Data applied, process dies before the cursor moves, pass re-runs.
        let crashed = db().await;
        crashed
            .datasets()
            .replace_all(DatasetKey::Inventory, base, now)
            .await
            .unwrap();
        crashed
            .datasets()
            .update_from_backend(DatasetKey::Inventory, delta.records.clone(), now)
            .await
            .unwrap();
        crashed
            .datasets()
            .delete_records(DatasetKey::Inventory, &delta.deleted_ids)
            .await
            .unwrap();
        assert!(crashed
            .versions()
            .get(DatasetKey::Inventory)
            .await
            .unwrap()
            .is_none());
        crashed
            .datasets()
            .apply_sync(DatasetKey::Inventory, delta, now)
            .await
            .unwrap();

        assert_eq!(
            clean.datasets().list(DatasetKey::Inventory).await.unwrap(),
            crashed.datasets().list(DatasetKey::Inventory).await.unwrap()
        );
        assert_eq!(
            clean.versions().snapshot().await.unwrap(),
            crashed.versions().snapshot().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_get_as_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Tax {
            id: String,
            rate_bps: u32,
        }

        let db = db().await;
        db.datasets()
            .replace_all(
                DatasetKey::Taxes,
                vec![Record::new("vat", json!({"id": "vat", "rate_bps": 2000}))],
                Utc::now(),
            )
            .await
            .unwrap();

        let tax: Option<Tax> = db.datasets().get_as(DatasetKey::Taxes, "vat").await.unwrap();
        assert_eq!(
            tax,
            Some(Tax {
                id: "vat".into(),
                rate_bps: 2000
            })
        );
        let missing: Option<Tax> = db.datasets().get_as(DatasetKey::Taxes, "x").await.unwrap();
        assert!(missing.is_none());
    }
}
