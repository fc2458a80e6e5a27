//! SQLite document store
//!
//! Layout:
//! - one database file per day: `<data_dir>/<prefix>-<YYYY-MM-DD>.db`
//! - one table per storage target, primary key (stream_id, bucket_ms, action),
//!   the aggregate stored as a JSON document
//! - `applied_flushes` records every applied flush id; a request whose id is
//!   already present is skipped, which makes retries idempotent
//!
//! All rusqlite calls run inside `spawn_blocking`. Each day holds a single
//! connection behind a mutex; writers for the same day serialize on it.

use super::store::{DayCollections, DocumentStore, StoreError, UpsertOutcome};
use super::types::{Aggregate, AggregateKey, FlushRequest};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct SqliteDocumentStore {
    data_dir: PathBuf,
    prefix: String,
}

impl SqliteDocumentStore {
    /// Create the store, making sure `data_dir` exists
    pub fn new(data_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            prefix: prefix.into(),
        })
    }

    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}.db", self.prefix, day.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn open_day(
        &self,
        day: NaiveDate,
        targets: &[String],
    ) -> Result<Arc<dyn DayCollections>, StoreError> {
        let path = self.day_path(day);
        let targets = targets.to_vec();

        let collections = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let conn = open_connection(&path)?;
            let mut day_conn = DayConnection {
                conn,
                tables: HashSet::new(),
            };
            for target in &targets {
                day_conn.ensure_table(target)?;
            }
            log::info!(
                "📂 Opened {} ({} collections)",
                path.display(),
                day_conn.tables.len()
            );
            Ok(SqliteDayCollections {
                day,
                path,
                inner: Arc::new(Mutex::new(Some(day_conn))),
            })
        })
        .await??;

        Ok(Arc::new(collections))
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

/// Open a day database with WAL journaling and the bookkeeping table
pub fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS applied_flushes (
            flush_id   TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("⚠️  SQLite refused WAL mode, journal_mode={}", mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

/// Table name for a storage target: non-alphanumerics become `_`
pub fn table_name(storage_target: &str) -> String {
    let sanitized: String = storage_target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("agg_{}", sanitized)
}

/// Read back one stored aggregate
pub fn load_document(
    conn: &Connection,
    storage_target: &str,
    key: &AggregateKey,
) -> Result<Option<Aggregate>, StoreError> {
    let sql = format!(
        "SELECT doc FROM \"{}\" WHERE stream_id = ?1 AND bucket_ms = ?2 AND action = ?3",
        table_name(storage_target)
    );
    let doc: Option<String> = conn
        .query_row(&sql, params![key.stream_id, key.bucket_ms, key.action], |row| {
            row.get(0)
        })
        .optional()?;
    match doc {
        Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
        None => Ok(None),
    }
}

struct DayConnection {
    conn: Connection,
    tables: HashSet<String>,
}

impl DayConnection {
    fn ensure_table(&mut self, storage_target: &str) -> Result<String, StoreError> {
        let table = table_name(storage_target);
        if !self.tables.contains(&table) {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    stream_id  TEXT    NOT NULL,
                    bucket_ms  INTEGER NOT NULL,
                    action     TEXT    NOT NULL,
                    count      INTEGER NOT NULL,
                    doc        TEXT    NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (stream_id, bucket_ms, action)
                );"
            ))?;
            self.tables.insert(table.clone());
        }
        Ok(table)
    }

    /// Apply a flush request in one transaction
    fn upsert(&mut self, request: &FlushRequest) -> Result<UpsertOutcome, StoreError> {
        let table = self.ensure_table(&request.storage_target)?;
        let now = chrono::Utc::now().timestamp_millis();

        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO applied_flushes (flush_id, applied_at) VALUES (?1, ?2)",
            params![request.id, now],
        )?;
        if inserted == 0 {
            // Dropping the transaction rolls it back
            return Ok(UpsertOutcome {
                documents: 0,
                duplicate: true,
            });
        }

        {
            let mut select = tx.prepare_cached(&format!(
                "SELECT doc FROM \"{table}\" WHERE stream_id = ?1 AND bucket_ms = ?2 AND action = ?3"
            ))?;
            let mut upsert = tx.prepare_cached(&format!(
                "INSERT INTO \"{table}\" (stream_id, bucket_ms, action, count, doc, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(stream_id, bucket_ms, action) DO UPDATE SET
                    count = excluded.count,
                    doc = excluded.doc,
                    updated_at = excluded.updated_at"
            ))?;

            for (key, aggregate) in &request.entries {
                let existing: Option<String> = select
                    .query_row(params![key.stream_id, key.bucket_ms, key.action], |row| {
                        row.get(0)
                    })
                    .optional()?;

                let mut merged = match existing {
                    Some(doc) => serde_json::from_str::<Aggregate>(&doc)?,
                    None => Aggregate::default(),
                };
                merged.merge(aggregate);

                upsert.execute(params![
                    key.stream_id,
                    key.bucket_ms,
                    key.action,
                    merged.count as i64,
                    serde_json::to_string(&merged)?,
                    now
                ])?;
            }
        }

        tx.commit()?;
        Ok(UpsertOutcome {
            documents: request.len(),
            duplicate: false,
        })
    }
}

pub struct SqliteDayCollections {
    day: NaiveDate,
    path: PathBuf,
    inner: Arc<Mutex<Option<DayConnection>>>,
}

impl SqliteDayCollections {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock(inner: &Mutex<Option<DayConnection>>) -> MutexGuard<'_, Option<DayConnection>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DayCollections for SqliteDayCollections {
    fn day(&self) -> NaiveDate {
        self.day
    }

    async fn upsert(&self, request: &FlushRequest) -> Result<UpsertOutcome, StoreError> {
        let inner = self.inner.clone();
        let request = request.clone();
        let day = self.day;

        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&inner);
            let day_conn = guard.as_mut().ok_or(StoreError::Closed(day))?;
            day_conn.upsert(&request)
        })
        .await?
    }

    async fn close(&self) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            if let Some(day_conn) = lock(&inner).take() {
                day_conn.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
                log::info!("📁 Closed {}", path.display());
            }
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processor::MAX_TIMING_MS;
    use crate::pipeline::types::{ApdexClass, TimingStats, ALL_PAGES};
    use tempfile::tempdir;

    fn make_aggregate(count: u64, total_ms: f64) -> Aggregate {
        let mut aggregate = Aggregate {
            count,
            ..Default::default()
        };
        aggregate
            .timings
            .insert("total_time".to_string(), TimingStats::from_value(total_ms));
        for _ in 0..count {
            aggregate.apdex.record(ApdexClass::Tolerated);
        }
        aggregate
    }

    fn make_request(
        id: &str,
        day: NaiveDate,
        target: &str,
        entries: Vec<(AggregateKey, Aggregate)>,
    ) -> FlushRequest {
        FlushRequest {
            id: id.to_string(),
            day,
            storage_target: target.to_string(),
            writer: 0,
            entries,
        }
    }

    #[test]
    fn test_table_name_sanitizes() {
        assert_eq!(table_name("logflow-shop-production"), "agg_logflow_shop_production");
        assert_eq!(table_name("a.b c\"d"), "agg_a_b_c_d");
    }

    #[tokio::test]
    async fn test_open_day_creates_file_and_tables() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path().join("data"), "logflow").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();

        let handle = store.open_day(day, &["shop".to_string()]).await.unwrap();
        assert_eq!(handle.day(), day);

        let path = store.day_path(day);
        assert!(path.ends_with("logflow-2024-02-29.db"));
        assert!(path.exists());

        let conn = Connection::open(&path).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('agg_shop', 'applied_flushes')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_merges_existing_documents() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path(), "logflow").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &[]).await.unwrap();
        let key = AggregateKey::new("shop-production", 120_000, "Orders#show");

        let first = handle
            .upsert(&make_request("run-u0-1", day, "shop", vec![(key.clone(), make_aggregate(2, 100.0))]))
            .await
            .unwrap();
        assert_eq!(first.documents, 1);

        handle
            .upsert(&make_request("run-u0-2", day, "shop", vec![(key.clone(), make_aggregate(1, 300.0))]))
            .await
            .unwrap();
        handle.close().await.unwrap();

        let conn = Connection::open(store.day_path(day)).unwrap();
        let doc = load_document(&conn, "shop", &key).unwrap().unwrap();
        assert_eq!(doc.count, 3);
        assert_eq!(doc.apdex.tolerated, 3);
        let total = doc.timing("total_time").unwrap();
        assert_eq!(total.sum, 400.0);
        assert_eq!(total.min, 100.0);
        assert_eq!(total.max, 300.0);
    }

    #[tokio::test]
    async fn test_reapplying_a_flush_is_a_no_op() {
        // Test: the same FlushRequest applied twice leaves the store as after one application
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path(), "logflow").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &[]).await.unwrap();
        let key = AggregateKey::new("shop-production", 0, "Orders#show");
        let request = make_request("run-u1-7", day, "shop", vec![(key.clone(), make_aggregate(4, 50.0))]);

        let first = handle.upsert(&request).await.unwrap();
        let second = handle.upsert(&request).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.documents, 0);

        // Survives reopening the day as well
        handle.close().await.unwrap();
        let reopened = store.open_day(day, &[]).await.unwrap();
        assert!(reopened.upsert(&request).await.unwrap().duplicate);
        reopened.close().await.unwrap();

        let conn = Connection::open(store.day_path(day)).unwrap();
        assert_eq!(load_document(&conn, "shop", &key).unwrap().unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_largest_timing_survives_repeated_upserts() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path(), "logflow").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &[]).await.unwrap();
        let key = AggregateKey::new("shop-production", 0, ALL_PAGES);

        for id in ["run-u0-1", "run-u0-2", "run-u0-3"] {
            let outcome = handle
                .upsert(&make_request(id, day, "shop", vec![(key.clone(), make_aggregate(1, MAX_TIMING_MS))]))
                .await
                .unwrap();
            assert_eq!(outcome.documents, 1);
        }
        handle.close().await.unwrap();

        let conn = Connection::open(store.day_path(day)).unwrap();
        let doc = load_document(&conn, "shop", &key).unwrap().unwrap();
        let total = doc.timing("total_time").unwrap();
        assert_eq!(doc.count, 3);
        assert_eq!(total.sum, 3.0 * MAX_TIMING_MS);
        assert!(total.sum_sq.is_finite());
    }

    #[tokio::test]
    async fn test_upsert_after_close_fails() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path(), "logflow").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &[]).await.unwrap();
        handle.close().await.unwrap();

        let request = make_request("x", day, "shop", vec![]);
        assert!(matches!(handle.upsert(&request).await, Err(StoreError::Closed(_))));
    }
}
