//! Document store abstraction behind the resource pool
//!
//! A `DocumentStore` opens the collections for one calendar day. The
//! returned `DayCollections` handle performs idempotent upserts keyed by
//! (stream_id, bucket, action), one collection per storage target.
//!
//! Implementations:
//! - `SqliteDocumentStore` (db.rs) - one database file per day
//! - `MemoryDocumentStore` (memory.rs) - in-process, for tests and embedding
//! - `DryRunStore` - logs what would be written, mutates nothing

use super::types::FlushRequest;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Collections for {0} are closed")]
    Closed(NaiveDate),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of applying one `FlushRequest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Documents created or updated
    pub documents: usize,
    /// The request id had already been applied; nothing changed
    pub duplicate: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open (creating if needed) the collections for `day`
    ///
    /// `targets` are created eagerly; unknown targets met later are created on first upsert.
    async fn open_day(
        &self,
        day: NaiveDate,
        targets: &[String],
    ) -> Result<Arc<dyn DayCollections>, StoreError>;

    fn backend_type(&self) -> &'static str;
}

#[async_trait]
pub trait DayCollections: Send + Sync {
    fn day(&self) -> NaiveDate;

    /// Merge every entry of `request` into its document, atomically
    ///
    /// Applying a request whose id was already applied is a no-op that
    /// reports `duplicate: true`.
    async fn upsert(&self, request: &FlushRequest) -> Result<UpsertOutcome, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Store used in dry-run mode
#[derive(Debug, Default, Clone)]
pub struct DryRunStore;

struct DryRunDay {
    day: NaiveDate,
}

#[async_trait]
impl DocumentStore for DryRunStore {
    async fn open_day(
        &self,
        day: NaiveDate,
        targets: &[String],
    ) -> Result<Arc<dyn DayCollections>, StoreError> {
        log::info!(
            "🧪 [dry-run] would open collections for {} ({} targets)",
            day,
            targets.len()
        );
        Ok(Arc::new(DryRunDay { day }))
    }

    fn backend_type(&self) -> &'static str {
        "dry-run"
    }
}

#[async_trait]
impl DayCollections for DryRunDay {
    fn day(&self) -> NaiveDate {
        self.day
    }

    async fn upsert(&self, request: &FlushRequest) -> Result<UpsertOutcome, StoreError> {
        log::info!(
            "🧪 [dry-run] would upsert {} documents into {} ({})",
            request.len(),
            request.storage_target,
            self.day
        );
        for (key, aggregate) in &request.entries {
            log::debug!(
                "   ├─ {} count={} apdex={:?}",
                key,
                aggregate.count,
                aggregate.apdex
            );
        }
        Ok(UpsertOutcome {
            documents: request.len(),
            duplicate: false,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        log::info!("🧪 [dry-run] would close collections for {}", self.day);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Aggregate, AggregateKey};

    #[tokio::test]
    async fn test_dry_run_reports_without_state() {
        let store = DryRunStore;
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &["shop".to_string()]).await.unwrap();

        let request = FlushRequest {
            id: "run-u0-1".to_string(),
            day,
            storage_target: "shop".to_string(),
            writer: 0,
            entries: vec![(AggregateKey::new("shop-production", 0, "a"), Aggregate::default())],
        };

        // Same id twice: dry run never records anything, so neither is a duplicate
        for _ in 0..2 {
            let outcome = handle.upsert(&request).await.unwrap();
            assert_eq!(
                outcome,
                UpsertOutcome {
                    documents: 1,
                    duplicate: false
                }
            );
        }
        assert_eq!(handle.day(), day);
        assert!(handle.close().await.is_ok());
        assert_eq!(store.backend_type(), "dry-run");
    }
}
