//! In-process document store
//!
//! Keeps documents in a shared map. Clones share state, so a test can hand
//! one clone to the pipeline and inspect another. Supports injected write
//! failures and write latency for retry and rollover scenarios.

use super::store::{DayCollections, DocumentStore, StoreError, UpsertOutcome};
use super::types::{Aggregate, AggregateKey, FlushRequest};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<(NaiveDate, String), BTreeMap<AggregateKey, Aggregate>>,
    applied: HashSet<(NaiveDate, String)>,
    opened: Vec<NaiveDate>,
    closed: Vec<NaiveDate>,
    write_failures: usize,
    open_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
    write_latency: Duration,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert sleeps this long before touching state
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// The next `n` upserts fail with `StoreError::Unavailable`
    pub fn fail_next_writes(&self, n: usize) {
        self.state().write_failures = n;
    }

    /// The next `n` `open_day` calls fail
    pub fn fail_next_opens(&self, n: usize) {
        self.state().open_failures = n;
    }

    pub fn document(&self, day: NaiveDate, target: &str, key: &AggregateKey) -> Option<Aggregate> {
        self.state()
            .documents
            .get(&(day, target.to_string()))
            .and_then(|docs| docs.get(key))
            .cloned()
    }

    pub fn documents(&self, day: NaiveDate, target: &str) -> Vec<(AggregateKey, Aggregate)> {
        self.state()
            .documents
            .get(&(day, target.to_string()))
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn document_count(&self) -> usize {
        self.state().documents.values().map(BTreeMap::len).sum()
    }

    /// Days in the order `open_day` succeeded for them
    pub fn opened_days(&self) -> Vec<NaiveDate> {
        self.state().opened.clone()
    }

    pub fn closed_days(&self) -> Vec<NaiveDate> {
        self.state().closed.clone()
    }

    /// Flush ids remembered for days that are still open
    pub fn applied_flushes(&self) -> usize {
        self.state().applied.len()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn open_day(
        &self,
        day: NaiveDate,
        _targets: &[String],
    ) -> Result<Arc<dyn DayCollections>, StoreError> {
        let mut state = self.state();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(StoreError::Unavailable(format!("injected open failure for {}", day)));
        }
        state.opened.push(day);

        Ok(Arc::new(MemoryDay {
            day,
            state: self.state.clone(),
            write_latency: self.write_latency,
            closed: AtomicBool::new(false),
        }))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

struct MemoryDay {
    day: NaiveDate,
    state: Arc<Mutex<MemoryState>>,
    write_latency: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl DayCollections for MemoryDay {
    fn day(&self) -> NaiveDate {
        self.day
    }

    async fn upsert(&self, request: &FlushRequest) -> Result<UpsertOutcome, StoreError> {
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.day));
        }

        let mut state = lock(&self.state);
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        if !state.applied.insert((self.day, request.id.clone())) {
            return Ok(UpsertOutcome {
                documents: 0,
                duplicate: true,
            });
        }

        let docs = state
            .documents
            .entry((self.day, request.storage_target.clone()))
            .or_default();
        for (key, aggregate) in &request.entries {
            docs.entry(key.clone()).or_default().merge(aggregate);
        }

        Ok(UpsertOutcome {
            documents: request.len(),
            duplicate: false,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = lock(&self.state);
            state.closed.push(self.day);
            let day = self.day;
            state.applied.retain(|(applied_day, _)| *applied_day != day);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ApdexClass;

    fn make_request(id: &str, day: NaiveDate, count: u64) -> FlushRequest {
        let mut aggregate = Aggregate {
            count,
            ..Default::default()
        };
        for _ in 0..count {
            aggregate.apdex.record(ApdexClass::Satisfied);
        }
        FlushRequest {
            id: id.to_string(),
            day,
            storage_target: "shop".to_string(),
            writer: 0,
            entries: vec![(AggregateKey::new("shop-production", 60_000, "Orders#show"), aggregate)],
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_and_is_idempotent() {
        let store = MemoryDocumentStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let handle = store.open_day(day, &[]).await.unwrap();
        let key = AggregateKey::new("shop-production", 60_000, "Orders#show");

        handle.upsert(&make_request("a", day, 2)).await.unwrap();
        let again = handle.upsert(&make_request("a", day, 2)).await.unwrap();
        assert!(again.duplicate);
        handle.upsert(&make_request("b", day, 3)).await.unwrap();

        let doc = store.document(day, "shop", &key).unwrap();
        assert_eq!(doc.count, 5);
        assert_eq!(doc.apdex.satisfied, 5);
        assert_eq!(store.document_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_close() {
        let store = MemoryDocumentStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        store.fail_next_opens(1);
        assert!(store.open_day(day, &[]).await.is_err());
        let handle = store.open_day(day, &[]).await.unwrap();

        store.fail_next_writes(1);
        assert!(handle.upsert(&make_request("a", day, 1)).await.is_err());
        assert!(handle.upsert(&make_request("a", day, 1)).await.is_ok());

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(matches!(
            handle.upsert(&make_request("b", day, 1)).await,
            Err(StoreError::Closed(_))
        ));
        assert_eq!(store.opened_days(), vec![day]);
        assert_eq!(store.closed_days(), vec![day]);
    }

    #[tokio::test]
    async fn test_close_forgets_the_days_flush_ids() {
        let store = MemoryDocumentStore::new();
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let first = store.open_day(monday, &[]).await.unwrap();
        let second = store.open_day(tuesday, &[]).await.unwrap();

        first.upsert(&make_request("a", monday, 1)).await.unwrap();
        first.upsert(&make_request("b", monday, 1)).await.unwrap();
        second.upsert(&make_request("c", tuesday, 1)).await.unwrap();
        assert_eq!(store.applied_flushes(), 3);

        first.close().await.unwrap();
        assert_eq!(store.applied_flushes(), 1);

        // Documents outlive the handle
        let key = AggregateKey::new("shop-production", 60_000, "Orders#show");
        assert_eq!(store.document(monday, "shop", &key).unwrap().count, 2);
    }
}
