//! Resource pool: one set of storage handles per calendar day
//!
//! - handles are created lazily and at most once per day (`OnceCell`); a
//!   failed open is not cached, the next caller retries
//! - writers hold an `InFlightGuard` from dequeue until completion or
//!   terminal failure; a day is only closed once its count is zero
//! - `rotate` switches the current day and opens it eagerly; older days
//!   are closed by `close_drained` on a later tick once idle
//!
//! The slot map lock is never held across an `.await`.

use super::store::{DayCollections, DocumentStore, StoreError};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OnceCell};

struct DaySlot {
    day: NaiveDate,
    handle: OnceCell<Arc<dyn DayCollections>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DaySlot {
    fn new(day: NaiveDate) -> Arc<Self> {
        Arc::new(Self {
            day,
            handle: OnceCell::new(),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Marks one flush request as in flight against its day
pub struct InFlightGuard {
    slot: Arc<DaySlot>,
}

impl InFlightGuard {
    pub fn day(&self) -> NaiveDate {
        self.slot.day
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.slot.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("day", &self.slot.day)
            .finish()
    }
}

struct PoolState {
    current: NaiveDate,
    days: BTreeMap<NaiveDate, Arc<DaySlot>>,
}

pub struct ResourcePool {
    store: Arc<dyn DocumentStore>,
    targets: Vec<String>,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    /// Create a pool; nothing is opened until `rotate` or `acquire`
    pub fn new(store: Arc<dyn DocumentStore>, targets: Vec<String>, current: NaiveDate) -> Self {
        Self {
            store,
            targets,
            state: Mutex::new(PoolState {
                current,
                days: BTreeMap::new(),
            }),
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    pub fn current_day(&self) -> NaiveDate {
        self.state().current
    }

    /// Register one in-flight request for `day`
    pub fn begin(&self, day: NaiveDate) -> InFlightGuard {
        let mut state = self.state();
        let slot = state
            .days
            .entry(day)
            .or_insert_with(|| DaySlot::new(day))
            .clone();
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { slot }
    }

    /// Handle for `day`, opening it on first use
    pub async fn acquire(&self, day: NaiveDate) -> Result<Arc<dyn DayCollections>, StoreError> {
        let slot = {
            let mut state = self.state();
            state
                .days
                .entry(day)
                .or_insert_with(|| DaySlot::new(day))
                .clone()
        };
        self.open_slot(&slot).await
    }

    /// Handle for the day a guard was taken for
    pub async fn acquire_for(
        &self,
        guard: &InFlightGuard,
    ) -> Result<Arc<dyn DayCollections>, StoreError> {
        self.open_slot(&guard.slot).await
    }

    async fn open_slot(&self, slot: &DaySlot) -> Result<Arc<dyn DayCollections>, StoreError> {
        let handle = slot
            .handle
            .get_or_try_init(|| async {
                log::info!(
                    "🔧 Opening {} collections for {}",
                    self.store.backend_type(),
                    slot.day
                );
                self.store.open_day(slot.day, &self.targets).await
            })
            .await?;
        Ok(handle.clone())
    }

    /// Make `new_day` current and open it eagerly
    ///
    /// Older days stay open while writes are in flight; `close_drained`
    /// closes them once idle.
    pub async fn rotate(&self, new_day: NaiveDate) -> Result<(), StoreError> {
        let previous = {
            let mut state = self.state();
            std::mem::replace(&mut state.current, new_day)
        };
        if previous != new_day {
            log::info!("🔄 Rotating storage day: {} → {}", previous, new_day);
        }
        self.acquire(new_day).await?;
        Ok(())
    }

    /// Close every day before the current one that has nothing in flight
    ///
    /// Never waits; returns the days that were closed.
    pub async fn close_drained(&self) -> Vec<NaiveDate> {
        let drained: Vec<Arc<DaySlot>> = {
            let mut state = self.state();
            let current = state.current;
            let idle: Vec<NaiveDate> = state
                .days
                .iter()
                .filter(|(day, slot)| **day < current && slot.in_flight() == 0)
                .map(|(day, _)| *day)
                .collect();
            idle.iter()
                .filter_map(|day| state.days.remove(day))
                .collect()
        };

        let mut closed = Vec::with_capacity(drained.len());
        for slot in drained {
            if let Err(e) = close_slot(&slot).await {
                log::error!("❌ Failed to close collections for {}: {}", slot.day, e);
            }
            closed.push(slot.day);
        }
        closed
    }

    /// Wait until nothing is in flight for `day`, then close it
    ///
    /// No timeout. Returns false if the day had no slot.
    pub async fn drain_and_close(&self, day: NaiveDate) -> Result<bool, StoreError> {
        loop {
            let slot = match self.state().days.get(&day) {
                Some(slot) => slot.clone(),
                None => return Ok(false),
            };

            let drained = slot.drained.notified();
            if slot.in_flight() > 0 {
                log::debug!(
                    "⏳ Waiting for {} in-flight writes on {}",
                    slot.in_flight(),
                    day
                );
                drained.await;
                continue;
            }

            let removed = {
                let mut state = self.state();
                let same_slot = state
                    .days
                    .get(&day)
                    .map_or(false, |current| Arc::ptr_eq(current, &slot));
                if same_slot && slot.in_flight() == 0 {
                    state.days.remove(&day)
                } else {
                    None
                }
            };

            if let Some(slot) = removed {
                close_slot(&slot).await?;
                return Ok(true);
            }
        }
    }

    /// Drain and close every day
    pub async fn close_all(&self) -> Result<(), StoreError> {
        let days: Vec<NaiveDate> = self.state().days.keys().copied().collect();
        let mut first_error = None;
        for day in days {
            if let Err(e) = self.drain_and_close(day).await {
                log::error!("❌ Failed to close collections for {}: {}", day, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn in_flight(&self, day: NaiveDate) -> usize {
        self.state()
            .days
            .get(&day)
            .map_or(0, |slot| slot.in_flight())
    }

    /// Days whose handle is currently open
    pub fn open_days(&self) -> Vec<NaiveDate> {
        self.state()
            .days
            .values()
            .filter(|slot| slot.handle.initialized())
            .map(|slot| slot.day)
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn close_slot(slot: &DaySlot) -> Result<(), StoreError> {
    match slot.handle.get() {
        Some(handle) => handle.close().await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory::MemoryDocumentStore;
    use std::time::Duration;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn make_pool(store: &MemoryDocumentStore, current: NaiveDate) -> Arc<ResourcePool> {
        Arc::new(ResourcePool::new(
            Arc::new(store.clone()),
            vec!["shop".to_string()],
            current,
        ))
    }

    #[tokio::test]
    async fn test_acquire_is_lazy_and_idempotent() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(1));
        assert!(store.opened_days().is_empty());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(day(1)).await.is_ok() }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(store.opened_days(), vec![day(1)]);
        assert_eq!(pool.open_days(), vec![day(1)]);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(1));

        store.fail_next_opens(1);
        assert!(pool.acquire(day(1)).await.is_err());
        assert!(pool.open_days().is_empty());

        assert!(pool.acquire(day(1)).await.is_ok());
        assert_eq!(store.opened_days(), vec![day(1)]);
    }

    #[tokio::test]
    async fn test_guards_track_in_flight() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(1));

        let a = pool.begin(day(1));
        let b = pool.begin(day(1));
        assert_eq!(pool.in_flight(day(1)), 2);
        assert_eq!(a.day(), day(1));

        drop(a);
        assert_eq!(pool.in_flight(day(1)), 1);
        drop(b);
        assert_eq!(pool.in_flight(day(1)), 0);
    }

    #[tokio::test]
    async fn test_drain_and_close_waits_for_in_flight() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(1));
        pool.acquire(day(1)).await.unwrap();

        let guard = pool.begin(day(1));
        let drainer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain_and_close(day(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drainer.is_finished());
        assert!(store.closed_days().is_empty());

        drop(guard);
        let closed = tokio::time::timeout(Duration::from_secs(2), drainer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(closed);
        assert_eq!(store.closed_days(), vec![day(1)]);
        assert!(!pool.drain_and_close(day(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_keeps_busy_day_open() {
        // Test: a write in flight on day D is not cut off by rotating to D+1
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(1));
        pool.rotate(day(1)).await.unwrap();

        let guard = pool.begin(day(1));
        let handle = pool.acquire_for(&guard).await.unwrap();

        pool.rotate(day(2)).await.unwrap();
        assert_eq!(pool.current_day(), day(2));
        assert_eq!(store.opened_days(), vec![day(1), day(2)]);

        assert!(pool.close_drained().await.is_empty());
        assert_eq!(handle.day(), day(1));
        assert!(store.closed_days().is_empty());

        drop(guard);
        assert_eq!(pool.close_drained().await, vec![day(1)]);
        assert_eq!(store.closed_days(), vec![day(1)]);
        assert_eq!(pool.open_days(), vec![day(2)]);
    }

    #[tokio::test]
    async fn test_late_write_reopens_closed_day() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(2));
        pool.acquire(day(1)).await.unwrap();
        assert_eq!(pool.close_drained().await, vec![day(1)]);

        let guard = pool.begin(day(1));
        pool.acquire_for(&guard).await.unwrap();
        assert_eq!(store.opened_days(), vec![day(1), day(1)]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let store = MemoryDocumentStore::new();
        let pool = make_pool(&store, day(2));
        pool.acquire(day(1)).await.unwrap();
        pool.acquire(day(2)).await.unwrap();

        pool.close_all().await.unwrap();
        assert_eq!(store.closed_days(), vec![day(1), day(2)]);
        assert!(pool.open_days().is_empty());
    }
}
