//! Updater Pool
//!
//! Each updater owns a disjoint slice of the aggregate key space (chosen by
//! `partition_for` in the parsers) and folds events into its in-memory
//! partition, keyed by action, by module (`::Orders`) and by the stream-wide
//! `all_pages` rollup. Buckets are flushed to the writers when:
//! - a controller tick shows the bucket is complete
//! - the partition grows past its configured bound (buffer pressure)
//! - the input queue closes (shutdown), which flushes everything
//!
//! Flushes are grouped by (day, storage target, writer) into
//! `FlushRequest`s carrying a run-unique id. Modules folded since the last
//! tick are reported to the shared `KnownModules` on every tick.

use super::processor::fold;
use super::stats::{PipelineStats, WorkerState, WorkerStatus};
use super::streams::KnownModules;
use super::types::{partition_for, Aggregate, AggregateKey, Clock, FlushRequest, ParsedEvent};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

/// Periodic signal from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub now_ms: i64,
}

#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub bucket_width_ms: i64,
    pub max_aggregates: usize,
    /// Prefix of every flush id; unique per process run
    pub run_id: String,
}

#[derive(Debug)]
struct PartitionEntry {
    storage_target: String,
    aggregate: Aggregate,
}

pub struct Updater {
    id: usize,
    settings: UpdaterSettings,
    partition: HashMap<AggregateKey, PartitionEntry>,
    writers: Vec<mpsc::Sender<FlushRequest>>,
    next_seq: u64,
    /// Stream → modules folded since the last report
    seen_modules: HashMap<String, HashSet<String>>,
    known_modules: Arc<KnownModules>,
    clock: Clock,
    stats: Arc<PipelineStats>,
    status: Arc<WorkerStatus>,
}

impl Updater {
    pub fn new(
        id: usize,
        settings: UpdaterSettings,
        writers: Vec<mpsc::Sender<FlushRequest>>,
        known_modules: Arc<KnownModules>,
        clock: Clock,
        stats: Arc<PipelineStats>,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            id,
            settings,
            partition: HashMap::new(),
            writers,
            next_seq: 0,
            seen_modules: HashMap::new(),
            known_modules,
            clock,
            stats,
            status,
        }
    }

    /// Aggregates currently held
    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }

    pub fn aggregate(&self, key: &AggregateKey) -> Option<&Aggregate> {
        self.partition.get(key).map(|entry| &entry.aggregate)
    }

    /// Fold `event` into its action aggregate, its module and the stream's rollup
    pub fn fold(&mut self, event: &ParsedEvent) {
        let module_key = event.module_key();
        if let Some(key) = &module_key {
            self.seen_modules
                .entry(key.stream_id.clone())
                .or_default()
                .insert(key.action.clone());
        }

        for key in [Some(event.key()), module_key, Some(event.rollup_key())]
            .into_iter()
            .flatten()
        {
            let stats = &self.stats;
            let entry = self.partition.entry(key).or_insert_with(|| {
                stats.buffered_aggregates.inc();
                PartitionEntry {
                    storage_target: event.storage_target.clone(),
                    aggregate: Aggregate::default(),
                }
            });
            entry.aggregate = fold(std::mem::take(&mut entry.aggregate), event);
        }
        self.stats.folded.incr();
    }

    /// Remove every aggregate whose bucket ended before `now_ms`
    pub fn take_complete(&mut self, now_ms: i64) -> Vec<FlushRequest> {
        let width = self.settings.bucket_width_ms.max(1);
        let current_bucket = now_ms - now_ms.rem_euclid(width);
        let complete: Vec<AggregateKey> = self
            .partition
            .keys()
            .filter(|key| key.bucket_ms < current_bucket)
            .cloned()
            .collect();

        let entries = complete
            .into_iter()
            .filter_map(|key| self.partition.remove_entry(&key))
            .collect();
        self.build_requests(entries)
    }

    /// Hand modules seen since the last call to the shared registry
    pub fn report_modules(&mut self, now_ms: i64) {
        self.known_modules
            .update(now_ms, std::mem::take(&mut self.seen_modules));
    }

    pub fn take_all(&mut self) -> Vec<FlushRequest> {
        let entries = self.partition.drain().collect();
        self.build_requests(entries)
    }

    fn build_requests(&mut self, entries: Vec<(AggregateKey, PartitionEntry)>) -> Vec<FlushRequest> {
        self.stats.buffered_aggregates.sub(entries.len() as u64);

        let n_writers = self.writers.len().max(1);
        let mut groups: BTreeMap<(NaiveDate, String, usize), Vec<(AggregateKey, Aggregate)>> =
            BTreeMap::new();
        for (key, entry) in entries {
            let writer = partition_for(&key.stream_id, key.bucket_ms, n_writers);
            groups
                .entry((key.day(), entry.storage_target, writer))
                .or_default()
                .push((key, entry.aggregate));
        }

        groups
            .into_iter()
            .map(|((day, storage_target, writer), mut entries)| {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                let id = format!("{}-u{}-{}", self.settings.run_id, self.id, self.next_seq);
                self.next_seq += 1;
                FlushRequest {
                    id,
                    day,
                    storage_target,
                    writer,
                    entries,
                }
            })
            .collect()
    }

    async fn forward(&self, requests: Vec<FlushRequest>) {
        if requests.is_empty() {
            return;
        }
        self.status.set(WorkerState::Forwarding);

        for request in requests {
            let aggregates = request.len() as u64;
            let writer = request.writer;
            self.stats.flush_requests.incr();
            self.stats.aggregates_flushed.add(aggregates);
            self.stats.writer_queue.inc();

            if let Err(mpsc::error::SendError(lost)) = self.writers[writer].send(request).await {
                self.stats.writer_queue.dec();
                self.stats.data_loss_requests.incr();
                self.stats.data_loss_aggregates.add(aggregates);
                log::error!(
                    "💥 DATA LOSS: updater {} could not hand flush {} ({} aggregates) to writer {}",
                    self.id,
                    lost.id,
                    aggregates,
                    writer
                );
            }
        }
    }

    /// Run until the input queue closes, then flush everything
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ParsedEvent>,
        mut ticks: broadcast::Receiver<Tick>,
    ) {
        log::debug!("🧮 Updater {} started", self.id);
        let mut ticks_open = true;

        loop {
            self.status.set(WorkerState::Receiving);
            tokio::select! {
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else {
                        break;
                    };
                    self.stats.updater_queue.dec();
                    self.status.set(WorkerState::Processing);
                    self.fold(&event);

                    if self.partition.len() > self.settings.max_aggregates {
                        self.relieve_pressure().await;
                    }
                }
                tick = ticks.recv(), if ticks_open => {
                    let now_ms = match tick {
                        Ok(tick) => tick.now_ms,
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("Updater {} skipped {} ticks", self.id, skipped);
                            self.clock.now_ms()
                        }
                        Err(RecvError::Closed) => {
                            ticks_open = false;
                            continue;
                        }
                    };
                    self.report_modules(now_ms);
                    let requests = self.take_complete(now_ms);
                    self.forward(requests).await;
                }
            }
        }

        self.status.set(WorkerState::Draining);
        self.report_modules(self.clock.now_ms());
        let requests = self.take_all();
        if !requests.is_empty() {
            log::info!(
                "🔄 Updater {}: final flush of {} requests",
                self.id,
                requests.len()
            );
        }
        self.forward(requests).await;
        self.status.set(WorkerState::Stopped);
        log::debug!("✅ Updater {} stopped", self.id);
    }

    async fn relieve_pressure(&mut self) {
        self.stats.pressure_flushes.incr();
        let held = self.partition.len();

        let mut requests = self.take_complete(self.clock.now_ms());
        if self.partition.len() > self.settings.max_aggregates {
            requests.extend(self.take_all());
        }
        log::warn!(
            "⚠️  Updater {} over its bound ({} > {}), flushing {} requests early",
            self.id,
            held,
            self.settings.max_aggregates,
            requests.len()
        );
        self.forward(requests).await;
    }
}
