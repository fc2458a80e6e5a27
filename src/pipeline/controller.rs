//! Controller: lifecycle of the whole importer
//!
//! Startup (Initializing):
//! 1. open today's storage handles (fatal on failure)
//! 2. open the frontend timings log, if configured (fatal on failure)
//! 3. spawn writers, updaters, parsers, then the intake task
//!
//! While Running, every tick checks for day rollover, closes drained days,
//! broadcasts a `Tick` to the updaters and periodically logs diagnostics.
//!
//! Shutdown (on signal or end of input) stops intake, then joins parsers,
//! updaters and writers in that order. Each stage finishes its input
//! before the next stage's queues close, so nothing accepted upstream is
//! lost unless a stage exceeds its join timeout.

use super::backoff::RetryPolicy;
use super::bus::MessageSource;
use super::config::{ConfigError, ImporterConfig, StorageBackend};
use super::db::SqliteDocumentStore;
use super::memory::MemoryDocumentStore;
use super::parser::{run_intake, run_parser, IntakeOutcome, ParserContext};
use super::pool::WorkerPool;
use super::processor::Processor;
use super::resources::ResourcePool;
use super::stats::{PipelineStats, StatsSnapshot, WorkerStatus};
use super::store::{DocumentStore, DryRunStore, StoreError};
use super::streams::{KnownModules, StreamRegistry};
use super::timings_log::FrontendTimingsLog;
use super::types::{day_of, Clock, RawMessage};
use super::updater::{Tick, Updater, UpdaterSettings};
use super::writer::Writer;
use chrono::NaiveDate;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const TICK_CHANNEL_CAPACITY: usize = 16;

/// Retry budget of the intake task for transient bus errors
const BUS_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 10,
    initial_delay_ms: 100,
    max_delay_ms: 5_000,
    jitter: true,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to open frontend timings log: {0}")]
    TimingsLog(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    EndOfInput,
    BusFailed,
    /// Every parser stopped while intake was still reading
    PipelineFailed,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Every stage drained within its timeout and all handles closed
    pub clean: bool,
    pub stats: StatsSnapshot,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        if self.clean {
            0
        } else {
            1
        }
    }
}

/// Pick the document store for `config`
pub fn open_store(config: &ImporterConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    if config.dry_run {
        return Ok(Arc::new(DryRunStore));
    }
    Ok(match config.backend {
        StorageBackend::Memory => Arc::new(MemoryDocumentStore::new()),
        StorageBackend::Sqlite => Arc::new(SqliteDocumentStore::new(
            config.data_dir.clone(),
            config.db_prefix.clone(),
        )?),
    })
}

/// Unique per process run; prefixes every flush id
fn make_run_id(clock: &Clock) -> String {
    format!("{:x}-{:08x}", clock.now_ms(), rand::random::<u32>())
}

struct Pools {
    parsers: WorkerPool,
    updaters: WorkerPool,
    writers: WorkerPool,
}

pub struct Controller {
    config: ImporterConfig,
    registry: Arc<StreamRegistry>,
    resources: Arc<ResourcePool>,
    stats: Arc<PipelineStats>,
    known_modules: Arc<KnownModules>,
    clock: Clock,
    state: watch::Sender<ControllerState>,
}

impl Controller {
    /// Validate the configuration and apply the process-wide apdex override
    pub fn new(
        config: ImporterConfig,
        mut registry: StreamRegistry,
        store: Arc<dyn DocumentStore>,
        clock: Clock,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        if let Some(attribute) = &config.apdex_attribute {
            if !registry.apply_apdex_override(attribute) {
                return Err(ConfigError::UnknownApdexAttribute(attribute.clone()).into());
            }
        }

        let today = day_of(clock.now_ms());
        let resources = Arc::new(ResourcePool::new(store, registry.storage_targets(), today));
        let (state, _) = watch::channel(ControllerState::Initializing);

        Ok(Self {
            config,
            registry: Arc::new(registry),
            resources,
            stats: PipelineStats::new(),
            known_modules: KnownModules::new(),
            clock,
            state,
        })
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn resources(&self) -> Arc<ResourcePool> {
        self.resources.clone()
    }

    /// Modules seen per stream during the last day
    pub fn known_modules(&self) -> Arc<KnownModules> {
        self.known_modules.clone()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        self.state.send_replace(state);
        log::debug!("Controller state: {:?}", state);
    }

    /// Run the pipeline until `shutdown` resolves or the input ends
    pub async fn run<S, F>(self, source: S, shutdown: F) -> Result<ShutdownReport, ControllerError>
    where
        S: MessageSource + 'static,
        F: Future<Output = ()>,
    {
        self.set_state(ControllerState::Initializing);
        log::info!("🚀 Starting importer");
        log::info!("   ├─ Streams: {}", self.registry.len());
        log::info!(
            "   ├─ Pools: {} parsers, {} updaters, {} writers",
            self.config.num_parsers,
            self.config.num_updaters,
            self.config.num_writers
        );
        log::info!(
            "   ├─ Buckets: {}s, apdex T: {}ms",
            self.config.bucket_secs,
            self.config.apdex_target_ms
        );
        log::info!("   └─ Storage: {}", self.resources.backend_type());

        let today = day_of(self.clock.now_ms());
        if let Err(e) = self.resources.rotate(today).await {
            log::error!("❌ Failed to open storage for {}: {}", today, e);
            self.set_state(ControllerState::Stopped);
            return Err(e.into());
        }

        let (timings_log, timings_task) = match &self.config.frontend_timings_log {
            Some(path) => {
                match FrontendTimingsLog::open(path, self.config.channel_buffer, self.stats.clone()) {
                    Ok((timings, task)) => (Some(timings), Some(task)),
                    Err(e) => {
                        log::error!("❌ Failed to open {}: {}", path.display(), e);
                        self.close_storage().await;
                        self.set_state(ControllerState::Stopped);
                        return Err(e.into());
                    }
                }
            }
            None => (None, None),
        };

        let run_id = make_run_id(&self.clock);
        log::debug!("Run id: {}", run_id);

        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (pools, parser_txs) = self.spawn_pools(&run_id, &tick_tx, timings_log);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut intake: JoinHandle<IntakeOutcome> = tokio::spawn(run_intake(
            source,
            parser_txs,
            stop_rx,
            self.stats.clone(),
            BUS_RETRY,
        ));

        self.set_state(ControllerState::Running);
        log::info!("✅ Importer running");

        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = Progress::new(today);
        let mut intake_result = None;

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("🛑 Shutdown requested");
                    break ShutdownReason::Signal;
                }
                joined = &mut intake => {
                    let outcome = joined.unwrap_or_else(|e| {
                        log::error!("❌ Intake task failed: {}", e);
                        IntakeOutcome::BusFailed
                    });
                    intake_result = Some(outcome);
                    break match outcome {
                        IntakeOutcome::EndOfInput => ShutdownReason::EndOfInput,
                        IntakeOutcome::BusFailed => ShutdownReason::BusFailed,
                        IntakeOutcome::Stopped | IntakeOutcome::ParsersGone => {
                            ShutdownReason::PipelineFailed
                        }
                    };
                }
                _ = ticker.tick() => {
                    self.on_tick(&tick_tx, &mut progress, &pools).await;
                }
            }
        };

        self.set_state(ControllerState::ShuttingDown);
        let clean = self
            .shutdown(stop_tx, intake, intake_result, tick_tx, pools, timings_task)
            .await;
        let clean = clean
            && matches!(reason, ShutdownReason::Signal | ShutdownReason::EndOfInput);

        self.set_state(ControllerState::Stopped);
        let stats = self.stats.snapshot();
        log_final_stats(&stats);
        if clean {
            log::info!("✅ Importer stopped cleanly ({:?})", reason);
        } else {
            log::warn!("⚠️  Importer stopped with errors ({:?})", reason);
        }

        Ok(ShutdownReport {
            reason,
            clean,
            stats,
        })
    }

    fn spawn_pools(
        &self,
        run_id: &str,
        tick_tx: &broadcast::Sender<Tick>,
        timings_log: Option<FrontendTimingsLog>,
    ) -> (Pools, Vec<mpsc::Sender<RawMessage>>) {
        let buffer = self.config.channel_buffer;

        let mut writers = WorkerPool::new("writer");
        let mut writer_txs = Vec::with_capacity(self.config.num_writers);
        for id in 0..self.config.num_writers {
            let (tx, rx) = mpsc::channel(buffer);
            let status = WorkerStatus::new();
            let writer = Writer::new(
                id,
                self.resources.clone(),
                self.config.write_retry.clone(),
                self.stats.clone(),
                status.clone(),
            );
            writers.push(tokio::spawn(writer.run(rx)), status);
            writer_txs.push(tx);
        }

        let settings = UpdaterSettings {
            bucket_width_ms: self.config.bucket_width_ms(),
            max_aggregates: self.config.max_aggregates_per_updater,
            run_id: run_id.to_string(),
        };
        let mut updaters = WorkerPool::new("updater");
        let mut updater_txs = Vec::with_capacity(self.config.num_updaters);
        for id in 0..self.config.num_updaters {
            let (tx, rx) = mpsc::channel(buffer);
            let status = WorkerStatus::new();
            let updater = Updater::new(
                id,
                settings.clone(),
                writer_txs.clone(),
                self.known_modules.clone(),
                self.clock.clone(),
                self.stats.clone(),
                status.clone(),
            );
            updaters.push(tokio::spawn(updater.run(rx, tick_tx.subscribe())), status);
            updater_txs.push(tx);
        }
        // Writer queues close once every updater has finished
        drop(writer_txs);

        let ctx = Arc::new(ParserContext {
            registry: self.registry.clone(),
            processor: Processor::from_config(&self.config, self.clock.clone()),
            stats: self.stats.clone(),
            timings_log,
        });
        let mut parsers = WorkerPool::new("parser");
        let mut parser_txs = Vec::with_capacity(self.config.num_parsers);
        for id in 0..self.config.num_parsers {
            let (tx, rx) = mpsc::channel(buffer);
            let status = WorkerStatus::new();
            parsers.push(
                tokio::spawn(run_parser(id, rx, updater_txs.clone(), ctx.clone(), status.clone())),
                status,
            );
            parser_txs.push(tx);
        }

        (
            Pools {
                parsers,
                updaters,
                writers,
            },
            parser_txs,
        )
    }

    async fn on_tick(&self, tick_tx: &broadcast::Sender<Tick>, progress: &mut Progress, pools: &Pools) {
        let now_ms = self.clock.now_ms();
        let today = day_of(now_ms);

        if today != progress.day {
            log::info!("🌅 Day rollover: {} → {}", progress.day, today);
            match self.resources.rotate(today).await {
                Ok(()) => progress.day = today,
                Err(e) => log::error!("❌ Failed to open storage for {}: {} (will retry)", today, e),
            }
        }

        let closed = self.resources.close_drained().await;
        for day in closed {
            log::info!("📦 Closed storage for {}", day);
        }

        // No receivers only means every updater has already stopped
        let _ = tick_tx.send(Tick { now_ms });

        progress.ticks += 1;
        if progress.ticks % self.config.stats_interval_ticks.max(1) == 0 {
            progress.log(
                &self.stats.snapshot(),
                self.known_modules.len(),
                pools,
                self.config.channel_buffer,
            );
        }
    }

    /// Stop intake and drain every stage in order; true if nothing was cut short
    async fn shutdown(
        &self,
        stop_tx: watch::Sender<bool>,
        mut intake: JoinHandle<IntakeOutcome>,
        intake_result: Option<IntakeOutcome>,
        tick_tx: broadcast::Sender<Tick>,
        pools: Pools,
        timings_task: Option<JoinHandle<()>>,
    ) -> bool {
        let limit = Duration::from_millis(self.config.shutdown_timeout_ms);
        let mut clean = true;
        log::info!("🔄 Draining pipeline (timeout {}ms per stage)", limit.as_millis());

        let _ = stop_tx.send(true);
        if intake_result.is_none() {
            match tokio::time::timeout(limit, &mut intake).await {
                Ok(Ok(outcome)) => log::debug!("Intake finished: {:?}", outcome),
                Ok(Err(e)) => {
                    log::error!("❌ Intake task failed: {}", e);
                    clean = false;
                }
                Err(_) => {
                    log::warn!("⚠️  Intake did not stop within {}ms, aborting", limit.as_millis());
                    intake.abort();
                    clean = false;
                }
            }
        }

        let report = pools.parsers.join(limit).await;
        if !report.is_clean() {
            clean = false;
            self.stats.dropped_on_shutdown.add(self.stats.parser_queue.get());
        }
        log::info!("   ├─ Parsers stopped ({} finished)", report.finished);

        drop(tick_tx);
        let report = pools.updaters.join(limit).await;
        if !report.is_clean() {
            clean = false;
            self.stats
                .dropped_on_shutdown
                .add(self.stats.updater_queue.get() + self.stats.buffered_aggregates.get());
        }
        log::info!("   ├─ Updaters flushed ({} finished)", report.finished);

        let report = pools.writers.join(limit).await;
        if !report.is_clean() {
            clean = false;
            self.stats
                .dropped_on_shutdown
                .add(self.stats.writer_queue.get() + self.stats.retry_queue.get());
        }
        log::info!("   ├─ Writers drained ({} finished)", report.finished);

        if let Some(mut task) = timings_task {
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                log::warn!("⚠️  Frontend timings log did not flush in time");
                task.abort();
            }
        }

        if !self.close_storage().await {
            clean = false;
        }
        log::info!("   └─ Storage closed");

        let dropped = self.stats.dropped_on_shutdown.get();
        if dropped > 0 {
            log::warn!("⚠️  {} items dropped during shutdown", dropped);
        }
        clean
    }

    async fn close_storage(&self) -> bool {
        match self.resources.close_all().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("❌ Failed to close storage: {}", e);
                false
            }
        }
    }
}

/// Tick counter and throughput bookkeeping for periodic diagnostics
struct Progress {
    day: NaiveDate,
    ticks: u64,
    last_log: Instant,
    last_received: u64,
}

impl Progress {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            ticks: 0,
            last_log: Instant::now(),
            last_received: 0,
        }
    }

    fn log(&mut self, stats: &StatsSnapshot, known_modules: usize, pools: &Pools, capacity: usize) {
        let elapsed = self.last_log.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = (stats.received - self.last_received) as f64 / elapsed;
        self.last_log = Instant::now();
        self.last_received = stats.received;

        log::info!(
            "📊 Ingestion rate: {:.1} msgs/sec (received {}, parsed {}, dropped {})",
            rate,
            stats.received,
            stats.parsed,
            stats.dropped_total()
        );
        log::info!(
            "   ├─ Flushed {} aggregates in {} requests, {} documents written",
            stats.aggregates_flushed,
            stats.flush_requests,
            stats.documents_written
        );
        log::info!(
            "   ├─ Queues: parsers {} | updaters {} | writers {} | retries {}",
            stats.parser_queue,
            stats.updater_queue,
            stats.writer_queue,
            stats.retry_queue
        );
        log::info!("   ├─ Known modules: {}", known_modules);
        log::info!(
            "   └─ Workers: parsers [{}] updaters [{}] writers [{}]",
            pools.parsers.summary(),
            pools.updaters.summary(),
            pools.writers.summary()
        );

        for (name, depth, workers) in [
            (pools.parsers.name(), stats.parser_queue, pools.parsers.len()),
            (pools.updaters.name(), stats.updater_queue, pools.updaters.len()),
            (pools.writers.name(), stats.writer_queue, pools.writers.len()),
        ] {
            let total = (capacity * workers) as u64;
            if total > 0 && depth > total / 2 {
                log::warn!(
                    "⚠️  {} queues usage high: {}/{} ({}%)",
                    name,
                    depth,
                    total,
                    depth * 100 / total
                );
            }
        }
        if stats.data_loss_requests > 0 {
            log::warn!(
                "⚠️  Data loss so far: {} requests ({} aggregates)",
                stats.data_loss_requests,
                stats.data_loss_aggregates
            );
        }
    }
}

fn log_final_stats(stats: &StatsSnapshot) {
    log::info!("📊 Final statistics");
    log::info!("   ├─ Received: {}, parsed: {}", stats.received, stats.parsed);
    log::info!(
        "   ├─ Dropped: {} unmatched, {} disabled, {} parse errors, {} clock skew, {} ignored",
        stats.dropped_unmatched,
        stats.dropped_disabled,
        stats.dropped_parse_error,
        stats.dropped_clock_skew,
        stats.dropped_ignored
    );
    log::info!(
        "   ├─ Written: {} documents ({} duplicate flushes skipped)",
        stats.documents_written,
        stats.duplicate_flushes
    );
    log::info!(
        "   └─ Retries: {}, data loss: {} requests / {} aggregates",
        stats.write_retries,
        stats.data_loss_requests,
        stats.data_loss_aggregates
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::ChannelSource;
    use crate::pipeline::streams::StreamDefinition;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_040_000;

    fn make_config() -> ImporterConfig {
        ImporterConfig {
            num_parsers: 2,
            num_updaters: 2,
            num_writers: 2,
            tick_interval_ms: 20,
            shutdown_timeout_ms: 2_000,
            channel_buffer: 64,
            ..Default::default()
        }
    }

    fn make_registry() -> StreamRegistry {
        let mut definitions = BTreeMap::new();
        definitions.insert("shop-production".to_string(), StreamDefinition::default());
        StreamRegistry::from_definitions(definitions, "").unwrap()
    }

    #[test]
    fn test_unknown_apdex_attribute_aborts_startup() {
        let config = ImporterConfig {
            apdex_attribute: Some("nonsense_time".to_string()),
            ..make_config()
        };
        let result = Controller::new(
            config,
            make_registry(),
            Arc::new(MemoryDocumentStore::new()),
            Clock::fixed(NOW),
        );
        assert!(matches!(
            result,
            Err(ControllerError::Config(ConfigError::UnknownApdexAttribute(_)))
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_at_startup_is_fatal() {
        let store = MemoryDocumentStore::new();
        store.fail_next_opens(1);
        let controller =
            Controller::new(make_config(), make_registry(), Arc::new(store), Clock::fixed(NOW)).unwrap();
        let states = controller.subscribe_state();
        let (_tx, source) = ChannelSource::new(8);

        let result = controller.run(source, std::future::pending()).await;
        assert!(matches!(result, Err(ControllerError::Store(_))));
        assert_eq!(*states.borrow(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_shutdown_flushes_accepted_events() {
        let store = MemoryDocumentStore::new();
        let controller =
            Controller::new(make_config(), make_registry(), Arc::new(store.clone()), Clock::fixed(NOW))
                .unwrap();
        let mut states = controller.subscribe_state();
        let (tx, source) = ChannelSource::new(8);
        let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();

        let run = tokio::spawn(controller.run(source, async {
            let _ = signal_rx.await;
        }));
        while *states.borrow_and_update() != ControllerState::Running {
            states.changed().await.unwrap();
        }

        let payload = serde_json::json!({
            "action": "Cart#show",
            "started_ms": NOW - 500,
            "total_time": 120.0,
        });
        tx.send(RawMessage::new("logs.shop-production", payload.to_string().into_bytes()))
            .await
            .unwrap();
        signal_tx.send(()).unwrap();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.reason, ShutdownReason::Signal);
        assert!(report.clean);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.stats.received, 1);
        // Cart#show, ::Cart and all_pages
        assert_eq!(report.stats.documents_written, 3);
        assert_eq!(store.document_count(), 3);
        assert_eq!(store.closed_days(), vec![day_of(NOW)]);
    }
}
