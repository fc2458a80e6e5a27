//! Pipeline counters, queue gauges and worker states
//!
//! One `PipelineStats` is created by the controller and shared with every
//! worker by `Arc`. Counters only go up; gauges track items sitting in a
//! stage's input queues. The controller reads a `StatsSnapshot` for its
//! periodic diagnostics and for the shutdown report.

use super::processor::ParseError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Items currently queued in front of a stage
#[derive(Debug, Default)]
pub struct QueueGauge(AtomicI64);

impl QueueGauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sub(&self, n: u64) {
        self.0.fetch_sub(n as i64, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed).max(0) as u64
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Messages taken off the bus
    pub received: Counter,
    pub parsed: Counter,
    pub dropped_unmatched: Counter,
    pub dropped_disabled: Counter,
    pub dropped_parse_error: Counter,
    pub dropped_clock_skew: Counter,
    pub dropped_ignored: Counter,
    /// Events folded into updater partitions
    pub folded: Counter,
    pub pressure_flushes: Counter,
    pub flush_requests: Counter,
    pub aggregates_flushed: Counter,
    pub documents_written: Counter,
    pub duplicate_flushes: Counter,
    pub write_retries: Counter,
    pub data_loss_requests: Counter,
    pub data_loss_aggregates: Counter,
    pub dropped_on_shutdown: Counter,
    pub bus_errors: Counter,
    pub debug_log_written: Counter,
    pub debug_log_dropped: Counter,

    pub parser_queue: QueueGauge,
    pub updater_queue: QueueGauge,
    pub writer_queue: QueueGauge,
    /// Flush requests waiting in writers' local retry queues
    pub retry_queue: QueueGauge,
    /// Aggregates held in updater partitions, not yet flushed
    pub buffered_aggregates: QueueGauge,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_parse_error(&self, error: &ParseError) {
        match error {
            ParseError::ClockSkew { .. } => self.dropped_clock_skew.incr(),
            ParseError::IgnoredRequest(_) | ParseError::BackendOnlyRequest(_) => {
                self.dropped_ignored.incr()
            }
            _ => self.dropped_parse_error.incr(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.get(),
            parsed: self.parsed.get(),
            dropped_unmatched: self.dropped_unmatched.get(),
            dropped_disabled: self.dropped_disabled.get(),
            dropped_parse_error: self.dropped_parse_error.get(),
            dropped_clock_skew: self.dropped_clock_skew.get(),
            dropped_ignored: self.dropped_ignored.get(),
            folded: self.folded.get(),
            pressure_flushes: self.pressure_flushes.get(),
            flush_requests: self.flush_requests.get(),
            aggregates_flushed: self.aggregates_flushed.get(),
            documents_written: self.documents_written.get(),
            duplicate_flushes: self.duplicate_flushes.get(),
            write_retries: self.write_retries.get(),
            data_loss_requests: self.data_loss_requests.get(),
            data_loss_aggregates: self.data_loss_aggregates.get(),
            dropped_on_shutdown: self.dropped_on_shutdown.get(),
            bus_errors: self.bus_errors.get(),
            debug_log_written: self.debug_log_written.get(),
            debug_log_dropped: self.debug_log_dropped.get(),
            parser_queue: self.parser_queue.get(),
            updater_queue: self.updater_queue.get(),
            writer_queue: self.writer_queue.get(),
            retry_queue: self.retry_queue.get(),
            buffered_aggregates: self.buffered_aggregates.get(),
        }
    }
}

/// Point-in-time copy of all counters and gauges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub parsed: u64,
    pub dropped_unmatched: u64,
    pub dropped_disabled: u64,
    pub dropped_parse_error: u64,
    pub dropped_clock_skew: u64,
    pub dropped_ignored: u64,
    pub folded: u64,
    pub pressure_flushes: u64,
    pub flush_requests: u64,
    pub aggregates_flushed: u64,
    pub documents_written: u64,
    pub duplicate_flushes: u64,
    pub write_retries: u64,
    pub data_loss_requests: u64,
    pub data_loss_aggregates: u64,
    pub dropped_on_shutdown: u64,
    pub bus_errors: u64,
    pub debug_log_written: u64,
    pub debug_log_dropped: u64,
    pub parser_queue: u64,
    pub updater_queue: u64,
    pub writer_queue: u64,
    pub retry_queue: u64,
    pub buffered_aggregates: u64,
}

impl StatsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_unmatched
            + self.dropped_disabled
            + self.dropped_parse_error
            + self.dropped_clock_skew
            + self.dropped_ignored
    }
}

/// Lifecycle of a pool worker, published for health diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Receiving = 1,
    Processing = 2,
    Forwarding = 3,
    Draining = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Receiving,
            2 => WorkerState::Processing,
            3 => WorkerState::Forwarding,
            4 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Receiving => "receiving",
            WorkerState::Processing => "processing",
            WorkerState::Forwarding => "forwarding",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct WorkerStatus(AtomicU8);

impl Default for WorkerStatus {
    fn default() -> Self {
        Self(AtomicU8::new(WorkerState::Idle as u8))
    }
}

impl WorkerStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// Condensed "2 idle, 1 processing" view of a pool
pub fn summarize_states(statuses: &[Arc<WorkerStatus>]) -> String {
    let mut counts: BTreeMap<WorkerState, usize> = BTreeMap::new();
    for status in statuses {
        *counts.entry(status.get()).or_insert(0) += 1;
    }
    counts
        .iter()
        .map(|(state, n)| format!("{} {}", n, state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_land_in_their_counter() {
        let stats = PipelineStats::default();
        stats.record_parse_error(&ParseError::ClockSkew {
            timestamp_ms: 0,
            now_ms: 1,
        });
        stats.record_parse_error(&ParseError::IgnoredRequest("/_health".to_string()));
        stats.record_parse_error(&ParseError::BackendOnlyRequest("Admin#index".to_string()));
        stats.record_parse_error(&ParseError::NotAnObject);
        stats.record_parse_error(&ParseError::MissingField("total_time".to_string()));

        let snap = stats.snapshot();
        assert_eq!(snap.dropped_clock_skew, 1);
        assert_eq!(snap.dropped_ignored, 2);
        assert_eq!(snap.dropped_parse_error, 2);
        assert_eq!(snap.dropped_total(), 5);
    }

    #[test]
    fn test_queue_gauge_never_reports_negative() {
        let gauge = QueueGauge::default();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_worker_status_summary() {
        let statuses: Vec<Arc<WorkerStatus>> = (0..4).map(|_| WorkerStatus::new()).collect();
        statuses[1].set(WorkerState::Processing);
        statuses[2].set(WorkerState::Processing);
        statuses[3].set(WorkerState::Stopped);

        assert_eq!(statuses[1].get(), WorkerState::Processing);
        assert_eq!(
            summarize_states(&statuses),
            "1 idle, 2 processing, 1 stopped"
        );
    }
}
