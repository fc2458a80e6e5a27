//! Intake and Parser Pool
//!
//! The intake task takes messages off the bus and deals them round-robin to
//! the parser queues. Parser workers resolve the stream, decode the payload
//! and forward each event to the updater that owns its partition. Both
//! sides use bounded queues and `send().await`, so a slow stage pushes back
//! all the way to the bus.

use super::backoff::{ExponentialBackoff, RetryPolicy};
use super::bus::MessageSource;
use super::processor::Processor;
use super::stats::{PipelineStats, WorkerState, WorkerStatus};
use super::streams::StreamRegistry;
use super::timings_log::FrontendTimingsLog;
use super::types::{partition_for, ParsedEvent, RawMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Why the intake task returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// The bus reported end of input
    EndOfInput,
    /// The controller asked intake to stop
    Stopped,
    /// Transient bus errors persisted past the retry budget
    BusFailed,
    /// Every parser queue is closed
    ParsersGone,
}

/// Read `source` until it ends or `shutdown` flips to true
///
/// On shutdown, messages already available from the source are still
/// forwarded. The parser senders are dropped on return, which closes the
/// parser queues.
pub async fn run_intake<S>(
    mut source: S,
    parsers: Vec<mpsc::Sender<RawMessage>>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<PipelineStats>,
    retry: RetryPolicy,
) -> IntakeOutcome
where
    S: MessageSource,
{
    log::info!("📥 Intake started: {}", source.describe());
    let mut dispatcher = Dispatcher {
        parsers,
        next: 0,
        stats,
    };
    let mut backoff = ExponentialBackoff::new(retry);

    let outcome = loop {
        if *shutdown.borrow() {
            break IntakeOutcome::Stopped;
        }

        let received = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped controller counts as a stop request
                if changed.is_err() || *shutdown.borrow() {
                    break IntakeOutcome::Stopped;
                }
                continue;
            }
            received = source.recv() => received,
        };

        match received {
            Ok(Some(msg)) => {
                backoff.reset();
                if !dispatcher.dispatch(msg).await {
                    break IntakeOutcome::ParsersGone;
                }
            }
            Ok(None) => {
                log::info!("📭 End of input: {}", source.describe());
                break IntakeOutcome::EndOfInput;
            }
            Err(e) if e.is_transient() => {
                dispatcher.stats.bus_errors.incr();
                log::warn!("⚠️  Bus read failed: {}", e);
                if backoff.sleep().await.is_err() {
                    log::error!(
                        "❌ Bus unavailable after {} retries, stopping intake",
                        backoff.attempts()
                    );
                    break IntakeOutcome::BusFailed;
                }
            }
            Err(e) => {
                dispatcher.stats.bus_errors.incr();
                log::warn!("⚠️  Skipping bus message: {}", e);
            }
        }
    };

    if outcome == IntakeOutcome::Stopped {
        let mut drained = 0u64;
        while let Some(msg) = source.try_recv() {
            if !dispatcher.dispatch(msg).await {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            log::info!("📥 Forwarded {} buffered messages before stopping", drained);
        }
    }

    log::info!("✅ Intake stopped ({:?})", outcome);
    outcome
}

struct Dispatcher {
    parsers: Vec<mpsc::Sender<RawMessage>>,
    next: usize,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    /// Round-robin over the open parser queues; false once none is left
    async fn dispatch(&mut self, mut msg: RawMessage) -> bool {
        self.stats.received.incr();
        while !self.parsers.is_empty() {
            let index = self.next % self.parsers.len();
            self.stats.parser_queue.inc();
            match self.parsers[index].send(msg).await {
                Ok(()) => {
                    self.next = index + 1;
                    return true;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.stats.parser_queue.dec();
                    log::error!("❌ Parser queue {} closed", index);
                    self.parsers.remove(index);
                    msg = returned;
                }
            }
        }
        self.stats.dropped_on_shutdown.incr();
        false
    }
}

/// State shared by every parser worker
pub struct ParserContext {
    pub registry: Arc<StreamRegistry>,
    pub processor: Processor,
    pub stats: Arc<PipelineStats>,
    pub timings_log: Option<FrontendTimingsLog>,
}

impl ParserContext {
    /// Route, resolve and decode one message; `None` when it is dropped
    pub fn process(&self, msg: &RawMessage) -> Option<ParsedEvent> {
        let (kind, stream_id) = msg.route();

        let Some(stream) = self.registry.lookup(stream_id) else {
            self.stats.dropped_unmatched.incr();
            log::trace!("Dropped message for unsubscribed stream '{}'", stream_id);
            return None;
        };
        if !stream.enabled {
            self.stats.dropped_disabled.incr();
            return None;
        }

        let attribute = self.registry.apdex_attribute_for(stream, kind);
        match self.processor.parse(msg, kind, stream, attribute) {
            Ok(event) => {
                self.stats.parsed.incr();
                if kind.is_frontend() {
                    if let Some(timings_log) = &self.timings_log {
                        timings_log.record(&event);
                    }
                }
                Some(event)
            }
            Err(e) => {
                self.stats.record_parse_error(&e);
                log::debug!("⚠️  Dropped {} message for {}: {}", kind.as_str(), stream_id, e);
                None
            }
        }
    }
}

/// One parser worker; returns when its input queue closes
pub async fn run_parser(
    id: usize,
    mut rx: mpsc::Receiver<RawMessage>,
    updaters: Vec<mpsc::Sender<ParsedEvent>>,
    ctx: Arc<ParserContext>,
    status: Arc<WorkerStatus>,
) {
    log::debug!("🧩 Parser {} started", id);

    loop {
        status.set(WorkerState::Receiving);
        let Some(msg) = rx.recv().await else {
            break;
        };
        ctx.stats.parser_queue.dec();

        status.set(WorkerState::Processing);
        let Some(event) = ctx.process(&msg) else {
            continue;
        };

        status.set(WorkerState::Forwarding);
        let partition = partition_for(&event.stream_id, event.bucket_ms, updaters.len());
        ctx.stats.updater_queue.inc();
        if updaters[partition].send(event).await.is_err() {
            ctx.stats.updater_queue.dec();
            ctx.stats.dropped_on_shutdown.incr();
            log::error!("❌ Parser {}: updater {} is gone, event dropped", id, partition);
        }
    }

    status.set(WorkerState::Draining);
    drop(updaters);
    status.set(WorkerState::Stopped);
    log::debug!("✅ Parser {} stopped", id);
}
