//! Writer Pool
//!
//! A writer takes flush requests from its queue, registers them as in
//! flight against their day and upserts them through the resource pool.
//! Failed requests go to a local retry queue with exponential backoff; the
//! in-flight registration is held across retries, so the day's handles
//! stay open. A request that exhausts its attempts is counted as data loss.

use super::backoff::RetryPolicy;
use super::resources::{InFlightGuard, ResourcePool};
use super::stats::{PipelineStats, WorkerState, WorkerStatus};
use super::types::FlushRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

struct PendingRetry {
    request: FlushRequest,
    failures: u32,
    ready_at: Instant,
    guard: InFlightGuard,
}

pub struct Writer {
    id: usize,
    resources: Arc<ResourcePool>,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
    status: Arc<WorkerStatus>,
}

impl Writer {
    pub fn new(
        id: usize,
        resources: Arc<ResourcePool>,
        policy: RetryPolicy,
        stats: Arc<PipelineStats>,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            id,
            resources,
            policy,
            stats,
            status,
        }
    }

    /// Run until the input queue is closed and no retry is pending
    pub async fn run(self, mut rx: mpsc::Receiver<FlushRequest>) {
        log::debug!("💾 Writer {} started", self.id);
        let mut pending: Vec<PendingRetry> = Vec::new();
        let mut input_open = true;

        loop {
            if !input_open && pending.is_empty() {
                break;
            }
            let next_due = pending.iter().map(|p| p.ready_at).min();

            self.status.set(if input_open {
                WorkerState::Receiving
            } else {
                WorkerState::Draining
            });

            tokio::select! {
                maybe_request = rx.recv(), if input_open => {
                    match maybe_request {
                        Some(request) => {
                            self.stats.writer_queue.dec();
                            let guard = self.resources.begin(request.day);
                            self.attempt(request, guard, 0, &mut pending).await;
                        }
                        None => input_open = false,
                    }
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    let (due, waiting): (Vec<_>, Vec<_>) =
                        pending.drain(..).partition(|p| p.ready_at <= now);
                    pending = waiting;
                    for retry in due {
                        self.stats.retry_queue.dec();
                        self.attempt(retry.request, retry.guard, retry.failures, &mut pending)
                            .await;
                    }
                }
            }
        }

        self.status.set(WorkerState::Stopped);
        log::debug!("✅ Writer {} stopped", self.id);
    }

    async fn attempt(
        &self,
        request: FlushRequest,
        guard: InFlightGuard,
        failures: u32,
        pending: &mut Vec<PendingRetry>,
    ) {
        self.status.set(WorkerState::Processing);

        let result = match self.resources.acquire_for(&guard).await {
            Ok(collections) => collections.upsert(&request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) if outcome.duplicate => {
                self.stats.duplicate_flushes.incr();
                log::debug!("Writer {}: flush {} already applied", self.id, request.id);
            }
            Ok(outcome) => {
                self.stats.documents_written.add(outcome.documents as u64);
                log::trace!(
                    "Writer {}: flush {} wrote {} documents to {} ({})",
                    self.id,
                    request.id,
                    outcome.documents,
                    request.storage_target,
                    request.day
                );
            }
            Err(e) => {
                let failures = failures + 1;
                if self.policy.should_retry(failures) {
                    let delay = self.policy.delay_for(failures - 1);
                    self.stats.write_retries.incr();
                    self.stats.retry_queue.inc();
                    log::warn!(
                        "⚠️  Writer {}: flush {} failed (attempt {}/{}): {}",
                        self.id,
                        request.id,
                        failures,
                        self.policy.max_attempts,
                        e
                    );
                    log::warn!("   └─ Retrying in {}ms", delay.as_millis());
                    pending.push(PendingRetry {
                        request,
                        failures,
                        ready_at: Instant::now() + delay,
                        guard,
                    });
                } else {
                    self.stats.data_loss_requests.incr();
                    self.stats.data_loss_aggregates.add(request.len() as u64);
                    log::error!(
                        "💥 DATA LOSS: writer {} dropped flush {} after {} attempts",
                        self.id,
                        request.id,
                        failures
                    );
                    log::error!(
                        "   ├─ {} aggregates for {} on {}",
                        request.len(),
                        request.storage_target,
                        request.day
                    );
                    log::error!("   └─ Last error: {}", e);
                }
            }
        }
    }
}
