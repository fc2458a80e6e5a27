//! Join handles and published states of one worker pool

use super::stats::{summarize_states, WorkerState, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Outcome of joining a pool at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinReport {
    pub finished: usize,
    pub aborted: usize,
    pub panicked: usize,
}

impl JoinReport {
    pub fn is_clean(&self) -> bool {
        self.aborted == 0 && self.panicked == 0
    }
}

pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
    statuses: Vec<Arc<WorkerStatus>>,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
            statuses: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: JoinHandle<()>, status: Arc<WorkerStatus>) {
        self.handles.push(handle);
        self.statuses.push(status);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn statuses(&self) -> &[Arc<WorkerStatus>] {
        &self.statuses
    }

    pub fn summary(&self) -> String {
        summarize_states(&self.statuses)
    }

    /// Wait for every worker, aborting those still running after `limit`
    pub async fn join(self, limit: Duration) -> JoinReport {
        let deadline = Instant::now() + limit;
        let mut report = JoinReport::default();

        for (index, mut handle) in self.handles.into_iter().enumerate() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.finished += 1,
                Ok(Err(e)) if e.is_panic() => {
                    log::error!("❌ {} {} panicked: {}", self.name, index, e);
                    report.panicked += 1;
                }
                Ok(Err(e)) => {
                    log::warn!("⚠️  {} {} was cancelled: {}", self.name, index, e);
                    report.aborted += 1;
                }
                Err(_) => {
                    log::warn!(
                        "⚠️  {} {} did not stop within {}ms, aborting",
                        self.name,
                        index,
                        limit.as_millis()
                    );
                    handle.abort();
                    report.aborted += 1;
                }
            }
        }

        for status in &self.statuses {
            status.set(WorkerState::Stopped);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_collects_finished_workers() {
        let mut pool = WorkerPool::new("parser");
        for _ in 0..3 {
            let status = WorkerStatus::new();
            let task_status = status.clone();
            pool.push(
                tokio::spawn(async move { task_status.set(WorkerState::Stopped) }),
                status,
            );
        }
        assert_eq!(pool.len(), 3);

        let report = pool.join(Duration::from_secs(1)).await;
        assert_eq!(report.finished, 3);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_join_aborts_stragglers() {
        let mut pool = WorkerPool::new("writer");
        pool.push(tokio::spawn(async {}), WorkerStatus::new());
        let stuck = WorkerStatus::new();
        stuck.set(WorkerState::Processing);
        pool.push(
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
            stuck.clone(),
        );

        let report = pool.join(Duration::from_millis(50)).await;
        assert_eq!(report.finished, 1);
        assert_eq!(report.aborted, 1);
        assert!(!report.is_clean());
        assert_eq!(stuck.get(), WorkerState::Stopped);
    }
}
