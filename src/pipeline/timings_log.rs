//! Frontend timings debug log
//!
//! Best-effort, append-only JSONL log of frontend (page/ajax) events.
//! Parsers hand lines to a bounded queue with `try_send`; a full queue drops
//! the line and bumps `debug_log_dropped`. A single task owns the file.

use super::stats::PipelineStats;
use super::types::{ApdexClass, EventKind, ParsedEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

#[derive(Serialize)]
struct TimingsLine<'a> {
    stream: &'a str,
    kind: EventKind,
    action: &'a str,
    timestamp_ms: i64,
    apdex: ApdexClass,
    timings: &'a BTreeMap<String, f64>,
}

#[derive(Clone)]
pub struct FrontendTimingsLog {
    tx: mpsc::Sender<String>,
    stats: Arc<PipelineStats>,
}

impl FrontendTimingsLog {
    /// Open `path` for appending and start the writer task
    ///
    /// Failing to open the file is returned to the caller (fatal at startup).
    /// The task ends once every clone of the returned handle is dropped.
    pub fn open(
        path: &Path,
        capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let file = tokio::fs::File::from_std(file);

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task_stats = stats.clone();
        let display = path.display().to_string();
        let handle = tokio::spawn(async move {
            run_writer(rx, BufWriter::new(file), task_stats, display).await;
        });

        log::info!("📝 Frontend timings log: {}", path.display());
        Ok((Self { tx, stats }, handle))
    }

    /// Queue one event; never waits
    pub fn record(&self, event: &ParsedEvent) {
        let line = TimingsLine {
            stream: &event.stream_id,
            kind: event.kind,
            action: &event.action,
            timestamp_ms: event.timestamp_ms,
            apdex: event.apdex,
            timings: &event.timings,
        };
        let Ok(json) = serde_json::to_string(&line) else {
            self.stats.debug_log_dropped.incr();
            return;
        };

        match self.tx.try_send(json) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.debug_log_dropped.incr();
            }
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<String>,
    mut out: BufWriter<tokio::fs::File>,
    stats: Arc<PipelineStats>,
    path: String,
) {
    while let Some(line) = rx.recv().await {
        let mut batch = vec![line];
        while let Ok(line) = rx.try_recv() {
            batch.push(line);
        }

        for line in &batch {
            let written = async {
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await
            }
            .await;
            match written {
                Ok(()) => stats.debug_log_written.incr(),
                Err(e) => {
                    stats.debug_log_dropped.incr();
                    log::warn!("⚠️  Failed to write frontend timings to {}: {}", path, e);
                }
            }
        }
        if let Err(e) = out.flush().await {
            log::warn!("⚠️  Failed to flush frontend timings log {}: {}", path, e);
        }
    }

    if let Err(e) = out.flush().await {
        log::warn!("⚠️  Failed to flush frontend timings log {}: {}", path, e);
    }
    log::debug!("✅ Frontend timings log closed: {}", path);
}
