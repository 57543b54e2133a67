use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use navgraph_core::event::EventBus;
use navgraph_core::types::EngineEvent;

/// JSONL execution logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{YYYYMMDD}.jsonl`. Lines are flushed as they are written, so a
/// crash loses at most the entry being written.
pub struct ExecutionLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl ExecutionLogger {
    /// `level`: 1 = execution start/finish, 2 = + steps, 3 = + metric updates.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task until `cancel` fires or
    /// the bus closes.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }

        let mut day = Utc::now().date_naive();
        let Some(mut writer) = open_daily(&self.log_dir, day).await else {
            return;
        };
        info!(dir = %self.log_dir.display(), level = self.level, "ExecutionLogger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ExecutionLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "ExecutionLogger lagged, skipped events");
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, ExecutionLogger stopping");
                            break;
                        }
                    };
                    let Some(entry) = self.event_to_entry(&event) else {
                        continue;
                    };

                    let today = Utc::now().date_naive();
                    if today != day {
                        writer.flush().await.ok();
                        match open_daily(&self.log_dir, today).await {
                            Some(next) => writer = next,
                            None => break,
                        }
                        day = today;
                    }

                    if let Ok(json) = serde_json::to_string(&entry) {
                        let line = format!("{}\n", json);
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!("ExecutionLogger finished");
    }

    /// Convert an event to a log entry, `None` when filtered by level.
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let timestamp = Utc::now().to_rfc3339();

        match event {
            EngineEvent::ExecutionStarted { execution_id, kind } => Some(LogEntry {
                timestamp,
                event_type: "execution_started",
                execution_id: Some(execution_id.to_string()),
                detail: Some(serde_json::json!({ "kind": kind })),
            }),
            EngineEvent::ExecutionCompleted {
                execution_id,
                steps,
                elapsed_ms,
            } => Some(LogEntry {
                timestamp,
                event_type: "execution_completed",
                execution_id: Some(execution_id.to_string()),
                detail: Some(serde_json::json!({
                    "steps": steps,
                    "elapsed_ms": elapsed_ms,
                })),
            }),
            EngineEvent::ExecutionFailed {
                execution_id,
                error,
            } => Some(LogEntry {
                timestamp,
                event_type: "execution_failed",
                execution_id: Some(execution_id.to_string()),
                detail: Some(serde_json::json!({ "error": error })),
            }),

            EngineEvent::StepCompleted {
                execution_id,
                index,
                result,
            } if self.level >= 2 => Some(LogEntry {
                timestamp,
                event_type: "step_completed",
                execution_id: Some(execution_id.to_string()),
                detail: Some(serde_json::json!({
                    "index": index,
                    "target": result.target,
                    "success": result.success,
                    "recovered": result.recovered,
                    "elapsed_ms": result.elapsed_ms,
                    "evidence_ref": result.evidence_ref,
                    "error": result.error,
                })),
            }),

            EngineEvent::MetricUpdated { key, point } if self.level >= 3 => Some(LogEntry {
                timestamp,
                event_type: "metric_updated",
                execution_id: None,
                detail: Some(serde_json::json!({
                    "key": key.to_string(),
                    "total": point.total,
                    "successes": point.successes,
                    "avg_execution_ms": point.avg_execution_ms,
                    "confidence": point.confidence(),
                })),
            }),

            _ => None,
        }
    }
}

/// Path of the log file for `day`.
pub fn daily_log_path(log_dir: &Path, day: NaiveDate) -> PathBuf {
    log_dir.join(format!("{}.jsonl", day.format("%Y%m%d")))
}

async fn open_daily(log_dir: &Path, day: NaiveDate) -> Option<BufWriter<File>> {
    let path = daily_log_path(log_dir, day);
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open log file");
            None
        }
    }
}
