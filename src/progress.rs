//! Ingestion and indexing progress reporting.
//!
//! The orchestrator and the indexing watcher emit [`ProgressEvent`]s so users
//! see which file is uploading, how many are left, and how far backend
//! indexing has got. Output goes to **stderr** so stdout stays parseable.

use std::io::Write;
use std::sync::Arc;

use crate::models::IndexingProgress;

/// Terminal state of one file in an ingestion job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Succeeded { document_id: Option<String> },
    Failed { reason: String },
    /// Not attempted because the job was cancelled first.
    Skipped,
}

#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Knowledge base resolved; `total` files queued.
    JobStarted {
        knowledge_base_id: String,
        total: usize,
    },
    /// File `index` (0-based) is about to upload.
    FileStarted {
        index: usize,
        total: usize,
        name: String,
    },
    /// Bytes handed to the connection for the current file.
    FileBytes {
        index: usize,
        sent: u64,
        bytes: u64,
    },
    FileFinished {
        index: usize,
        total: usize,
        name: String,
        outcome: FileOutcome,
        /// Aggregate job progress after this file, in percent.
        percent: f64,
    },
    JobFinished {
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
    },
    /// One observation of backend indexing.
    Indexing {
        knowledge_base_id: String,
        progress: IndexingProgress,
    },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  [2/5]  40%  notes.md  ok".
///
/// Byte-level upload events are only emitted in JSON mode.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::JobStarted {
                knowledge_base_id,
                total,
            } => format!(
                "ingest  knowledge base {}  {} file(s) queued\n",
                knowledge_base_id, total
            ),
            ProgressEvent::FileStarted { index, total, name } => {
                format!("ingest  [{}/{}]  uploading {}\n", index + 1, total, name)
            }
            ProgressEvent::FileBytes { .. } => return,
            ProgressEvent::FileFinished {
                index,
                total,
                name,
                outcome,
                percent,
            } => {
                let status = match outcome {
                    FileOutcome::Succeeded { .. } => "ok".to_string(),
                    FileOutcome::Failed { reason } => format!("FAILED: {}", reason),
                    FileOutcome::Skipped => "skipped".to_string(),
                };
                format!(
                    "ingest  [{}/{}]  {:>3.0}%  {}  {}\n",
                    index + 1,
                    total,
                    percent,
                    name,
                    status
                )
            }
            ProgressEvent::JobFinished {
                succeeded,
                failed,
                skipped,
                cancelled,
            } => {
                let mut line = format!("ingest  done  {} succeeded, {} failed", succeeded, failed);
                if *skipped > 0 {
                    line.push_str(&format!(", {} skipped", skipped));
                }
                if *cancelled {
                    line.push_str("  (cancelled)");
                }
                line.push('\n');
                line
            }
            ProgressEvent::Indexing {
                knowledge_base_id,
                progress,
            } => format!(
                "index   {}  {:?}  {} / {} units ({:.0}%)\n",
                knowledge_base_id,
                progress.status,
                format_number(progress.processed),
                format_number(progress.total),
                progress.fraction() * 100.0
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::JobStarted {
            knowledge_base_id,
            total,
        } => serde_json::json!({
            "event": "job_started",
            "knowledge_base_id": knowledge_base_id,
            "total": total
        }),
        ProgressEvent::FileStarted { index, total, name } => serde_json::json!({
            "event": "file_started",
            "index": index,
            "total": total,
            "name": name
        }),
        ProgressEvent::FileBytes { index, sent, bytes } => serde_json::json!({
            "event": "file_bytes",
            "index": index,
            "sent": sent,
            "bytes": bytes
        }),
        ProgressEvent::FileFinished {
            index,
            total,
            name,
            outcome,
            percent,
        } => {
            let (status, detail) = match outcome {
                FileOutcome::Succeeded { document_id } => {
                    ("succeeded", serde_json::json!(document_id))
                }
                FileOutcome::Failed { reason } => ("failed", serde_json::json!(reason)),
                FileOutcome::Skipped => ("skipped", serde_json::Value::Null),
            };
            serde_json::json!({
                "event": "file_finished",
                "index": index,
                "total": total,
                "name": name,
                "status": status,
                "detail": detail,
                "percent": percent
            })
        }
        ProgressEvent::JobFinished {
            succeeded,
            failed,
            skipped,
            cancelled,
        } => serde_json::json!({
            "event": "job_finished",
            "succeeded": succeeded,
            "failed": failed,
            "skipped": skipped,
            "cancelled": cancelled
        }),
        ProgressEvent::Indexing {
            knowledge_base_id,
            progress,
        } => serde_json::json!({
            "event": "indexing",
            "knowledge_base_id": knowledge_base_id,
            "status": progress.status,
            "processed": progress.processed,
            "total": progress.total,
            "error": progress.error
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
