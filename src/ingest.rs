//! Multi-document ingestion.
//!
//! Creates a knowledge base and uploads files into it one at a time:
//!
//! ```text
//! validate ─▶ create knowledge base ─▶ for each file, in order:
//!   (fatal on error)                      cancelled? ─▶ skip rest
//!                                         pre-flight (size, type)
//!                                         upload via gateway, await
//!                                         record outcome ─▶ next
//! ```
//!
//! Uploads are strictly sequential. That bounds backend load and keeps the
//! aggregate progress linear; a failed file is recorded and the loop moves
//! on. Only knowledge-base creation can fail the whole job.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::UploadConfig;
use crate::error::{ApiError, ApiResult};
use crate::estimate::file_extension;
use crate::models::{CreateKnowledgeBaseParams, KnowledgeBase};
use crate::progress::{FileOutcome, NoProgress, ProgressEvent, ProgressReporter};
use crate::transport::{ProgressFn, UploadFile};

/// A file to ingest: on disk (read just before its upload) or in memory.
#[derive(Debug, Clone)]
pub enum IngestSource {
    Path(PathBuf),
    Memory(UploadFile),
}

impl IngestSource {
    pub fn name(&self) -> String {
        match self {
            Self::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.display().to_string()),
            Self::Memory(f) => f.file_name.clone(),
        }
    }

    async fn size(&self) -> ApiResult<u64> {
        match self {
            Self::Path(p) => Ok(tokio::fs::metadata(p).await?.len()),
            Self::Memory(f) => Ok(f.len()),
        }
    }

    async fn load(self) -> ApiResult<UploadFile> {
        match self {
            Self::Path(p) => UploadFile::from_path(&p).await,
            Self::Memory(f) => Ok(f),
        }
    }
}

impl From<PathBuf> for IngestSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<UploadFile> for IngestSource {
    fn from(file: UploadFile) -> Self {
        Self::Memory(file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Uploading,
    Done(FileOutcome),
}

#[derive(Debug, Clone)]
pub struct JobFile {
    pub name: String,
    pub status: FileStatus,
}

/// Per-file state of a running job.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub knowledge_base_id: String,
    pub files: Vec<JobFile>,
}

impl IngestionJob {
    fn new(knowledge_base_id: String, names: Vec<String>) -> Self {
        Self {
            knowledge_base_id,
            files: names
                .into_iter()
                .map(|name| JobFile {
                    name,
                    status: FileStatus::Pending,
                })
                .collect(),
        }
    }

    pub fn total(&self) -> usize {
        self.files.len()
    }

    /// Files with a terminal status.
    pub fn completed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, FileStatus::Done(_)))
            .count()
    }

    /// `completed / total` as a percentage. Only ever grows, since a file
    /// never leaves `Done`.
    pub fn percent(&self) -> f64 {
        if self.files.is_empty() {
            return 100.0;
        }
        self.completed() as f64 * 100.0 / self.total() as f64
    }

    fn mark(&mut self, index: usize, status: FileStatus) {
        if let Some(file) = self.files.get_mut(index) {
            if !matches!(file.status, FileStatus::Done(_)) {
                file.status = status;
            }
        }
    }

    fn into_report(self, knowledge_base: Option<KnowledgeBase>, cancelled: bool) -> IngestReport {
        let files: Vec<FileReport> = self
            .files
            .into_iter()
            .map(|f| FileReport {
                name: f.name,
                outcome: match f.status {
                    FileStatus::Done(outcome) => outcome,
                    FileStatus::Pending | FileStatus::Uploading => FileOutcome::Skipped,
                },
            })
            .collect();
        let count = |pred: fn(&FileOutcome) -> bool| files.iter().filter(|f| pred(&f.outcome)).count();
        IngestReport {
            knowledge_base_id: self.knowledge_base_id,
            knowledge_base,
            succeeded: count(|o| matches!(o, FileOutcome::Succeeded { .. })),
            failed: count(|o| matches!(o, FileOutcome::Failed { .. })),
            skipped: count(|o| matches!(o, FileOutcome::Skipped)),
            cancelled,
            files,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub name: String,
    pub outcome: FileOutcome,
}

/// Final result of a job. Per-file failures live here, not in an `Err`.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub knowledge_base_id: String,
    /// Present when the job created the knowledge base.
    pub knowledge_base: Option<KnowledgeBase>,
    pub files: Vec<FileReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl IngestReport {
    pub fn failed_files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().filter_map(|f| match &f.outcome {
            FileOutcome::Failed { reason } => Some((f.name.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

pub struct IngestionOrchestrator {
    api: ApiClient,
    upload: UploadConfig,
    reporter: Arc<dyn ProgressReporter>,
    tags: Vec<String>,
}

impl IngestionOrchestrator {
    pub fn new(api: ApiClient, upload: UploadConfig) -> Self {
        Self {
            api,
            upload,
            reporter: Arc::new(NoProgress),
            tags: Vec::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Tag every uploaded document. Files that already carry tags keep them.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Create a knowledge base from `params` and upload `files` into it.
    ///
    /// Errors only for an empty file list (before any request) or when the
    /// knowledge base cannot be created.
    pub async fn ingest(
        &self,
        params: &CreateKnowledgeBaseParams,
        files: Vec<IngestSource>,
        cancel: &CancellationToken,
    ) -> ApiResult<IngestReport> {
        if files.is_empty() {
            return Err(ApiError::validation("no files selected for ingestion"));
        }
        let kb = self.api.create_knowledge_base(params).await?;
        tracing::info!(knowledge_base = %kb.id, name = %kb.name, files = files.len(), "knowledge base created");
        let kb_id = kb.id.clone();
        Ok(self.run(kb_id, Some(kb), files, cancel).await)
    }

    /// Upload `files` into an existing knowledge base.
    pub async fn ingest_into(
        &self,
        knowledge_base_id: &str,
        files: Vec<IngestSource>,
        cancel: &CancellationToken,
    ) -> ApiResult<IngestReport> {
        if files.is_empty() {
            return Err(ApiError::validation("no files selected for ingestion"));
        }
        if knowledge_base_id.trim().is_empty() {
            return Err(ApiError::validation("knowledge base id must not be empty"));
        }
        Ok(self
            .run(knowledge_base_id.to_string(), None, files, cancel)
            .await)
    }

    async fn run(
        &self,
        kb_id: String,
        kb: Option<KnowledgeBase>,
        files: Vec<IngestSource>,
        cancel: &CancellationToken,
    ) -> IngestReport {
        let total = files.len();
        let mut job = IngestionJob::new(kb_id.clone(), files.iter().map(|f| f.name()).collect());
        self.reporter.report(ProgressEvent::JobStarted {
            knowledge_base_id: kb_id.clone(),
            total,
        });

        let mut cancelled = false;
        for (index, source) in files.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(remaining = total - index, "ingestion cancelled");
                cancelled = true;
                break;
            }

            let name = source.name();
            job.mark(index, FileStatus::Uploading);
            self.reporter.report(ProgressEvent::FileStarted {
                index,
                total,
                name: name.clone(),
            });

            let outcome = match self.upload_one(&kb_id, index, source).await {
                Ok(document_id) => FileOutcome::Succeeded { document_id },
                Err(reason) => {
                    tracing::warn!(file = %name, %reason, "upload failed");
                    FileOutcome::Failed { reason }
                }
            };
            job.mark(index, FileStatus::Done(outcome.clone()));
            self.reporter.report(ProgressEvent::FileFinished {
                index,
                total,
                name,
                outcome,
                percent: job.percent(),
            });
        }

        let report = job.into_report(kb, cancelled);
        tracing::info!(
            knowledge_base = %report.knowledge_base_id,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "ingestion finished"
        );
        self.reporter.report(ProgressEvent::JobFinished {
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            cancelled: report.cancelled,
        });
        report
    }

    /// Upload one file; any error becomes the file's failure reason.
    async fn upload_one(
        &self,
        kb_id: &str,
        index: usize,
        source: IngestSource,
    ) -> Result<Option<String>, String> {
        let name = source.name();
        let ext = file_extension(&name);
        if !self.upload.allows_extension(&ext) {
            return Err(format!("unsupported file type '.{}'", ext));
        }
        let size = source.size().await.map_err(|e| e.to_string())?;
        if size > self.upload.max_file_bytes {
            return Err(format!(
                "file is {} bytes, limit is {}",
                size, self.upload.max_file_bytes
            ));
        }
        let mut file = source.load().await.map_err(|e| e.to_string())?;
        if file.tags.is_empty() && !self.tags.is_empty() {
            file = file.with_tags(self.tags.clone());
        }

        let reporter = self.reporter.clone();
        let on_progress: ProgressFn = Arc::new(move |sent, bytes| {
            reporter.report(ProgressEvent::FileBytes { index, sent, bytes });
        });

        match self.api.upload_document(kb_id, file, Some(on_progress)).await {
            Ok(doc) => Ok(Some(doc.id)),
            // The backend may acknowledge with an empty or non-document body.
            Err(ApiError::Decode(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}
