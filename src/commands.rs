//! Handlers behind the `kbc` subcommands.
//!
//! Each `run_*` function performs one command against the backend and
//! prints its result to stdout. Progress and diagnostics go to stderr.

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::Config;
use crate::estimate::{estimate_job, JobEstimate};
use crate::gateway::RequestGateway;
use crate::ingest::{IngestReport, IngestSource, IngestionOrchestrator};
use crate::models::{CreateKnowledgeBaseParams, SearchParams, SegmentationConfig};
use crate::poller::{AbortReason, IndexingProgressPoller, PollOutcome};
use crate::progress::{FileOutcome, ProgressMode};
use crate::session::{SessionEvent, SessionStore};

/// Open the session store and build the client stack from `config`.
pub fn connect(config: &Config) -> Result<ApiClient> {
    let session = match config.session.resolved_path() {
        Some(path) => SessionStore::open(path)?,
        None => SessionStore::in_memory(),
    };
    let session = Arc::new(session);
    watch_session(&session);
    let gateway = RequestGateway::from_config(config, session)
        .context("Failed to build HTTP client")?;
    Ok(ApiClient::new(Arc::new(gateway)))
}

/// Tell the user once if the backend ends their session mid-command.
fn watch_session(session: &SessionStore) {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, SessionEvent::Expired) {
                eprintln!("Session expired. Run `kbc login` to sign in again.");
            }
        }
    });
}

/// Use `password` if given, otherwise read one line from stdin.
pub fn read_password(password: Option<String>) -> Result<String> {
    if let Some(p) = password {
        return Ok(p);
    }
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        bail!("A password is required");
    }
    Ok(line)
}

fn format_timestamp(ts: Option<&str>) -> String {
    match ts {
        Some(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|_| s.to_string()),
        None => "-".to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

// ============ auth ============

pub async fn run_login(api: &ApiClient, username: &str, password: &str) -> Result<()> {
    let user = api.login(username, password).await?;
    println!("Logged in as {} ({:?}).", user.username, user.role);
    Ok(())
}

pub async fn run_register(
    api: &ApiClient,
    username: &str,
    email: Option<&str>,
    password: &str,
) -> Result<()> {
    let user = api.register(username, email, password).await?;
    println!("Registered and logged in as {}.", user.username);
    Ok(())
}

pub fn run_logout(api: &ApiClient) -> Result<()> {
    if api.logout()? {
        println!("Logged out.");
    } else {
        println!("Not logged in.");
    }
    Ok(())
}

pub async fn run_whoami(api: &ApiClient) -> Result<()> {
    if !api.gateway().session().is_authenticated() {
        bail!("Not logged in. Run `kbc login` first.");
    }
    let user = api.current_user().await?;
    println!("{}", user.username);
    println!("    id: {}", user.id);
    if let Some(email) = &user.email {
        println!("    email: {}", email);
    }
    println!("    role: {:?}", user.role);
    println!("    since: {}", format_timestamp(user.created_at.as_deref()));
    Ok(())
}

// ============ knowledge bases ============

pub async fn run_kb_list(api: &ApiClient) -> Result<()> {
    let kbs = api.list_knowledge_bases().await?;
    if kbs.is_empty() {
        println!("No knowledge bases.");
        return Ok(());
    }
    for kb in kbs {
        println!(
            "{}  {}  ({} docs, {} words, updated {})",
            kb.id,
            kb.name,
            kb.document_count,
            kb.word_count,
            format_timestamp(kb.updated_at.as_deref())
        );
    }
    Ok(())
}

pub async fn run_kb_show(api: &ApiClient, id: &str) -> Result<()> {
    let kb = api.get_knowledge_base(id).await?;
    println!("{}", kb.name);
    println!("    id: {}", kb.id);
    if let Some(desc) = &kb.description {
        println!("    description: {}", desc);
    }
    println!("    status: {:?}", kb.status);
    println!("    visibility: {:?}", kb.permission);
    println!("    indexing: {:?}", kb.indexing_technique);
    if let Some(model) = &kb.embedding_model {
        println!("    embedding model: {}", model);
    }
    if let (Some(size), Some(overlap)) = (kb.chunk_size, kb.chunk_overlap) {
        println!("    chunking: {} chars, {} overlap", size, overlap);
    }
    println!("    documents: {}", kb.document_count);
    println!("    created: {}", format_timestamp(kb.created_at.as_deref()));
    Ok(())
}

pub async fn run_kb_create(api: &ApiClient, params: &CreateKnowledgeBaseParams) -> Result<()> {
    let kb = api.create_knowledge_base(params).await?;
    println!("Created knowledge base {} ({}).", kb.name, kb.id);
    Ok(())
}

pub async fn run_kb_delete(api: &ApiClient, id: &str) -> Result<()> {
    api.delete_knowledge_base(id).await?;
    println!("Deleted knowledge base {}.", id);
    Ok(())
}

// ============ documents ============

pub async fn run_docs_list(api: &ApiClient, kb_id: &str) -> Result<()> {
    let docs = api.list_documents(kb_id).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in docs {
        println!(
            "{}  {}  {:?}  {}  {} chunks",
            doc.id,
            doc.name,
            doc.status,
            format_bytes(doc.size),
            doc.chunk_count
        );
        if let Some(err) = &doc.error_message {
            println!("    error: {}", err);
        }
    }
    Ok(())
}

pub async fn run_docs_delete(api: &ApiClient, kb_id: &str, doc_id: &str) -> Result<()> {
    api.delete_document(kb_id, doc_id).await?;
    println!("Deleted document {}.", doc_id);
    Ok(())
}

pub async fn run_docs_chunks(api: &ApiClient, kb_id: &str, doc_id: &str) -> Result<()> {
    let chunks = api.list_chunks(kb_id, doc_id).await?;
    if chunks.is_empty() {
        println!("No chunks.");
        return Ok(());
    }
    for (i, chunk) in chunks.iter().enumerate() {
        println!("--- chunk {} ({}) ---", i + 1, chunk.id);
        println!("{}", chunk.content.trim());
    }
    Ok(())
}

// ============ ingestion ============

pub struct IngestArgs {
    /// Name of the knowledge base to create. Unused with `into`.
    pub name: Option<String>,
    pub description: Option<String>,
    pub files: Vec<PathBuf>,
    pub into: Option<String>,
    pub tags: Vec<String>,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub progress: ProgressMode,
    pub watch: bool,
}

fn file_sizes(files: &[PathBuf]) -> Result<Vec<(String, u64)>> {
    files
        .iter()
        .map(|path| {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            Ok((name, meta.len()))
        })
        .collect()
}

fn estimate_for(files: &[PathBuf], seg: &SegmentationConfig) -> Result<JobEstimate> {
    let sizes = file_sizes(files)?;
    Ok(estimate_job(sizes.iter().map(|(n, s)| (n.as_str(), *s)), seg))
}

fn print_estimate(estimate: &JobEstimate) {
    for (name, est) in &estimate.files {
        println!(
            "  {}  {}  ~{} chars  ~{} chunks",
            name, est.file_type, est.estimated_text_chars, est.estimated_chunks
        );
    }
    println!(
        "Total: {} in {} file(s), ~{} chunks, ~{} min of processing",
        format_bytes(estimate.total_bytes),
        estimate.files.len(),
        estimate.total_chunks,
        estimate.processing_minutes
    );
}

pub fn run_estimate(files: &[PathBuf], chunk_size: u32, chunk_overlap: u32) -> Result<()> {
    if files.is_empty() {
        bail!("No files given");
    }
    let seg = SegmentationConfig {
        chunk_size,
        chunk_overlap,
        ..SegmentationConfig::default()
    };
    print_estimate(&estimate_for(files, &seg)?);
    Ok(())
}

fn print_report(report: &IngestReport) {
    println!(
        "Knowledge base {}: {} succeeded, {} failed, {} skipped{}",
        report.knowledge_base_id,
        report.succeeded,
        report.failed,
        report.skipped,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for file in &report.files {
        match &file.outcome {
            FileOutcome::Failed { reason } => println!("    FAILED  {}: {}", file.name, reason),
            FileOutcome::Skipped => println!("    skipped {}", file.name),
            FileOutcome::Succeeded { .. } => {}
        }
    }
}

pub async fn run_ingest(
    config: &Config,
    api: &ApiClient,
    args: IngestArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    if args.files.is_empty() {
        bail!("No files given");
    }
    if args.into.is_none() && args.name.is_none() {
        bail!("Give a knowledge base name or --into <id>");
    }
    let seg = SegmentationConfig {
        chunk_size: args.chunk_size,
        chunk_overlap: args.chunk_overlap,
        ..SegmentationConfig::default()
    };
    if args.progress == ProgressMode::Human {
        if let Ok(estimate) = estimate_for(&args.files, &seg) {
            print_estimate(&estimate);
        }
    }

    let reporter = args.progress.reporter();
    let orchestrator = IngestionOrchestrator::new(api.clone(), config.upload.clone())
        .with_reporter(reporter.clone())
        .with_tags(args.tags);
    let sources: Vec<IngestSource> = args.files.into_iter().map(IngestSource::from).collect();

    let report = match &args.into {
        Some(kb_id) => orchestrator.ingest_into(kb_id, sources, cancel).await?,
        None => {
            let name = args.name.unwrap_or_default();
            let params = CreateKnowledgeBaseParams {
                description: args.description,
                chunk_size: args.chunk_size,
                chunk_overlap: args.chunk_overlap,
                segmentation_config: Some(seg),
                ..CreateKnowledgeBaseParams::named(name)
            };
            orchestrator.ingest(&params, sources, cancel).await?
        }
    };
    print_report(&report);

    if args.watch && report.succeeded > 0 && !report.cancelled {
        let poller =
            IndexingProgressPoller::from_config(api.clone(), &config.poll).with_reporter(reporter);
        let outcome = poller
            .watch(&report.knowledge_base_id, cancel, |_| {})
            .await;
        print_outcome(&outcome)?;
    }

    if report.failed > 0 {
        bail!("{} of {} file(s) failed", report.failed, report.files.len());
    }
    Ok(())
}

// ============ indexing progress ============

fn print_outcome(outcome: &PollOutcome) -> Result<()> {
    match outcome {
        PollOutcome::Completed(p) => {
            println!("Indexing completed: {} / {} units.", p.processed, p.total);
            Ok(())
        }
        PollOutcome::Failed(p) => bail!(
            "Indexing failed after {} / {} units: {}",
            p.processed,
            p.total,
            p.error.as_deref().unwrap_or("no reason given")
        ),
        PollOutcome::Aborted(AbortReason::Cancelled) => {
            println!("Stopped watching indexing progress.");
            Ok(())
        }
        PollOutcome::Aborted(AbortReason::Request(e)) => {
            bail!("Indexing progress unavailable: {}", e)
        }
        PollOutcome::Aborted(AbortReason::Task(e)) => bail!("Indexing watcher died: {}", e),
    }
}

pub async fn run_progress(
    config: &Config,
    api: &ApiClient,
    kb_id: &str,
    watch: bool,
    progress: ProgressMode,
    cancel: &CancellationToken,
) -> Result<()> {
    if !watch {
        let p = api.indexing_progress(kb_id).await?;
        println!(
            "{:?}: {} / {} units ({:.0}%)",
            p.status,
            p.processed,
            p.total,
            p.fraction() * 100.0
        );
        if let Some(err) = &p.error {
            println!("    error: {}", err);
        }
        return Ok(());
    }
    let poller = IndexingProgressPoller::from_config(api.clone(), &config.poll)
        .with_reporter(progress.reporter());
    let outcome = poller.watch(kb_id, cancel, |_| {}).await;
    print_outcome(&outcome)
}

// ============ search / download ============

pub async fn run_search(
    api: &ApiClient,
    kb_id: &str,
    query: &str,
    limit: Option<u32>,
    score_threshold: Option<f32>,
) -> Result<()> {
    let params = SearchParams {
        knowledge_base_id: kb_id.to_string(),
        query: query.to_string(),
        limit,
        score_threshold,
        rerank: None,
    };
    let results = api.search(&params).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, result.score, result.id.as_deref().unwrap_or("-"));
        println!("    excerpt: \"{}\"", result.content.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

pub async fn run_download(api: &ApiClient, url: &str, dest: &Path) -> Result<()> {
    let bytes = api.gateway().download(url, dest).await?;
    println!("Saved {} to {}.", format_bytes(bytes), dest.display());
    Ok(())
}
