//! # kb-console CLI (`kbc`)
//!
//! The `kbc` binary drives a knowledge-base backend from the terminal:
//! sign in, manage knowledge bases and documents, ingest files, follow
//! indexing and search.
//!
//! ## Usage
//!
//! ```bash
//! kbc --config ./config/kbc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbc login <user>` | Sign in and store the session |
//! | `kbc register <user>` | Create an account and sign in |
//! | `kbc logout` | Drop the stored session |
//! | `kbc whoami` | Show the signed-in user |
//! | `kbc kb list\|show\|create\|delete` | Manage knowledge bases |
//! | `kbc docs list\|delete\|chunks` | Manage documents |
//! | `kbc ingest --name <name> <files…>` | Create a knowledge base and upload files |
//! | `kbc estimate <files…>` | Estimate chunks and processing time |
//! | `kbc progress <kb>` | Show or follow indexing progress |
//! | `kbc search <kb> "<query>"` | Search a knowledge base |
//! | `kbc download <url> <path>` | Save a backend file locally |
//!
//! ## Examples
//!
//! ```bash
//! # Upload a folder of notes and follow indexing until it finishes
//! kbc ingest --name "Team notes" notes/*.md --watch
//!
//! # Add tagged files to an existing knowledge base, machine-readable progress
//! kbc ingest --into 3f2c --tag q3 --tag finance extra.pdf --progress json
//!
//! # Point at another backend for one command
//! KBC_API_URL=https://kb.example.com kbc kb list
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kb_console::commands::{self, IngestArgs};
use kb_console::config::{self, Config};
use kb_console::models::CreateKnowledgeBaseParams;
use kb_console::progress::ProgressMode;

/// kb-console CLI: a resilient client for a knowledge-base backend.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "kbc",
    about = "kb-console: manage, ingest into and search a knowledge-base backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session token.
    Login {
        username: String,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },

    /// Create an account and sign in.
    Register {
        username: String,
        #[arg(long)]
        email: Option<String>,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },

    /// Drop the stored session.
    Logout,

    /// Show the signed-in user.
    Whoami,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Manage documents in a knowledge base.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Create a knowledge base and upload files into it, one at a time.
    ///
    /// A file that fails to upload is reported and the rest continue.
    /// Ctrl-C stops after the current file.
    Ingest {
        /// Name of the knowledge base to create.
        #[arg(long, required_unless_present = "into", conflicts_with = "into")]
        name: Option<String>,

        /// Files to upload, in order.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Upload into this existing knowledge base instead of creating one.
        #[arg(long)]
        into: Option<String>,

        /// Tag attached to every uploaded document. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, default_value_t = 1000)]
        chunk_size: u32,

        #[arg(long, default_value_t = 200)]
        chunk_overlap: u32,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Follow backend indexing after the uploads finish.
        #[arg(long)]
        watch: bool,
    },

    /// Estimate chunk counts and processing time without uploading.
    Estimate {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value_t = 1000)]
        chunk_size: u32,

        #[arg(long, default_value_t = 200)]
        chunk_overlap: u32,
    },

    /// Show indexing progress for a knowledge base.
    Progress {
        id: String,

        /// Poll until indexing completes or fails.
        #[arg(long)]
        watch: bool,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search a knowledge base.
    Search {
        kb: String,
        query: String,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Download a file from the backend.
    Download { url: String, path: PathBuf },
}

#[derive(Subcommand)]
enum KbAction {
    List,
    Show {
        id: String,
    },
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 1000)]
        chunk_size: u32,
        #[arg(long, default_value_t = 200)]
        chunk_overlap: u32,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum DocsAction {
    List { kb: String },
    Delete { kb: String, id: String },
    /// Print the chunks the backend produced for a document.
    Chunks { kb: String, id: String },
}

fn load(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let cfg = Config::minimal();
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; finishing the current step.");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't talk to the backend
    if let Commands::Estimate {
        files,
        chunk_size,
        chunk_overlap,
    } = &cli.command
    {
        return commands::run_estimate(files, *chunk_size, *chunk_overlap);
    }

    let cfg = load(&cli.config)?;
    let api = commands::connect(&cfg)?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Login { username, password } => {
            let password = commands::read_password(password)?;
            commands::run_login(&api, &username, &password).await?;
        }
        Commands::Register {
            username,
            email,
            password,
        } => {
            let password = commands::read_password(password)?;
            commands::run_register(&api, &username, email.as_deref(), &password).await?;
        }
        Commands::Logout => commands::run_logout(&api)?,
        Commands::Whoami => commands::run_whoami(&api).await?,
        Commands::Kb { action } => match action {
            KbAction::List => commands::run_kb_list(&api).await?,
            KbAction::Show { id } => commands::run_kb_show(&api, &id).await?,
            KbAction::Create {
                name,
                description,
                chunk_size,
                chunk_overlap,
            } => {
                let params = CreateKnowledgeBaseParams {
                    description,
                    chunk_size,
                    chunk_overlap,
                    ..CreateKnowledgeBaseParams::named(name)
                };
                commands::run_kb_create(&api, &params).await?;
            }
            KbAction::Delete { id } => commands::run_kb_delete(&api, &id).await?,
        },
        Commands::Docs { action } => match action {
            DocsAction::List { kb } => commands::run_docs_list(&api, &kb).await?,
            DocsAction::Delete { kb, id } => commands::run_docs_delete(&api, &kb, &id).await?,
            DocsAction::Chunks { kb, id } => commands::run_docs_chunks(&api, &kb, &id).await?,
        },
        Commands::Ingest {
            name,
            files,
            into,
            tags,
            description,
            chunk_size,
            chunk_overlap,
            progress,
            watch,
        } => {
            let args = IngestArgs {
                name,
                description,
                files,
                into,
                tags,
                chunk_size,
                chunk_overlap,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
                watch,
            };
            commands::run_ingest(&cfg, &api, args, &cancel).await?;
        }
        Commands::Progress {
            id,
            watch,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_progress(&cfg, &api, &id, watch, mode, &cancel).await?;
        }
        Commands::Search {
            kb,
            query,
            limit,
            threshold,
        } => {
            commands::run_search(&api, &kb, &query, limit, threshold).await?;
        }
        Commands::Download { url, path } => {
            commands::run_download(&api, &url, &path).await?;
        }
        Commands::Estimate { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
