//! # Local RAG CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and the chunk schema |
//! | `rag ingest <path>` | Convert, chunk, embed, and index a file or directory |
//! | `rag query "<text>"` | Show the closest passages |
//! | `rag chat "<message>"` | Answer with retrieved context from an LLM backend |
//! | `rag documents` | List indexed documents |
//! | `rag delete <id>` | Remove a document's chunks |
//! | `rag models` | List models installed on the Ollama server |
//!
//! When the config file does not exist, built-in defaults are used.
//! Logs go to stderr and honour `RUST_LOG`; results go to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use local_rag::chat::ChatStream;
use local_rag::config::{self, Config};
use local_rag::context::{DeleteOutcome, RagContext};
use local_rag::generation::{Fragment, OllamaBackend};
use local_rag::ingest::{collect_files, IngestOptions};
use local_rag::migrate;
use local_rag_core::models::ConversationTurn;

/// Local RAG: ingest documents and chat with them.
#[derive(Parser)]
#[command(name = "rag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a file, or every supported file under a directory.
    Ingest {
        path: PathBuf,

        /// Replace documents that are already indexed.
        #[arg(long)]
        replace: bool,

        /// Only ingest files matching these globs (relative to `path`).
        #[arg(long = "include")]
        include: Vec<String>,
    },

    /// Retrieve the passages closest to a query.
    Query {
        text: String,

        /// Number of passages (defaults to `retrieval.top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Ask a question answered from the indexed documents.
    Chat {
        message: String,

        /// Generation backend: ollama, openai, anthropic, or gemini.
        #[arg(long, default_value = "ollama")]
        backend: String,

        /// Model name; each backend has a default.
        #[arg(long)]
        model: Option<String>,

        /// JSON file holding prior turns: `[{"role": "user", "content": "..."}]`.
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// List indexed documents with their chunk counts.
    Documents,

    /// Delete all chunks of a document.
    Delete {
        document_id: String,

        /// Also delete the backing file in `storage.upload_dir`.
        #[arg(long)]
        remove_file: bool,
    },

    /// List models available on the Ollama server.
    Models,
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        Ok(Config::minimal())
    }
}

fn read_history(path: &Path) -> Result<Vec<ConversationTurn>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Models => {
            let backend = OllamaBackend::new(reqwest::Client::new(), &cfg.providers.ollama);
            for model in backend.list_models().await {
                println!("{}", model);
            }
        }
        Commands::Ingest {
            path,
            replace,
            include,
        } => {
            let ctx = RagContext::open(cfg).await?;
            run_ingest(&ctx, &path, replace, &include).await?;
        }
        Commands::Query { text, k } => {
            let ctx = RagContext::open(cfg).await?;
            let k = k.unwrap_or(ctx.config().retrieval.top_k);
            let passages = ctx.query(&text, k).await?;
            if passages.is_empty() {
                println!("No results.");
            }
            for (i, p) in passages.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    p.similarity_score,
                    p.source_document_id,
                    p.chunk_id
                );
                println!("   {}", p.content.chars().take(200).collect::<String>().replace('\n', " "));
            }
        }
        Commands::Chat {
            message,
            backend,
            model,
            history,
        } => {
            let history = match history {
                Some(path) => read_history(&path)?,
                None => Vec::new(),
            };
            let ctx = RagContext::open(cfg).await?;
            run_chat(&ctx, &message, &history, &backend, model.as_deref()).await?;
        }
        Commands::Documents => {
            let ctx = RagContext::open(cfg).await?;
            let docs = ctx.documents().await?;
            if docs.is_empty() {
                println!("No documents indexed.");
            }
            for doc in docs {
                println!("{}  ({} chunks)", doc.document_id, doc.chunks);
            }
        }
        Commands::Delete {
            document_id,
            remove_file,
        } => {
            let ctx = RagContext::open(cfg).await?;
            match ctx.delete_document(&document_id, remove_file).await? {
                DeleteOutcome::NotFound => {
                    eprintln!("Document not found: {}", document_id);
                    std::process::exit(1);
                }
                DeleteOutcome::Deleted {
                    chunks,
                    file_removed,
                } => {
                    println!("Deleted {} ({} chunks)", document_id, chunks);
                    if file_removed {
                        println!("Removed backing file.");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_ingest(ctx: &RagContext, path: &Path, replace: bool, include: &[String]) -> Result<()> {
    let files = collect_files(path, include)?;
    if files.is_empty() {
        println!("No supported files found under {}", path.display());
        return Ok(());
    }

    let options = IngestOptions { replace };
    let mut failed = 0usize;
    for file in &files {
        match ctx.ingest_file(file, &options).await {
            Ok(report) => println!(
                "{}: {} chunks ({}, dim {})",
                report.document_id, report.chunk_count, report.embedding_model, report.embedding_dim
            ),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", file.display(), e);
            }
        }
    }

    println!("Ingested {} of {} files.", files.len() - failed, files.len());
    if failed > 0 {
        anyhow::bail!("{} files failed to ingest", failed);
    }
    Ok(())
}

async fn run_chat(
    ctx: &RagContext,
    message: &str,
    history: &[ConversationTurn],
    backend: &str,
    model: Option<&str>,
) -> Result<()> {
    let ChatStream {
        sources,
        mut fragments,
    } = ctx
        .chat_orchestrator()
        .answer_stream(message, history, backend, model)
        .await?;

    let mut stdout = std::io::stdout();
    let mut failure = None;
    while let Some(fragment) = fragments.next().await {
        match fragment {
            Fragment::Text(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            Fragment::Failure(f) => {
                failure = Some(f);
                break;
            }
        }
    }
    println!();

    if !sources.is_empty() {
        println!("\nSources:");
        for s in &sources {
            println!("- {}: {}", s.source_document_id, s.content_snippet.replace('\n', " "));
        }
    }

    if let Some(f) = failure {
        eprintln!("{}", f);
        std::process::exit(1);
    }
    Ok(())
}
