//! # trisource CLI (`ask`)
//!
//! The `ask` binary is the primary interface for trisource. It provides
//! commands for database initialization, document and workbook ingestion,
//! and routed question answering.
//!
//! ## Usage
//!
//! ```bash
//! ask --config ./config/ask.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ask init` | Create the SQLite database and run schema migrations |
//! | `ask ingest <file>` | Ingest a plain-text document into the vector index |
//! | `ask sheets <file> --schema <name>` | Ingest an .xlsx workbook as relational tables |
//! | `ask schemas` | List ingested tabular schemas |
//! | `ask remove <source>` | Remove an ingested document |
//! | `ask ask "<question>"` | Answer a question (document, tabular, or web mode) |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ask init --config ./config/ask.toml
//!
//! # Ingest extracted document text
//! ask ingest ./docs/safety-sheet.txt
//!
//! # Ingest a workbook under a schema name
//! ask sheets ./data/q3-sales.xlsx --schema sales
//!
//! # Document-mode question
//! ask ask "What is the flash point of acetone?"
//!
//! # Tabular-mode question (inferred from --schema)
//! ask ask "Total amount by region" --schema sales
//!
//! # Web-mode question
//! ask ask "Latest stable Rust release" --web
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use trisource::cache::ResponseCache;
use trisource::config::{self, Config};
use trisource::db;
use trisource::embedding::create_embedder;
use trisource::error::RouterError;
use trisource::index::VectorIndex;
use trisource::ingest;
use trisource::llm::create_chat_provider;
use trisource::migrate;
use trisource::models::SourceMode;
use trisource::router::{AskOptions, RetrievalParams, RetrievalRouter};
use trisource::sheet;
use trisource::tabular;
use trisource::web::create_fetcher;

/// trisource CLI — question answering over documents, spreadsheets, and
/// the web.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ask.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ask",
    about = "trisource — question answering over documents, spreadsheets, and the web",
    version,
    long_about = "trisource routes natural-language questions to the right retrieval path: \
    hybrid semantic+lexical search over ingested documents, NL-to-SQL over spreadsheet-derived \
    tables, or live web search. Answers are cached with TTL expiry."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ask.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a plain-text document.
    ///
    /// Chunks the file, embeds each chunk, and stores everything in the
    /// vector index and SQLite. Reingesting the same source replaces its
    /// previous content.
    Ingest {
        /// Path to a plain-text file (extracted document text).
        file: PathBuf,

        /// Source identifier; defaults to the file path.
        #[arg(long)]
        source: Option<String>,

        /// Human-readable title; defaults to the file stem.
        #[arg(long)]
        title: Option<String>,
    },

    /// Ingest an .xlsx workbook as relational tables.
    ///
    /// Each worksheet becomes one table under the given schema name, with
    /// column types inferred from cell contents. Reingesting replaces the
    /// schema's tables.
    Sheets {
        /// Path to the .xlsx file.
        file: PathBuf,

        /// Schema name to group this workbook's tables under.
        #[arg(long)]
        schema: String,
    },

    /// List ingested tabular schemas and their table counts.
    Schemas,

    /// Remove an ingested document by source identifier.
    Remove {
        /// Source identifier used at ingestion time.
        source: String,
    },

    /// Answer a question.
    ///
    /// Mode is explicit via --mode, or inferred: --schema implies tabular,
    /// --web implies web, otherwise document retrieval.
    Ask {
        /// The question to answer.
        question: String,

        /// Retrieval mode: `document`, `tabular`, or `web`.
        #[arg(long)]
        mode: Option<String>,

        /// Target schema for tabular questions.
        #[arg(long)]
        schema: Option<String>,

        /// Route to web search.
        #[arg(long)]
        web: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Ingest {
            file,
            source,
            title,
        } => run_ingest(&config, &file, source, title).await,
        Commands::Sheets { file, schema } => run_sheets(&config, &file, &schema).await,
        Commands::Schemas => run_schemas(&config).await,
        Commands::Remove { source } => run_remove(&config, &source).await,
        Commands::Ask {
            question,
            mode,
            schema,
            web,
        } => run_ask(&config, &question, mode, schema, web).await,
    }
}

async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("initialized {}", config.db.path.display());
    Ok(())
}

async fn run_ingest(
    config: &Config,
    file: &PathBuf,
    source: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)?;
    let source = source.unwrap_or_else(|| file.display().to_string());
    let title = title.or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
    });

    let pool = db::connect(&config.db.path).await?;
    let index = VectorIndex::open(&config.index.path)?;
    let embedder = create_embedder(&config.embedding)?;

    let outcome = ingest::ingest_text(
        &pool,
        &index,
        embedder.as_ref(),
        &source,
        title.as_deref(),
        &text,
        &config.chunking,
    )
    .await?;

    println!("ingest {}", source);
    println!("  document: {}", outcome.document_id);
    println!("  chunks written: {}", outcome.chunks);
    println!("  index entries: {}", index.len());
    println!("ok");

    pool.close().await;
    Ok(())
}

async fn run_sheets(config: &Config, file: &PathBuf, schema: &str) -> Result<()> {
    let bytes = std::fs::read(file)?;
    let pool = db::connect(&config.db.path).await?;

    let tables = sheet::ingest_workbook(&pool, schema, &bytes).await?;
    if tables.is_empty() {
        println!("No worksheets with data found.");
    } else {
        println!("sheets {} (schema: {})", file.display(), schema);
        for table in &tables {
            println!(
                "  table {}: {} rows, {} columns",
                table.name,
                table.row_count,
                table.columns.len()
            );
        }
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

async fn run_schemas(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    let schemas = tabular::list_schemas(&pool).await?;

    if schemas.is_empty() {
        println!("No schemas.");
    } else {
        for (name, table_count) in &schemas {
            println!("{} ({} tables)", name, table_count);
        }
    }

    pool.close().await;
    Ok(())
}

async fn run_remove(config: &Config, source: &str) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    let index = VectorIndex::open(&config.index.path)?;

    if ingest::remove_document(&pool, &index, source).await? {
        println!("removed {}", source);
    } else {
        anyhow::bail!("document not found: {}", source);
    }

    pool.close().await;
    Ok(())
}

async fn run_ask(
    config: &Config,
    question: &str,
    mode: Option<String>,
    schema: Option<String>,
    web: bool,
) -> Result<()> {
    let mode = match mode.as_deref() {
        None => None,
        Some("document") => Some(SourceMode::Document),
        Some("tabular") => Some(SourceMode::Tabular),
        Some("web") => Some(SourceMode::Web),
        Some(other) => anyhow::bail!(
            "Unknown mode: {}. Use document, tabular, or web.",
            other
        ),
    };

    let pool = db::connect(&config.db.path).await?;
    let index = Arc::new(VectorIndex::open(&config.index.path)?);
    let cache = Arc::new(ResponseCache::new(
        Duration::from_secs(config.cache.ttl_secs),
        config.cache.capacity,
    ));

    let router = RetrievalRouter::new(
        pool.clone(),
        index,
        cache,
        create_embedder(&config.embedding)?,
        create_chat_provider(&config.llm)?,
        create_fetcher(&config.web)?,
        RetrievalParams {
            candidate_k: config.retrieval.candidate_k,
            final_k: config.retrieval.final_k,
        },
    );

    let options = AskOptions { mode, schema, web };
    match router.ask(question, &options).await {
        Ok(response) => {
            println!("{}", response.answer);
            if let Some(sql) = &response.sql {
                println!();
                println!("query: {}", sql);
            }
            if !response.citations.is_empty() {
                println!();
                println!("Citations:");
                for (i, citation) in response.citations.iter().enumerate() {
                    println!("  [{}] {}", i + 1, citation);
                }
            }
            if response.cached {
                println!();
                println!("(cached)");
            }
        }
        Err(RouterError::RetrievalEmpty) => {
            println!("The answer is not present in the available sources.");
        }
        Err(e) => {
            pool.close().await;
            return Err(e.into());
        }
    }

    pool.close().await;
    Ok(())
}
