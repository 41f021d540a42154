//! # Aero CLI (`aero`)
//!
//! The `aero` binary wires the core together: database initialization,
//! one-shot ingestion and querying, stats, and the HTTP server the UI
//! layer talks to.
//!
//! ## Usage
//!
//! ```bash
//! aero --config ./config/aero.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aero init` | Create the SQLite database and run schema migrations |
//! | `aero ingest <file>` | Ingest an extracted-text file into the knowledge base |
//! | `aero query "<question>"` | Answer a question against a scope |
//! | `aero stats` | Show knowledge-base stats |
//! | `aero serve` | Start the HTTP server |

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aero::activity::TracingSink;
use aero::cache::{ResponseCache, SqliteCacheTier};
use aero::completion::HttpCompletionClient;
use aero::config::{load_config, Config};
use aero::embedding::create_provider;
use aero::index::VectorIndex;
use aero::ingest::{IngestRequest, Ingestor};
use aero::models::{QueryRequest, Role, SourceType};
use aero::pipeline::{PipelineOptions, RetrievalPipeline};
use aero::server::{run_server, AppState};
use aero::stats::{collect_stats, print_stats};
use aero::store::DocumentStore;
use aero::{db, migrate};

#[derive(Parser)]
#[command(
    name = "aero",
    about = "Aero — educational question answering over an ingested knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/aero.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest an extracted-text file into the knowledge base.
    Ingest {
        /// Path to the extracted text (the PDF/transcript extraction stage
        /// runs upstream of this command).
        file: PathBuf,

        /// Document title.
        #[arg(long)]
        title: String,

        /// Source type: pdf, video, or youtube.
        #[arg(long, default_value = "pdf")]
        source_type: String,

        /// Knowledge-base scope the document belongs to.
        #[arg(long)]
        scope: String,

        /// Re-ingest an existing document by id.
        #[arg(long)]
        document_id: Option<String>,
    },

    /// Answer a question against a scope.
    Query {
        question: String,

        #[arg(long)]
        scope: String,

        #[arg(long, default_value = "cli")]
        user: String,

        #[arg(long, default_value = "student")]
        role: String,
    },

    /// Show knowledge-base stats.
    Stats,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
            Ok(())
        }
        Commands::Ingest {
            file,
            title,
            source_type,
            scope,
            document_id,
        } => {
            let source_type = SourceType::parse(&source_type)
                .with_context(|| format!("unknown source type: {}", source_type))?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;

            let app = build_app(&config).await?;
            let report = app
                .ingestor
                .ingest(IngestRequest {
                    document_id,
                    title,
                    source_type,
                    scope,
                    text,
                })
                .await?;

            println!("ingested document {}", report.document_id);
            println!("  chunks:   {}", report.chunks);
            println!("  embedded: {}", report.embedded);
            println!("  status:   {}", report.status.as_str());
            Ok(())
        }
        Commands::Query {
            question,
            scope,
            user,
            role,
        } => {
            let role =
                Role::parse(&role).with_context(|| format!("unknown role: {}", role))?;

            let app = build_app(&config).await?;
            app.ingestor.load_index().await?;

            let response = app
                .pipeline
                .answer(QueryRequest {
                    user_id: user,
                    role,
                    scope,
                    query: question,
                })
                .await;

            println!("{}", response.answer);
            if !response.source_document_ids.is_empty() {
                println!();
                println!("sources: {}", response.source_document_ids.join(", "));
            }
            println!(
                "({} ms, cache {})",
                response.latency_ms,
                if response.cache_hit { "hit" } else { "miss" }
            );
            Ok(())
        }
        Commands::Stats => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let store = DocumentStore::new(pool);
            let report = collect_stats(&store, None).await?;
            print_stats(&report);
            Ok(())
        }
        Commands::Serve => {
            let app = build_app(&config).await?;
            app.ingestor.load_index().await?;
            run_server(&config.server.bind, app).await
        }
    }
}

/// Wire up the shared components from configuration.
async fn build_app(config: &Config) -> Result<AppState> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let store = Arc::new(DocumentStore::new(pool.clone()));
    let index = Arc::new(VectorIndex::new());

    let local_capacity = NonZeroUsize::new(config.cache.local_capacity)
        .context("cache.local_capacity must be > 0")?;
    let cache = Arc::new(ResponseCache::new(
        local_capacity,
        Duration::from_secs(config.cache.ttl_secs),
        Arc::new(SqliteCacheTier::new(pool)),
    ));

    let embedder: Arc<dyn aero::embedding::EmbeddingProvider> =
        Arc::from(create_provider(&config.embedding)?);
    let completion = Arc::new(HttpCompletionClient::new(&config.completion)?);

    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        index.clone(),
        cache.clone(),
        embedder.clone(),
        config.chunking.clone(),
        config.embedding.batch_size,
    ));

    let pipeline = Arc::new(RetrievalPipeline::new(
        store.clone(),
        index,
        cache,
        embedder,
        completion,
        Arc::new(TracingSink),
        PipelineOptions::from_config(&config.retrieval, &config.completion),
    ));

    Ok(AppState {
        pipeline,
        ingestor,
        store,
    })
}
