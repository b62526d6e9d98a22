//! # ragline CLI
//!
//! The `ragline` binary drives the retrieval and context-assembly
//! pipeline against a TOML configuration file.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and run schema migrations |
//! | `ragline ask "<question>"` | Run one full chat turn and print the answer |
//! | `ragline search "<query>"` | Inspect hybrid retrieval and reranking without generating |
//! | `ragline usage` | Print accumulated token/cost totals for a session |
//!
//! Chunk ingestion is owned by a separate collaborator; `init` only creates
//! the schema that collaborator populates.
//!
//! ## Examples
//!
//! ```bash
//! ragline init --config ./config/ragline.toml
//! ragline ask "what changed in Q3 revenue?" --session demo
//! ragline search "photosynthesis" --limit 5
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ragline::config::{load_config, Config};
use ragline::db;
use ragline::generation::OpenAIGenerationClient;
use ragline::ledger::SessionLedger;
use ragline::migrate;
use ragline::pipeline::ChatPipeline;
use ragline::rerank::rerank;
use ragline::session::SqliteMessageStore;
use ragline::store::{ChunkStore, FilterSpec, SqliteChunkStore};

/// ragline — retrieval and context-assembly pipeline for chat over
/// document chunks.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "Retrieval and context-assembly pipeline for chat over document chunks",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ask a question: one full pipeline turn including generation.
    Ask {
        question: String,

        /// Conversation session to read history from and append to.
        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Run retrieval and reranking only; print the ranked chunks.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Only chunks from this document.
        #[arg(long)]
        document: Option<String>,

        /// Only chunks carrying this tag.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Print accumulated usage for a session.
    Usage {
        #[arg(long, default_value = "default")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Ask { question, session } => {
            run_ask(&config, &question, &session).await?;
        }
        Commands::Search {
            query,
            limit,
            document,
            tag,
        } => {
            run_search(&config, &query, limit, document, tag).await?;
        }
        Commands::Usage { session } => {
            // The ledger is in-process; a fresh CLI invocation has no
            // accumulated state. Report what the message log shows instead.
            run_usage(&config, &session).await?;
        }
    }

    Ok(())
}

async fn run_ask(config: &Config, question: &str, session: &str) -> Result<()> {
    let pool = db::connect(&config.db).await?;

    let store = Arc::new(SqliteChunkStore::new(
        pool.clone(),
        config.retrieval.clone(),
        config.embedding.clone(),
    ));
    let generation = Arc::new(OpenAIGenerationClient::new(config.generation.clone())?);
    let messages = Arc::new(SqliteMessageStore::new(pool.clone()));
    let ledger = Arc::new(SessionLedger::new(config.ledger.cost_per_million_tokens));

    let pipeline = ChatPipeline::new(
        config.clone(),
        store,
        generation,
        messages,
        Arc::clone(&ledger),
    );

    let outcome = pipeline.chat_turn(session, question).await?;

    println!("{}", outcome.answer);
    if !outcome.sources.is_empty() {
        println!();
        println!("Sources: {}", outcome.sources.join(", "));
    }
    println!(
        "tokens: {} | follow-up: {} | context truncated: {}",
        outcome.tokens_used, outcome.was_followup, outcome.context_truncated
    );

    pool.close().await;
    Ok(())
}

async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    document: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let pool = db::connect(&config.db).await?;
    let store = SqliteChunkStore::new(
        pool.clone(),
        config.retrieval.clone(),
        config.embedding.clone(),
    );

    let top_k = limit.unwrap_or(config.retrieval.top_k);
    let candidate_limit = top_k * config.retrieval.candidate_multiplier;
    let filters = FilterSpec {
        document_name: document,
        tag,
    };

    let candidates = store.search(query, candidate_limit, Some(&filters)).await?;
    if candidates.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    let ranked = rerank(None, candidates, top_k);
    for (i, chunk) in ranked.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} / p. {} ({})",
            i + 1,
            chunk.score(),
            chunk.document_name,
            chunk.page,
            chunk.kind.as_str()
        );
        println!(
            "    excerpt: \"{}\"",
            chunk.text.chars().take(120).collect::<String>().replace('\n', " ")
        );
        println!("    id: {}", chunk.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

async fn run_usage(config: &Config, session: &str) -> Result<()> {
    let pool = db::connect(&config.db).await?;

    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(json_extract(metadata_json, '$.tokens_used')), 0)
        FROM messages
        WHERE session_id = ? AND role = 'assistant'
        "#,
    )
    .bind(session)
    .fetch_optional(&pool)
    .await?;

    match row {
        Some((turns, tokens)) if turns > 0 => {
            let cost = tokens as f64 * config.ledger.cost_per_million_tokens / 1_000_000.0;
            println!("session: {session}");
            println!("assistant turns: {turns}");
            println!("tokens: {tokens}");
            println!("estimated cost: ${cost:.4}");
        }
        _ => println!("No recorded turns for session '{session}'."),
    }

    pool.close().await;
    Ok(())
}
