//! # askdoc CLI
//!
//! The `askdoc` binary is the operational interface to the answer engine:
//! database initialization, document ingestion, question answering, session
//! inspection, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! askdoc --config ./config/askdoc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdoc init` | Create the session database and run schema migrations |
//! | `askdoc ingest <path>` | Chunk, embed, and persist a document |
//! | `askdoc ask <collection> "<question>"` | Ask a question and print the cited answer |
//! | `askdoc sessions <user>` | List a user's chat sessions |
//! | `askdoc turns <session>` | Print a session's question/answer history |
//! | `askdoc delete-session <session>` | Delete a session and its turns |
//! | `askdoc delete-collection <collection>` | Delete a collection and its snapshot |
//! | `askdoc serve` | Start the HTTP API server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use askdoc::config;
use askdoc::engine::{AskOutcome, Engine};
use askdoc::server;

/// askdoc — a retrieval-augmented answer engine for uploaded documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/askdoc.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "askdoc",
    about = "askdoc — answer questions about uploaded documents with cited sources",
    version,
    long_about = "askdoc ingests extracted document text (chunking and embedding it through \
    an external embedding service), mirrors the resulting vector index to durable storage, \
    and answers questions by retrieving relevant passages and synthesizing a cited answer \
    through an external generation service."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askdoc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the session database schema.
    ///
    /// Creates the SQLite database file and the sessions/turns tables.
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Ingest a document from a local file of extracted text.
    ///
    /// Chunks the text, embeds each chunk through the configured embedding
    /// service, and persists the collection snapshot with an incremented
    /// version. Re-ingesting the same document replaces its chunks.
    Ingest {
        /// Path to the extracted-text file.
        path: PathBuf,

        /// Document id; defaults to the file name.
        #[arg(long)]
        document_id: Option<String>,
    },

    /// Ask a question against an ingested collection.
    Ask {
        /// Collection id (equals the document id).
        collection_id: String,

        /// The question.
        question: String,

        /// Session to append the turn to; a new session is opened when omitted.
        #[arg(long)]
        session: Option<String>,

        /// User id recorded on the session.
        #[arg(long, default_value = "local")]
        user: String,

        /// Answer language (defaults to the question's language).
        #[arg(long)]
        language: Option<String>,
    },

    /// List a user's chat sessions, newest first.
    Sessions {
        /// User id.
        user_id: String,
    },

    /// Print a session's question/answer history in order.
    Turns {
        /// Session id.
        session_id: String,
    },

    /// Delete a session and all of its turns.
    DeleteSession {
        /// Session id.
        session_id: String,
    },

    /// Delete a collection: its durable snapshot and cached index.
    DeleteCollection {
        /// Collection id.
        collection_id: String,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and exposes the
    /// ingest/ask/session endpoints as JSON.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = askdoc::db::connect(&cfg.db.path).await?;
            askdoc::migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, document_id } => {
            let bytes = std::fs::read(&path)?;
            let document_id = document_id.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string())
            });

            let engine = Engine::from_config(cfg).await?;
            let collection_id = engine.ingest(&document_id, &bytes).await?;
            println!("ingested document '{}'", document_id);
            println!("  collection: {}", collection_id);
        }
        Commands::Ask {
            collection_id,
            question,
            session,
            user,
            language,
        } => {
            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let engine = Engine::from_config(cfg).await?;

            match engine
                .ask(
                    &collection_id,
                    &session_id,
                    &user,
                    &question,
                    language.as_deref(),
                )
                .await?
            {
                AskOutcome::Answered(turn) => {
                    println!("{}", turn.answer);
                    if !turn.citations.is_empty() {
                        println!();
                        println!("cited chunks:");
                        for chunk_id in &turn.citations {
                            println!("  {}", chunk_id);
                        }
                    }
                    println!();
                    println!("session: {} (turn {})", turn.session_id, turn.sequence_index);
                }
                AskOutcome::NoDocumentContext => {
                    println!("no document has been ingested into collection '{}'", collection_id);
                }
            }
        }
        Commands::Sessions { user_id } => {
            let engine = Engine::from_config(cfg).await?;
            let sessions = engine.list_sessions(&user_id).await?;
            if sessions.is_empty() {
                println!("no sessions for user '{}'", user_id);
            }
            for s in sessions {
                println!(
                    "{}  collection={}  created={}",
                    s.session_id,
                    s.collection_id,
                    s.created_at.format("%Y-%m-%dT%H:%M:%SZ")
                );
            }
        }
        Commands::Turns { session_id } => {
            let engine = Engine::from_config(cfg).await?;
            for turn in engine.list_turns(&session_id).await? {
                println!("[{}] Q: {}", turn.sequence_index, turn.question);
                println!("    A: {}", turn.answer);
                if !turn.citations.is_empty() {
                    println!("    cites: {}", turn.citations.join(", "));
                }
            }
        }
        Commands::DeleteSession { session_id } => {
            let engine = Engine::from_config(cfg).await?;
            engine.delete_session(&session_id).await?;
            println!("deleted session '{}'", session_id);
        }
        Commands::DeleteCollection { collection_id } => {
            let engine = Engine::from_config(cfg).await?;
            engine.delete_collection(&collection_id).await?;
            println!("deleted collection '{}'", collection_id);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
