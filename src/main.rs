//! # Conductor CLI (`conductor`)
//!
//! Builds and queries a local semantic index over exported AI chat
//! conversations.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `conductor init` | Create the SQLite database and run schema migrations |
//! | `conductor ingest --chatgpt <path> ...` | Parse exports, chunk, embed and index them |
//! | `conductor ask "<query>"` | Retrieve relevant past conversations |
//! | `conductor stats` | Show per-collection and per-platform counts |
//! | `conductor reset` | Drop indexed data (raw exports are never touched) |
//!
//! ## Examples
//!
//! ```bash
//! conductor init --config ./config/conductor.toml
//! conductor ingest --chatgpt ~/exports/chatgpt.zip --grok ~/exports/grok
//! conductor ask "how did we handle jwt refresh" --platform chatgpt
//! conductor ask "lru cache" --collection code --json
//! conductor reset --platform gemini
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use conductor_index::models::{Collection, Platform};
use conductor_index::progress::ProgressMode;
use conductor_index::{answer, config, db, ingest, migrate, stats};

/// Conductor: a local-first semantic index over your AI chat history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/conductor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Conductor: a local-first semantic index over exported AI chat conversations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest one or more platform exports.
    ///
    /// Each platform is processed independently: a broken export is
    /// reported and the remaining platforms still run. Re-ingesting the
    /// same export adds nothing new.
    Ingest {
        /// ChatGPT export: `conversations.json`, its directory, or the export zip.
        #[arg(long)]
        chatgpt: Option<PathBuf>,

        /// Gemini Takeout directory or a single conversation JSON file.
        #[arg(long)]
        gemini: Option<PathBuf>,

        /// Grok export zip, directory or JSON file.
        #[arg(long)]
        grok: Option<PathBuf>,

        /// Antigravity brain directory.
        #[arg(long)]
        antigravity: Option<PathBuf>,

        /// Clear the index (not the embedding cache) before ingesting.
        #[arg(long)]
        reset: bool,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Retrieve context relevant to a query.
    Ask {
        query: String,

        /// Only return entries from this platform.
        #[arg(long)]
        platform: Option<Platform>,

        /// Number of results (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Collections to search; repeatable. Defaults to `[retrieval].collections`.
        #[arg(long = "collection")]
        collections: Vec<Collection>,

        /// Search code snippets in this fence language (e.g. `rust`).
        #[arg(long, conflicts_with = "collections")]
        language: Option<String>,

        /// Print the result as JSON, including the rendered context block.
        #[arg(long)]
        json: bool,

        /// Show the semantic, lexical and recency components of each score.
        #[arg(long)]
        explain: bool,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Delete indexed data.
    ///
    /// Without `--platform` the whole index and the embedding cache are
    /// cleared. With `--platform` only that platform's entries go.
    Reset {
        #[arg(long)]
        platform: Option<Platform>,

        /// Keep cached embeddings on a full reset.
        #[arg(long)]
        keep_cache: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            chatgpt,
            gemini,
            grok,
            antigravity,
            reset,
            progress,
        } => {
            let sources: Vec<(Platform, PathBuf)> = [
                (Platform::ChatGpt, chatgpt),
                (Platform::Gemini, gemini),
                (Platform::Grok, grok),
                (Platform::Antigravity, antigravity),
            ]
            .into_iter()
            .filter_map(|(platform, path)| path.map(|p| (platform, p)))
            .collect();
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_ingest(&cfg, &sources, reset, mode).await?;
        }
        Commands::Ask {
            query,
            platform,
            top_k,
            collections,
            language,
            json,
            explain,
        } => {
            answer::run_ask(
                &cfg,
                &query,
                platform,
                top_k,
                &collections,
                language.as_deref(),
                json,
                explain,
            )
            .await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Reset {
            platform,
            keep_cache,
        } => {
            ingest::run_reset(&cfg, platform, keep_cache).await?;
        }
    }

    Ok(())
}
