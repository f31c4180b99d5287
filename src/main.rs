//! # Letterbox CLI (`lbx`)
//!
//! Ask questions about a mailbox of parsed emails.
//!
//! ## Usage
//!
//! ```bash
//! lbx --config ./config/letterbox.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lbx init` | Load emails, update sender profiles and build the index |
//! | `lbx query "<question>"` | Answer a question from the indexed emails |
//! | `lbx search "<query>"` | Show the emails a question would retrieve |
//! | `lbx refresh` | Reload the emails and rebuild the index |
//! | `lbx stats` | Pipeline, index and provider statistics |
//! | `lbx providers` | Check every configured provider |
//! | `lbx prompts` | List prompt templates |
//! | `lbx analyze <email-id>` | Summary, topics and sentiment of one email |
//!
//! ## Examples
//!
//! ```bash
//! lbx init --force
//! lbx query "what's new in AI this week?" --label news
//! lbx query "Hey Nate, what do you think about the new models?"
//! lbx search "quarterly report" --sender cfo@example.com -k 3
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use letterbox::config::{self, Config};
use letterbox::pipeline::QueryRequest;
use letterbox::{commands, logging};
use letterbox_core::models::SearchFilters;
use std::path::{Path, PathBuf};

/// Letterbox: question answering over your email.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/letterbox.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lbx",
    about = "Letterbox: retrieval-augmented question answering over parsed email",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist the built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/letterbox.toml")]
    config: PathBuf,

    /// Log level or filter directive when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Retrieval filters shared by `query` and `search`.
#[derive(clap::Args)]
struct FilterArgs {
    /// Only emails with this label (e.g. `news`).
    #[arg(long)]
    label: Option<String>,

    /// Only emails received within this many days.
    #[arg(long)]
    max_age_days: Option<u32>,

    /// Only emails from this sender (substring match).
    #[arg(long)]
    sender: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load emails, update sender profiles and build the vector index.
    ///
    /// A persisted index younger than `retrieval.freshness_hours` is reused
    /// unless `--force` is given.
    Init {
        /// Rebuild the index even when the persisted one is fresh.
        #[arg(long)]
        force: bool,
    },

    /// Answer a question from the indexed emails.
    ///
    /// Start the question with `Hey <name>,` to get an answer in that
    /// sender's voice.
    Query {
        question: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Print the full response envelope as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the emails retrieved for a query, without generating an answer.
    Search {
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Number of results (defaults to `retrieval.top_k`).
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Reload the emails and rebuild the index from scratch.
    Refresh,

    /// Show pipeline, index and provider statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check availability and health of every configured provider.
    Providers,

    /// List prompt templates, including configured overrides.
    Prompts,

    /// Summarise one email and extract its topics and sentiment.
    Analyze {
        email_id: String,

        #[arg(long)]
        json: bool,
    },
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init { force } => {
            commands::run_init(&cfg, force).await?;
        }
        Commands::Query {
            question,
            filters,
            json,
        } => {
            let request = QueryRequest {
                question,
                label: filters.label,
                max_age_days: filters.max_age_days,
                sender: filters.sender,
            };
            commands::run_query(&cfg, request, json).await?;
        }
        Commands::Search { query, filters, k } => {
            let filters = SearchFilters {
                label: filters.label,
                max_age_days: filters.max_age_days,
                sender: filters.sender,
            };
            commands::run_search(&cfg, &query, filters, k).await?;
        }
        Commands::Refresh => {
            commands::run_refresh(&cfg).await?;
        }
        Commands::Stats { json } => {
            commands::run_stats(&cfg, json).await?;
        }
        Commands::Providers => {
            commands::run_providers(&cfg).await?;
        }
        Commands::Prompts => {
            commands::run_prompts(&cfg)?;
        }
        Commands::Analyze { email_id, json } => {
            commands::run_analyze(&cfg, &email_id, json).await?;
        }
    }

    Ok(())
}
