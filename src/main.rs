//! # docchat CLI
//!
//! Command-line interface for grounded question answering over
//! document APIs.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite answer log and run schema migrations |
//! | `docchat answer "<question>" --url <river-url>` | Answer a question from the documents of a river URL |
//! | `docchat ingest --url <river-url>` | Embed and index documents without asking a question |
//! | `docchat logs` | Show previously answered questions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the answer log
//! docchat init --config ./docchat.toml
//!
//! # Ask a question about the latest reports
//! docchat answer "What happened in the region?" --url "https://example.org/updates?search=floods"
//!
//! # Pre-index documents so the first question is fast
//! docchat ingest --url "https://example.org/updates?search=floods" --limit 20
//!
//! # Review past answers
//! docchat logs --question floods --limit 10
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchat::config::load_config;
use docchat::log::{query_logs, record_answer, LogFilter};
use docchat::models::AnswerRecord;
use docchat::pipeline::Pipeline;
use docchat::{db, migrate};

/// docchat — grounded question answering over document APIs.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Grounded question answering over document APIs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the answer log database.
    ///
    /// Creates the SQLite database file and the answer_logs table.
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Answer a question from the documents of a river URL.
    ///
    /// Fetches the documents, embeds and indexes the new or changed
    /// ones, retrieves the passages most relevant to the question and
    /// asks the completion model for a grounded answer. The exchange is
    /// recorded in the answer log.
    Answer {
        /// The question to answer.
        question: String,

        /// River URL selecting the source documents.
        #[arg(long)]
        url: String,

        /// Maximum number of source documents.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Identifier of the caller, recorded in the answer log.
        #[arg(long, default_value = "cli")]
        uid: String,
    },

    /// Embed and index the documents of a river URL.
    ///
    /// Same indexing as `answer` but without asking a question. Useful
    /// to pre-warm the index; unchanged documents are skipped.
    Ingest {
        /// River URL selecting the source documents.
        #[arg(long)]
        url: String,

        /// Maximum number of source documents.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show previously answered questions, most recent first.
    Logs {
        /// Only show entries whose question contains this text.
        #[arg(long)]
        question: Option<String>,

        /// Only show entries whose answer contains this text.
        #[arg(long)]
        answer: Option<String>,

        /// Only show entries recorded for this caller identifier.
        #[arg(long)]
        uid: Option<String>,

        /// Maximum number of entries to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Number of entries to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.log.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Answer {
            question,
            url,
            limit,
            uid,
        } => {
            let pipeline = Pipeline::from_config(&config)?;
            let record = pipeline.answer(&question, &url, limit, &uid).await;

            let pool = db::connect(&config.log.path).await?;
            migrate::run_migrations(&pool).await?;
            record_answer(&pool, &record).await?;

            print_record(&record);
        }
        Commands::Ingest { url, limit } => {
            let pipeline = Pipeline::from_config(&config)?;
            let report = pipeline.ingest(&url, limit).await?;

            println!(
                "Indexed {} document(s), skipped {} unchanged, {} failed.",
                report.indexed, report.skipped, report.failed
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
        }
        Commands::Logs {
            question,
            answer,
            uid,
            limit,
            offset,
        } => {
            let pool = db::connect(&config.log.path).await?;
            migrate::run_migrations(&pool).await?;

            let entries = query_logs(
                &pool,
                &LogFilter {
                    question,
                    answer,
                    uid,
                    limit,
                    offset,
                },
            )
            .await?;

            if entries.is_empty() {
                println!("No matching entries.");
            }
            for entry in entries {
                println!(
                    "#{} [{}] {} uid={} ({:.1}s)",
                    entry.id, entry.timestamp, entry.status, entry.uid, entry.duration
                );
                println!("Q: {}", entry.question);
                println!("A: {}", entry.answer);
                println!();
            }
        }
    }

    Ok(())
}

fn print_record(record: &AnswerRecord) {
    println!("{}", record.answer);

    if !record.passages.is_empty() {
        println!();
        println!("Sources:");
        for passage in &record.passages {
            match passage.source.page {
                Some(page) => println!(
                    "- {} ({}), page {}",
                    passage.source.title, passage.source.url, page
                ),
                None => println!("- {} ({})", passage.source.title, passage.source.url),
            }
        }
    }

    println!();
    println!("Stats:");
    for (stat, seconds) in &record.stats {
        println!("- {stat}: {seconds:.3}s");
    }

    for warning in &record.warnings {
        eprintln!("warning: {warning}");
    }
}
