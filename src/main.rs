//! # Tally CLI (`tally`)
//!
//! The `tally` binary wires the query pipeline and the index maintenance
//! jobs to a command line and an HTTP server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tally init` | Create the SQLite database and run schema migrations |
//! | `tally ask "<query>"` | Run one query through the full pipeline |
//! | `tally index append <id>` | Embed one record and promote a new index version |
//! | `tally index rebuild` | Re-embed the whole corpus and promote it |
//! | `tally index versions` | List stored index versions |
//! | `tally serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! tally --config ./tally.toml init --seed
//! tally --config ./tally.toml index rebuild
//! tally --config ./tally.toml ask "how much did I spend on groceries in June?"
//! tally --config ./tally.toml serve
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tally::config;
use tally::db;
use tally::format;
use tally::maintain::{Maintainer, RECEIPTS_KIND};
use tally::migrate;
use tally::models::{ExecutionResult, QueryOutcome};
use tally::pipeline::Pipeline;
use tally::records;
use tally::server;
use tally::store;
use tally::{embedding, model};

/// Tally — ask free-text questions about your stored financial records and
/// get computed answers.
#[derive(Parser)]
#[command(
    name = "tally",
    about = "Ask free-text questions about stored financial records and get computed answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./tally.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent — running it multiple times is safe.
    Init {
        /// Also insert a handful of demo receipts.
        #[arg(long)]
        seed: bool,
    },

    /// Run one query through the full pipeline and print the answer.
    ///
    /// If the generated code produces a file, it is written to the current
    /// directory (or --output) instead.
    Ask {
        /// The free-text question.
        query: String,

        /// Where to write a produced file.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also print the generated code that computed the answer.
        #[arg(long)]
        show_code: bool,
    },

    /// Manage the versioned similarity index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Start the HTTP server.
    Serve,
}

/// Index maintenance subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Embed one record and fold it into a new promoted index version.
    Append {
        /// Receipt id to index.
        record_id: i64,
    },
    /// Re-embed the entire corpus into a new promoted index version.
    Rebuild,
    /// List stored index versions, oldest first.
    Versions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tally=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init { seed } => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
            if seed {
                let pool = db::connect(&cfg).await?;
                let n = records::seed_demo_data(&pool).await?;
                pool.close().await;
                println!("Seeded {} demo receipts.", n);
            }
        }

        Commands::Ask {
            query,
            output,
            show_code,
        } => {
            let pool = db::connect(&cfg).await?;
            let pipeline = Pipeline::from_config(&cfg, pool.clone())?;

            match pipeline.answer(&query).await {
                QueryOutcome::Answered(answer) => {
                    println!("{}", answer.answer);
                    if show_code {
                        println!("\n--- generated code ---\n{}", answer.code);
                    }
                }
                QueryOutcome::FileProduced {
                    filename,
                    bytes,
                    code,
                } => {
                    let dest = output.unwrap_or_else(|| PathBuf::from(&filename));
                    let result = ExecutionResult::File {
                        filename: filename.clone(),
                        bytes: bytes.clone(),
                    };
                    let message = format::format_answer(None, &query, &code, &result).await;
                    std::fs::write(&dest, &bytes)?;
                    println!("{}", message.answer);
                    println!("Saved to {}", dest.display());
                    if show_code {
                        println!("\n--- generated code ---\n{code}");
                    }
                }
                QueryOutcome::Rejected { reason } => {
                    bail!("Query not allowed: {}", reason);
                }
                QueryOutcome::Exhausted { detail } => {
                    bail!("Unable to process query: {}", detail);
                }
                QueryOutcome::Failed { stage, message } => {
                    bail!("Query failed at stage '{}': {}", stage, message);
                }
            }

            pool.close().await;
        }

        Commands::Index { action } => {
            let pool = db::connect(&cfg).await?;
            let snapshot_store = store::create_store(&cfg.store)?;

            match action {
                IndexAction::Append { record_id } => {
                    let embedder = Arc::from(embedding::create_embedder(&cfg.embedding)?);
                    let maintainer = Maintainer::new(pool.clone(), snapshot_store, embedder);
                    let version = maintainer.append(record_id).await?;
                    println!(
                        "Indexed record {} into version {}.",
                        record_id, version.version_id
                    );
                }
                IndexAction::Rebuild => {
                    let embedder = Arc::from(embedding::create_embedder(&cfg.embedding)?);
                    let maintainer = Maintainer::new(pool.clone(), snapshot_store, embedder);
                    let version = maintainer.full_rebuild().await?;
                    println!("Rebuilt index; promoted version {}.", version.version_id);
                }
                IndexAction::Versions => {
                    let versions = snapshot_store.list_versions(RECEIPTS_KIND).await?;
                    if versions.is_empty() {
                        println!("No index versions stored.");
                    } else {
                        let latest = snapshot_store.latest_version_id(RECEIPTS_KIND).await?;
                        for v in versions {
                            let marker = if Some(&v.version_id) == latest.as_ref() {
                                "  (latest)"
                            } else {
                                ""
                            };
                            println!("{}  {}{}", v.version_id, v.storage_key, marker);
                        }
                    }
                }
            }

            pool.close().await;
        }

        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;

            let pipeline = Arc::new(Pipeline::from_config(&cfg, pool.clone())?);
            let snapshot_store = store::create_store(&cfg.store)?;
            let embedder = Arc::from(embedding::create_embedder(&cfg.embedding)?);
            let maintainer = Arc::new(Maintainer::new(pool.clone(), snapshot_store, embedder));

            // Fail fast on a bad model config before accepting traffic.
            let _ = model::create_model(&cfg.model)?;

            server::run_server(&cfg, pipeline, maintainer).await?;
        }
    }

    Ok(())
}
