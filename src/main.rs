//! # FAQ Harness CLI (`faq`)
//!
//! ## Usage
//!
//! ```bash
//! faq --config ./config/faq.toml --tenant acme <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `faq init` | Create the SQLite database and run schema migrations |
//! | `faq serve` | Start the HTTP API |
//! | `faq source add` | Store a source document from a file and index it |
//! | `faq index source` | Re-index one stored source |
//! | `faq index all` | Re-index every source and knowledge entry |
//! | `faq index refresh` | Re-index only if the index is marked dirty |
//! | `faq ask "<query>"` | Answer a query from the index |
//! | `faq mining status` | Whether mining may run today |
//! | `faq mining run` | Run today's mining |
//! | `faq mining today` | Show today's suggestions |
//! | `faq drafts list` | List drafts |
//! | `faq drafts publish <id>` | Publish a draft |
//! | `faq drafts discard <id>` | Discard a draft |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use faq_harness::config;
use faq_harness::mining::MiningOutcome;
use faq_harness::models::{Module, SourceDocument};
use faq_harness::pipeline::Pipeline;
use faq_harness::store::Store;
use faq_harness::{logging, migrate, server};

/// FAQ Harness: semantic search over tenant content, and daily mining of
/// unanswered questions into FAQ drafts.
#[derive(Parser)]
#[command(name = "faq", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/faq.toml")]
    config: PathBuf,

    /// Tenant to act for.
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Manage source documents.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Rebuild the search index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Answer a query from the index.
    Ask { query: String },

    /// Daily FAQ mining.
    Mining {
        #[command(subcommand)]
        action: MiningAction,
    },

    /// Review mined drafts.
    Drafts {
        #[command(subcommand)]
        action: DraftAction,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Store a document read from a file and index it.
    Add {
        /// One of: scripts, training, faq, kb.
        #[arg(long)]
        module: String,
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "")]
        title: String,
        /// File holding the document body.
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    Source {
        #[arg(long)]
        module: String,
        #[arg(long)]
        id: String,
    },
    All,
    Refresh,
}

#[derive(Subcommand)]
enum MiningAction {
    Status,
    Run {
        /// Recorded as the run's creator.
        #[arg(long, default_value = "cli")]
        user: String,
    },
    Today,
}

#[derive(Subcommand)]
enum DraftAction {
    List,
    Publish {
        id: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
    },
    Discard {
        id: String,
    },
}

fn parse_module(s: &str) -> anyhow::Result<Module> {
    Module::parse(s).ok_or_else(|| anyhow::anyhow!("unknown module: {}", s))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let tenant = cli.tenant.as_str();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Source {
            action:
                SourceAction::Add {
                    module,
                    id,
                    title,
                    file,
                },
        } => {
            let body = std::fs::read_to_string(&file)?;
            let doc = SourceDocument {
                tenant_id: tenant.to_string(),
                module: parse_module(&module)?,
                source_id: id,
                title,
                body,
            };
            let pipeline = Pipeline::open(&cfg).await?;
            let chunks = pipeline.indexer.add_source(&doc).await?;
            println!("indexed {}:{} ({} chunks)", doc.module, doc.source_id, chunks);
        }
        Commands::Index { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match action {
                IndexAction::Source { module, id } => {
                    let module = parse_module(&module)?;
                    let doc = pipeline
                        .store
                        .list_sources(tenant)
                        .await?
                        .into_iter()
                        .find(|s| s.module == module && s.source_id == id)
                        .ok_or_else(|| anyhow::anyhow!("source not found: {}:{}", module, id))?;
                    let chunks = pipeline
                        .indexer
                        .reindex_source(tenant, doc.module, &doc.source_id, &doc.title, &doc.body)
                        .await?;
                    println!("indexed {}:{} ({} chunks)", module, id, chunks);
                }
                IndexAction::All => {
                    let summary = pipeline.indexer.reindex_all(tenant).await?;
                    print_json(&summary)?;
                }
                IndexAction::Refresh => match pipeline.indexer.reindex_if_dirty(tenant).await? {
                    Some(summary) => print_json(&summary)?,
                    None => println!("index is clean"),
                },
            }
        }
        Commands::Ask { query } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let answer = pipeline.search.answer(tenant, &query).await?;
            match &answer.answer {
                Some(text) => println!("{}", text),
                None => println!("(no generated answer)"),
            }
            if let Some(err) = &answer.error {
                eprintln!("Warning: {}", err);
            }
            for (i, s) in answer.sources.iter().enumerate() {
                println!(
                    "  [{}] {:.3} {}:{} {}",
                    i + 1,
                    s.similarity,
                    s.module,
                    s.source_id,
                    s.title
                );
            }
        }
        Commands::Mining { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match action {
                MiningAction::Status => {
                    let status = pipeline.mining.can_run_today(tenant).await?;
                    print_json(&status)?;
                }
                MiningAction::Run { user } => {
                    match pipeline.mining.run_for_today(tenant, &user).await? {
                        MiningOutcome::Completed(report) => print_json(&report)?,
                        MiningOutcome::AlreadyRan {
                            next_eligible_at, ..
                        } => {
                            println!(
                                "Mining already ran today. Next run allowed at {}.",
                                next_eligible_at.to_rfc3339()
                            );
                        }
                    }
                }
                MiningAction::Today => match pipeline.mining.get_today_suggestions(tenant).await? {
                    Some(record) => print_json(&record)?,
                    None => println!("no suggestions for today"),
                },
            }
        }
        Commands::Drafts { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match action {
                DraftAction::List => {
                    let drafts = pipeline.drafts.list(tenant).await?;
                    for d in &drafts {
                        println!("{}  [{:>3}%]  {}", d.id, d.confidence, d.question);
                    }
                    println!("{} drafts", drafts.len());
                }
                DraftAction::Publish {
                    id,
                    question,
                    answer,
                } => {
                    let result = pipeline.drafts.publish(tenant, &id, &question, &answer).await?;
                    println!("published as {}", result.entry.id);
                    if !result.draft_removed {
                        eprintln!("Warning: draft row {} was not removed", id);
                    }
                }
                DraftAction::Discard { id } => {
                    let removed = pipeline.drafts.discard(tenant, &id).await?;
                    println!("{}", if removed { "discarded" } else { "already gone" });
                }
            }
        }
    }

    Ok(())
}
