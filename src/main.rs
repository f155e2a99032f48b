//! # `pfind`
//!
//! Index a task's reference documents and find the passages most relevant
//! to a piece of text.
//!
//! ## Usage
//!
//! ```bash
//! pfind --config ./config/pfind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pfind index <task> [paths…]` | Index documents into a task (default: the task's bulk files) |
//! | `pfind query <task> "<text>"` | Print the top passages for the text |
//! | `pfind tasks` | List tasks with their files and status |
//! | `pfind serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! pfind index ml-notes ./papers/sgd.pdf ./papers/adam.pdf
//! pfind query ml-notes "gradient descent" --top-n 3
//! RUST_LOG=passage_finder=debug pfind serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use passage_finder::config::{self, Config};
use passage_finder::logging;
use passage_finder::models::RankedResult;
use passage_finder::retrieve::Retriever;
use passage_finder::server;
use passage_finder::tasks::{sanitize_task_name, TaskStatus, TaskStore};

/// Per-task document indexing and reranked passage retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Built-in defaults are used when the file does not exist.
#[derive(Parser)]
#[command(
    name = "pfind",
    about = "Per-task document indexing and reranked passage retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pfind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index documents into a task's vector index.
    ///
    /// Without paths, indexes every file in the task's `bulk/` directory.
    /// Documents that cannot be parsed are reported and skipped.
    Index {
        /// Task name.
        task: String,

        /// Documents to index (pdf, txt, md, docx, pptx).
        paths: Vec<PathBuf>,
    },

    /// Find the passages most relevant to a piece of text.
    Query {
        /// Task name.
        task: String,

        /// Query text.
        text: String,

        /// Number of passages to return.
        #[arg(long)]
        top_n: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List tasks.
    Tasks,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let cfg = config::load_or_minimal(&cli.config)?;
    let store = Arc::new(TaskStore::new(&cfg.tasks.root));

    match cli.command {
        Commands::Index { task, paths } => run_index(&cfg, store, &task, paths).await?,
        Commands::Query {
            task,
            text,
            top_n,
            json,
        } => {
            let top_n = top_n.unwrap_or(cfg.retrieval.default_top_n);
            let retriever = load_retriever(&cfg, store).await?;
            let results = retriever.query(&task, &text, top_n).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Tasks => {
            let tasks = store.list()?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  [{}]  bulk: {}  fresh: {}",
                    task.task_name,
                    task.status.as_str(),
                    task.bulk_files.len(),
                    task.fresh_files.len()
                );
            }
        }
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

async fn load_retriever(cfg: &Config, store: Arc<TaskStore>) -> anyhow::Result<Retriever> {
    let cfg = cfg.clone();
    Ok(tokio::task::spawn_blocking(move || Retriever::from_config(&cfg, store)).await?)
}

async fn run_index(
    cfg: &Config,
    store: Arc<TaskStore>,
    task: &str,
    paths: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let task = &sanitize_task_name(task)?;
    let paths = if paths.is_empty() {
        store.bulk_documents(task)?
    } else {
        paths
    };
    if paths.is_empty() {
        anyhow::bail!("no documents to index for task '{}'", task);
    }
    if !store.exists(task)? {
        store.create(task)?;
    }

    let retriever = load_retriever(cfg, store.clone()).await?;
    let outcome = retriever.index(task, &paths).await;
    let status = if outcome.is_ok() {
        TaskStatus::Ready
    } else {
        TaskStatus::Failed
    };
    store.set_status(task, status)?;
    let result = outcome?;

    println!("Indexed task '{}'", task);
    println!("  documents: {}", paths.len());
    println!("  chunks indexed: {}", result.chunks_indexed);
    println!("  documents failed: {}", result.documents_failed.len());
    for failure in &result.documents_failed {
        println!("    {}: {}", failure.filename, failure.reason);
    }
    Ok(())
}

fn print_results(results: &[RankedResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} (page {})",
            i + 1,
            result.score,
            result.document_name,
            result.page_number
        );
        println!("   {}", result.text);
    }
}
