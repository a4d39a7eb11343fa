// ABOUTME: CLI entry point for billing-state
// ABOUTME: Operates dataset queues held in the local SQLite state cache

use anyhow::Context;
use billing_state::backend::SqliteCache;
use billing_state::model::{Customer, Plan, Product, Record, RecordKind, Subscription, Workspace};
use billing_state::{LeaseCoordinator, Queue, StateConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "billing-state")]
#[command(about = "Inspect and operate billing-state dataset queues", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file
    #[arg(long, env = "BILLING_STATE_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Path to the SQLite state cache (defaults to ~/.billing-state/cache.db)
    #[arg(long = "cache-db", env = "BILLING_STATE_CACHE", global = true)]
    cache_db: Option<PathBuf>,
    /// Project that owns the document database
    #[arg(long = "project-id", env = "PROJECT_ID", global = true)]
    project_id: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a record, given as JSON, to a dataset queue
    Enqueue {
        dataset: String,
        /// Record kind (subscription, customer, plan, product, workspace)
        #[arg(long)]
        kind: RecordKind,
        /// Canonical record JSON
        json: String,
    },
    /// Pop one record from a dataset queue and print it as JSON
    Dequeue {
        dataset: String,
        #[arg(long)]
        kind: RecordKind,
        /// How long to wait for the queue lease
        #[arg(long = "timeout-ms", default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Extend a dataset queue's time to live
    Refresh { dataset: String },
    /// Print the number of queued records
    Depth { dataset: String },
}

fn load_config(cli: &Cli) -> anyhow::Result<StateConfig> {
    let mut config = match &cli.config {
        Some(path) => StateConfig::load(path)?,
        None => StateConfig::default(),
    };
    if let Some(project_id) = &cli.project_id {
        config.project_id = project_id.clone();
    }
    if let Some(path) = &cli.cache_db {
        config.cache_path = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn enqueue_as<R: Record>(
    queue: &Queue,
    cancel: &CancellationToken,
    dataset: &str,
    json: &str,
) -> anyhow::Result<()> {
    let record: R = serde_json::from_str(json)
        .with_context(|| format!("Failed to parse {} JSON", R::KIND))?;
    let added = queue.enqueue(cancel, dataset, &record).await?;
    if added {
        println!("queued");
    } else {
        println!("already queued");
    }
    Ok(())
}

async fn dequeue_as<R: Record>(
    queue: &Queue,
    cancel: &CancellationToken,
    dataset: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let record: R = queue.dequeue(cancel, dataset, timeout).await?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let cache_path = config.resolve_cache_path()?;
    let cache = Arc::new(
        SqliteCache::open(&cache_path)
            .with_context(|| format!("Failed to open state cache {}", cache_path.display()))?,
    );
    let queue = Queue::new(LeaseCoordinator::new(cache.clone()), cache, &config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, canceling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Enqueue {
            dataset,
            kind,
            json,
        } => match kind {
            RecordKind::Subscription => {
                enqueue_as::<Subscription>(&queue, &cancel, &dataset, &json).await
            }
            RecordKind::Customer => enqueue_as::<Customer>(&queue, &cancel, &dataset, &json).await,
            RecordKind::Plan => enqueue_as::<Plan>(&queue, &cancel, &dataset, &json).await,
            RecordKind::Product => enqueue_as::<Product>(&queue, &cancel, &dataset, &json).await,
            RecordKind::Workspace => {
                enqueue_as::<Workspace>(&queue, &cancel, &dataset, &json).await
            }
        },
        Commands::Dequeue {
            dataset,
            kind,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            match kind {
                RecordKind::Subscription => {
                    dequeue_as::<Subscription>(&queue, &cancel, &dataset, timeout).await
                }
                RecordKind::Customer => {
                    dequeue_as::<Customer>(&queue, &cancel, &dataset, timeout).await
                }
                RecordKind::Plan => dequeue_as::<Plan>(&queue, &cancel, &dataset, timeout).await,
                RecordKind::Product => {
                    dequeue_as::<Product>(&queue, &cancel, &dataset, timeout).await
                }
                RecordKind::Workspace => {
                    dequeue_as::<Workspace>(&queue, &cancel, &dataset, timeout).await
                }
            }
        }
        Commands::Refresh { dataset } => {
            if queue.refresh_expire(&dataset).await? {
                println!("refreshed");
            } else {
                println!("no such queue");
            }
            Ok(())
        }
        Commands::Depth { dataset } => {
            println!("{}", queue.depth(&dataset).await?);
            Ok(())
        }
    }
}
