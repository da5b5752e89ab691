use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use task_lineage::api;
use task_lineage::config::Config;
use task_lineage::models::ExtractionRequest;
use task_lineage::services::{drain_outcomes, DispatchWorker, Dispatcher, ExtractorRegistry, LogLocator};
use task_lineage::storage::{LineageSink, MemorySink, SqliteLineageSink};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lineage extraction from workflow task logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the lineage HTTP API (default)
    Serve,
    /// Extract lineage for a file of requests, one JSON object per line
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// File of extraction requests in JSON lines format
    #[arg(long)]
    requests: PathBuf,
    /// Keep records in memory and print them instead of storing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Run(args) => run_batch(config, args).await,
    }
}

fn registry(config: &Config) -> Arc<ExtractorRegistry> {
    Arc::new(ExtractorRegistry::with_defaults(&config.lineage.target_platform))
}

async fn open_sink(config: &Config) -> anyhow::Result<SqliteLineageSink> {
    SqliteLineageSink::new(&config.database.url)
        .await
        .map_err(|e| {
            error!("Failed to initialize database: {}", e);
            e
        })
        .with_context(|| format!("opening lineage store {}", config.database.url))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting server on {}", config.server_address());

    let sink = open_sink(&config).await?;
    let registry = registry(&config);
    let worker = DispatchWorker::new(
        registry.clone(),
        Arc::new(LogLocator::with_sftp()),
        Arc::new(sink.clone()),
    );
    let (outcome_tx, outcome_rx) = mpsc::channel(config.lineage.queue_capacity.max(1));
    let outcomes = tokio::spawn(drain_outcomes(outcome_rx));
    let (handle, dispatcher) =
        Dispatcher::new(worker, config.lineage.workers, config.lineage.queue_capacity)
            .with_outcomes(outcome_tx)
            .start();

    // Create router with state
    let app: Router = api::routes::create_router_with_state(
        handle,
        registry,
        sink,
        config.lineage.default_properties(),
    );

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    // The router held the last dispatch handle
    dispatcher.await?;
    let tally = outcomes.await?;
    info!(
        "Served {} extractions ({} records), {} failed",
        tally.succeeded, tally.records, tally.failed
    );
    Ok(())
}

fn read_requests(path: &Path) -> anyhow::Result<Vec<ExtractionRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading requests from {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid extraction request", path.display(), index + 1))
        })
        .collect()
}

async fn run_batch(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let defaults = config.lineage.default_properties();
    let requests: Vec<ExtractionRequest> = read_requests(&args.requests)?
        .into_iter()
        .map(|request| request.with_defaults(&defaults))
        .collect();
    info!("Loaded {} extraction requests from {}", requests.len(), args.requests.display());

    let memory = MemorySink::new();
    let sink: Arc<dyn LineageSink> = if args.dry_run {
        Arc::new(memory.clone())
    } else {
        Arc::new(open_sink(&config).await?)
    };

    let worker = DispatchWorker::new(registry(&config), Arc::new(LogLocator::with_sftp()), sink);
    let (handle, dispatcher) =
        Dispatcher::new(worker, config.lineage.workers, config.lineage.queue_capacity).start();

    let acks = join_all(requests.into_iter().map(|request| {
        let handle = handle.clone();
        async move { handle.submit(request).await }
    }))
    .await;
    drop(handle);
    dispatcher.await?;

    let mut succeeded = 0;
    let mut records = 0;
    let mut failed = 0;
    for ack in acks {
        let outcome = ack?;
        if outcome.is_success() {
            succeeded += 1;
            records += outcome.record_count;
        } else {
            failed += 1;
        }
    }

    if args.dry_run {
        for record in memory.records() {
            println!("{}", serde_json::to_string(&record)?);
        }
    }

    info!(
        "Batch finished: {} succeeded ({} records), {} failed",
        succeeded, records, failed
    );
    Ok(())
}
