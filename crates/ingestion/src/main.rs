//! ClinForge Ingestion Worker
//!
//! Consumes document processing jobs from SQS:
//! 1. Receives a `ProcessDocumentMessage`
//! 2. Downloads, converts and sections the file
//! 3. Classifies and embeds each section, then upserts it
//! 4. Re-enqueues failures until the retry budget is spent
//!
//! `ingestion-worker parse <file>` sections a local file and prints the result
//! without touching the database or the queue.

use clinforge_common::{
    config::{AppConfig, ObservabilityConfig},
    db::{schema, DbPool, Repository},
    embeddings::create_embedder,
    llm::create_llm_client,
    metrics,
    prompts::PromptStore,
    queue::{Queue, QueueSettings},
    VERSION,
};
use clinforge_ingestion::{ConverterRouter, DocumentProcessor, Sectionizer, Worker};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    init_tracing(&config.observability);

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 3 && args[1] == "parse" {
        return parse_local(&config, Path::new(&args[2])).await;
    }

    info!("Starting ClinForge ingestion worker v{}", VERSION);
    metrics::register_metrics();

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        schema::create_schema(db.write()).await?;
    }
    let repo = Repository::new(db);

    let embedder = create_embedder(&config.embedding)?;
    let llm = create_llm_client(&config.llm)?;
    let prompts = Arc::new(PromptStore::load(&config.prompts.path)?);
    let processor = DocumentProcessor::from_config(&config, repo, embedder, llm, prompts)?;

    let queue = Arc::new(Queue::new(QueueSettings::processing(&config.queue)?).await?);
    info!(queue_url = %queue.url(), "Polling processing queue");

    let worker = Worker::new(queue, processor, &config.worker, &config.processing);
    let handled = worker.run(shutdown_signal()).await;

    info!(handled, "Ingestion worker stopped");
    Ok(())
}

/// Section a local file and print the sections as JSON
async fn parse_local(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let sectionizer = Sectionizer::new(ConverterRouter::from_config(&config.conversion));
    let sections = sectionizer.parse(path).await?;
    println!("{}", serde_json::to_string_pretty(&sections)?);
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing current job..."),
        _ = terminate => info!("Received SIGTERM, finishing current job..."),
    }
}
