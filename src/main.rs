use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use wildboar_pipeline::api::{api_routes, blob_routes};
use wildboar_pipeline::classify::HttpClassifier;
use wildboar_pipeline::config::{IngestConfig, ProcessingConfig, ServiceConfig, StorageConfig};
use wildboar_pipeline::ingest::IngestionOrchestrator;
use wildboar_pipeline::mailbox::{AttachmentExtractor, GmailConfig, GmailConnector};
use wildboar_pipeline::process::ProcessingOrchestrator;
use wildboar_pipeline::schedule::{self, Pipeline};
use wildboar_pipeline::store::{FilesystemBlobStore, LibSqlBackend};

const USAGE: &str = "usage: wildboar-pipeline <ingest|process|run|serve|schedule>";

#[tokio::main]
async fn main() -> ExitCode {
    let Some(command) = std::env::args().nth(1) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let service = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(&service);

    eprintln!("🐗 Wildboar pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {command}");

    let result = match command.as_str() {
        "ingest" => ingest().await,
        "process" => process().await,
        "run" => run().await,
        "serve" => serve(&service).await,
        "schedule" => scheduled(&service).await,
        other => {
            eprintln!("Unknown command '{other}'\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run failed");
            ExitCode::FAILURE
        }
    }
}

/// Stderr logging, plus a daily rolling file when a log directory is configured.
fn init_tracing(service: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &service.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wildboar-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Cancel the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current record");
            token.cancel();
        }
    });
    cancel
}

struct Stores {
    records: Arc<LibSqlBackend>,
    blobs: Arc<FilesystemBlobStore>,
}

async fn open_stores() -> anyhow::Result<Stores> {
    let config = StorageConfig::from_env()?;
    let records = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    if config.signing_key.is_none() {
        warn!("WILDBOAR_BLOB_SIGNING_KEY not set; signed image URLs are disabled");
    }
    Ok(Stores {
        records: Arc::new(records),
        blobs: Arc::new(FilesystemBlobStore::from_config(&config)),
    })
}

fn ingestion(stores: &Stores) -> anyhow::Result<IngestionOrchestrator<GmailConnector>> {
    let connector = GmailConnector::new(GmailConfig::from_env()?)?;
    Ok(IngestionOrchestrator::new(
        AttachmentExtractor::new(connector),
        stores.records.clone(),
        stores.blobs.clone(),
        IngestConfig::from_env()?,
    ))
}

fn processing(stores: &Stores) -> anyhow::Result<ProcessingOrchestrator> {
    let config = ProcessingConfig::from_env()?;
    let classifier = HttpClassifier::from_path(&config.model_path)?;
    Ok(ProcessingOrchestrator::new(
        stores.records.clone(),
        stores.blobs.clone(),
        Arc::new(classifier),
        &config,
    ))
}

async fn ingest() -> anyhow::Result<bool> {
    let stores = open_stores().await?;
    let report = ingestion(&stores)?.run_ingestion().await?;
    Ok(report.failed == 0)
}

async fn process() -> anyhow::Result<bool> {
    let stores = open_stores().await?;
    let orchestrator = processing(&stores)?;
    let stats = orchestrator.run_processing(&cancel_on_ctrl_c()).await?;
    Ok(!stats.has_failures())
}

async fn run() -> anyhow::Result<bool> {
    let stores = open_stores().await?;
    let pipeline = Pipeline::new(ingestion(&stores)?, processing(&stores)?);
    let report = pipeline.run_cycle(&cancel_on_ctrl_c()).await?;
    Ok(!report.has_failures())
}

async fn scheduled(service: &ServiceConfig) -> anyhow::Result<bool> {
    let schedule = schedule::parse_schedule(&service.schedule)?;
    let stores = open_stores().await?;
    let pipeline = Pipeline::new(ingestion(&stores)?, processing(&stores)?);

    info!(schedule = %service.schedule, "Scheduler started");
    schedule::schedule_pipeline(&pipeline, &schedule, &cancel_on_ctrl_c()).await;
    Ok(true)
}

async fn serve(service: &ServiceConfig) -> anyhow::Result<bool> {
    let stores = open_stores().await?;
    let app = api_routes(stores.records.clone(), stores.blobs.clone())
        .merge(blob_routes(stores.blobs.clone()));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", service.api_port))
        .await
        .with_context(|| format!("binding port {}", service.api_port))?;
    eprintln!("   Query API: http://0.0.0.0:{}/api", service.api_port);
    info!(port = service.api_port, "Query API started");

    let cancel = cancel_on_ctrl_c();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(true)
}
