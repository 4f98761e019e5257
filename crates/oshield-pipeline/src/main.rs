//! OccultaShield pipeline server binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oshield_graph::GraphClient;
use oshield_pipeline::{recover_interrupted, PipelineConfig, PipelineOrchestrator, StorageLayout};
use oshield_progress::ProgressBroker;
use oshield_store::SurrealClient;
use oshield_witness::WitnessClient;

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS clients)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive("oshield=info".parse().unwrap()))
        .init();

    info!("Starting oshield-pipeline");

    // Load configuration
    let config_path =
        std::env::var("OSHIELD_CONFIG").unwrap_or_else(|_| "config/pipeline.yaml".to_string());
    let config = match PipelineConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Storage layout
    let storage = StorageLayout::new(&config.storage.root);
    if let Err(e) = storage.ensure_dirs() {
        error!("Failed to prepare storage directories: {}", e);
        std::process::exit(1);
    }

    // Persistence store (fatal when unreachable)
    let store = match SurrealClient::from_env().await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to connect to store: {}", e);
            std::process::exit(1);
        }
    };

    // Crash recovery: in-flight videos cannot be resumed mid-phase.
    match recover_interrupted(&store).await {
        Ok(swept) => info!(swept, "Recovery sweep finished"),
        Err(e) => error!("Recovery sweep failed: {}", e),
    }

    // Degradable collaborators
    let graph = match GraphClient::from_env() {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("Failed to create knowledge graph client: {}", e);
            std::process::exit(1);
        }
    };
    let witness = match WitnessClient::from_env() {
        Ok(w) => Arc::new(w),
        Err(e) => {
            error!("Failed to create vision client: {}", e);
            std::process::exit(1);
        }
    };

    let broker = Arc::new(ProgressBroker::new());
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store, broker, graph, witness, config,
    ));
    info!("Pipeline orchestrator ready");

    // The HTTP surface drives the orchestrator; this process runs until
    // asked to stop.
    let _orchestrator = orchestrator;
    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    info!("Pipeline shutdown complete");
}
