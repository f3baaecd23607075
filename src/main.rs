//! Beacon - incident lifecycle and live dispatch gateway

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon::{
    advisory::{AdvisoryBackend, DisabledAdvisory, LlmAdvisoryBackend},
    config::{Args, LogFormat, StoreBackend},
    server::{self, AppState},
    store::{DocumentStore, MemoryStore, MongoStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let log_level = args.log_level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("beacon={},info", log_level).into());
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Beacon - Incident Dispatch Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Store: {:?}", args.store);
    info!("Location window: {}s", args.location_window_secs);
    info!(
        "Advisory: {}",
        args.advisory_url.as_deref().unwrap_or("disabled")
    );
    info!("======================================");

    let store: Arc<dyn DocumentStore> = match args.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Mongo => match MongoStore::connect(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(store) => {
                info!("MongoDB connected successfully");
                Arc::new(store)
            }
            Err(e) if args.dev_mode => {
                warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                Arc::new(MemoryStore::new())
            }
            Err(e) => {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        },
    };

    let catalog = args.permission_catalog()?;
    info!("Permission catalog loaded with {} roles", catalog.role_count());

    let jwt = args.jwt_validator()?;

    let advisory: Arc<dyn AdvisoryBackend> = match &args.advisory_url {
        Some(url) => Arc::new(LlmAdvisoryBackend::new(
            url.clone(),
            args.advisory_model.clone(),
            args.advisory_api_key.clone(),
        )?),
        None => Arc::new(DisabledAdvisory),
    };

    let state = Arc::new(AppState::new(args, store, catalog, jwt, advisory));
    server::run(state).await?;

    Ok(())
}
