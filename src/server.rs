/// Server setup and initialization
///
/// Wires together all components: storage, definition registry, execution
/// engine, diagram renderer and HTTP routes. Provides the main application
/// factory function for creating the Axum app.

use crate::{
    api::{create_process_routes, AppState},
    config::Config,
    diagram::SvgDiagramRenderer,
    process::registry::DefinitionRegistry,
    runtime::{delegate::DelegateRegistry, engine::ProcessEngine},
    storage::ProcessStorage,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
///
/// Opens the database, reloads deployed definitions and running instances and
/// builds the engine with the built-in approval delegates.
pub async fn create_app(config: Config) -> Result<Router> {
    create_app_with_delegates(config, DelegateRegistry::with_builtin()).await
}

/// Same as `create_app` with a caller-supplied delegate registry
pub async fn create_app_with_delegates(config: Config, delegates: DelegateRegistry) -> Result<Router> {
    if !config.database.is_in_memory() {
        tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
        std::fs::create_dir_all(&config.database.data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
    }

    tracing::info!("🗄️ Opening process database");
    let storage = ProcessStorage::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open process database: {}", e))?;

    tracing::info!("📊 Initializing definition registry");
    let definitions = Arc::new(DefinitionRegistry::new(storage.clone()));
    definitions
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load definitions from storage: {}", e))?;

    tracing::info!("🚀 Initializing process engine with delegates {:?}", delegates);
    let engine = Arc::new(ProcessEngine::new(
        definitions,
        delegates,
        storage,
        config.engine.clone(),
    ));
    engine
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to restore running instances: {}", e))?;

    let app_state = AppState {
        engine,
        renderer: Arc::new(SvgDiagramRenderer::new(config.diagram.font_family.clone())),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Process engine API routes
        .merge(create_process_routes().with_state(app_state));

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
///
/// Creates the application and starts the Axum server on the configured address and port.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting procflow server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
