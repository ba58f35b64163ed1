/// procflow: BPMN process engine server
///
/// Main entry point. Initializes configuration and starts the HTTP server with
/// process deployment and execution capabilities.

use procflow::{config::Config, server::start_server};

/// Application entry point
///
/// Initializes the server with configuration from `PROCFLOW_*` variables and starts listening.
/// The server provides:
/// - Process management API at /api/process/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:8080 and data/procflow.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
