//! gpsim Server
//!
//! GPS/motion hardware-in-the-loop simulator: REST API, WebSocket telemetry

use anyhow::{Context, Result};
use gpsim_server::{api, config::ServerConfig, state};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting gpsim server");

    let config = ServerConfig::from_env().context("reading GPSIM_* configuration")?;
    std::fs::create_dir_all(&config.session_root).with_context(|| {
        format!(
            "creating session root {}",
            config.session_root.display()
        )
    })?;
    info!(
        session_root = %config.session_root.display(),
        settings = %config.settings_path.display(),
        "Configuration loaded"
    );

    // Create application state
    let addr = config.bind;
    let state = state::AppState::from_config(config);

    // Build the router
    let app = api::create_router(state);

    // Start server
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
