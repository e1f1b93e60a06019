use anyhow::Context;
use furniture_visualizer::{config::Config, routes::{router, AppState}};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env().map_err(|e| {
        tracing::error!("❌ {}", e);
        e
    })?;
    tracing::info!("Using workflow token: {}", config.token_preview());
    tracing::info!("Uploading images to: {}", config.upload_api_url);

    let state = AppState::from_config(&config);
    let app = router(state, config.max_request_body);

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(addr = %config.bind_address, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("👋 Shutting down");
}
