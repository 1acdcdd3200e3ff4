use std::error::Error;
use std::sync::Arc;

use actors::SimilarityScorer;
use api::AppConfig;
use jobs_core::NoopMetrics;
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let storage = Storage::from_env().await?;
    tracing::info!(backend = storage.kind_str(), "Object storage ready");

    let runtime = api::start(
        &config,
        storage,
        Arc::new(SimilarityScorer),
        Arc::new(NoopMetrics),
    )
    .await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, runtime.router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped; draining workers");
    runtime.system.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
