use anyhow::Context;
use titulos_service::build_router;
use titulos_service::config::Config;
use titulos_service::storage::ArtifactStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter.clone()));
    if config.is_production() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    ArtifactStorage::new(config.storage_root.clone())
        .ensure_root()
        .await
        .context("failed to prepare artifact storage")?;

    let bind_addr = config.bind_addr;
    let app_env = config.app_env.clone();
    let app = build_router(config);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(
        target: "titulos",
        addr = %bind_addr,
        env = %app_env,
        version = env!("CARGO_PKG_VERSION"),
        "startup",
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!(target: "titulos", "shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "titulos", error = %error, "failed to listen for shutdown signal");
    }
}
