//! Filesender Server
//!
//! Accepts resumable uploads from authenticated callers and serves the
//! stored files back through capability URLs.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filesender::config::Config;
use filesender::identity::IdentityHasher;
use filesender::state::AppState;
use filesender::{auth, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "filesender=debug,filesender_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting Filesender Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("State directory: {}", config.storage.state_dir.display());
    tracing::info!("App root: {}", config.server.app_root);

    create_state_dir(&config).await?;

    let hasher = IdentityHasher::load_or_create(&config.storage.state_dir)
        .context("Failed to initialize identity key")?;

    let authenticator = auth::from_config(&config.auth);
    tracing::info!("Authentication method: {}", authenticator.name());

    let listen = config.server.listen;
    let app_state = AppState::new(config, hasher, authenticator);
    let app = routes::app(app_state);

    // Start server with graceful shutdown
    tracing::info!("Filesender Server listening on {}", listen);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn create_state_dir(config: &Config) -> anyhow::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);

    builder
        .create(&config.storage.state_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create state directory {}",
                config.storage.state_dir.display()
            )
        })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
