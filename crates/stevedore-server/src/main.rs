#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::pool::manager::PoolManager;
use server::service::handler::router;
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let manager = Arc::new(PoolManager::open(&config)?);
    let app = router(Arc::clone(&manager)).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(manager, providers).await;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting job service on {} with full config: {:#?}",
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting job service on {} with {} workers",
            _config.server_addr,
            _config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}

/// Runs once the listener has stopped accepting requests.
async fn shutdown(manager: Arc<PoolManager>, providers: TelemetryProviders) {
    if let Err(_e) = manager.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during pool shutdown: {_e:?}");
    }

    providers.shutdown();
}
