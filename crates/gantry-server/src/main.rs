use clap::Parser;
use gantry_core::pool::WorkerPool;
use gantry_server::{CliArgs, Gateway, ProcessPool, ServerConfig, server::telemetry::init_telemetry};
use std::sync::Arc;
use tokio::signal;

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

    let pool: Arc<dyn WorkerPool> = Arc::new(ProcessPool::new(config.pool.clone()));
    let gateway = Gateway::new(config, pool);
    gateway.add_listener(|event| {
        tracing::info!(
            kind = %event.kind,
            worker = ?event.worker_id,
            "Pool event: {}",
            event.detail
        );
    });

    let signals = tokio::spawn(shutdown_signal(gateway.clone()));
    let result = gateway.serve().await;
    signals.abort();

    providers.shutdown();
    result?;
    Ok(())
}

async fn shutdown_signal(gateway: Gateway) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    gateway.stop().await;
}
