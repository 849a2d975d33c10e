use clap::Parser;
use pawnstorm_core::engine::{SearchEngine, UciEngine};
use pawnstorm_worker::server::{
    config::{CliArgs, WorkerConfig},
    heartbeat::run_heartbeat,
    listener::{ServeExit, Worker},
    telemetry::init_telemetry,
};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let engine = UciEngine::spawn(config.engine.clone()).await?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let port = listener.local_addr()?.port();
    log_startup_info(&config, port, engine.name().unwrap_or("unnamed engine"));

    let shutdown = CancellationToken::new();
    let heartbeat = config.catalog.clone().map(|catalog| {
        tokio::spawn(run_heartbeat(
            catalog,
            config.name.clone(),
            port,
            shutdown.clone(),
        ))
    });

    let mut worker = Worker::new(engine, config.max_frame_bytes, shutdown.clone());
    let served = tokio::select! {
        served = worker.serve(&listener) => served,
        () = shutdown_signal() => {
            shutdown.cancel();
            Ok(ServeExit::Shutdown)
        }
    };
    shutdown.cancel();

    match &served {
        Ok(ServeExit::ExitRequested) => tracing::info!("Exiting at the orchestrator's request"),
        Ok(ServeExit::Shutdown) => tracing::info!("Shutting down"),
        Err(e) => tracing::error!("Server failed: {e}"),
    }

    if let Some(heartbeat) = heartbeat {
        match heartbeat.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Heartbeat ended with an error: {e}"),
            Err(e) => tracing::warn!("Heartbeat task panicked: {e}"),
        }
    }

    if let Err(e) = worker.into_engine().quit().await {
        tracing::warn!("Engine did not quit cleanly: {e}");
    }

    tracing::info!("Worker shut down successfully");
    providers.shutdown();
    served?;
    Ok(())
}

fn log_startup_info(config: &WorkerConfig, port: u16, engine: &str) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting worker {} on port {} ({}) with full config: {:#?}",
            config.name,
            port,
            engine,
            config
        );
    } else {
        tracing::info!(
            "Starting worker {} on port {} ({}), heartbeat {}",
            config.name,
            port,
            engine,
            if config.catalog.is_some() { "on" } else { "off" }
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
