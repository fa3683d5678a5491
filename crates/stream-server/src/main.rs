//! FX rate streamer
//!
//! Main entry point: replay, aggregation and WebSocket push

use std::env;

use chrono::Utc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fx_stream_server::{load_settings, NotifyServer, NotifyServerConfig, StreamService};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = env::var("FX_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    init_logging();

    info!("Starting FX rate streamer v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings()?;
    info!(
        storage = %settings.storage_endpoint,
        feed = %settings.feed_endpoint,
        pace_ms = settings.replay_pace_ms,
        "Settings loaded"
    );

    let server_config = NotifyServerConfig::from_settings(&settings);
    let service = StreamService::new(settings)?;

    // Bind before replaying so early updates have somewhere to go
    let server = NotifyServer::new(server_config, service.publisher());
    let listener = server.bind().await?;

    service.start(Utc::now()).await?;
    info!("Background services started");

    let server_shutdown = service.shutdown_signal();
    let server_task = tokio::spawn(async move { server.serve(listener, server_shutdown).await });

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;

    service.stop().await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            return Err(e);
        }
        Err(e) => error!("Server task failed: {}", e),
    }

    let stats = service.stats();
    info!(
        processed = stats.aggregator.processed,
        accepted = stats.aggregator.accepted,
        delivered = stats.publisher.delivered,
        "Shutdown complete"
    );
    Ok(())
}
