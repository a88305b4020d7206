//! Raspberry Pi sensor API.

use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sensorhub::{
    HttpServer, MetricsGateway, PublishScheduler, ReadingState, ServiceConfig, detect_backend,
};
use sensorhub_common::init_tracing;

/// Raspberry Pi sensor API.
#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(about = "Serve sensor readings and host metrics, publishing to ThingSpeak")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP port (overrides config and PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ServiceConfig::load_from_file(config_path)?
    } else {
        ServiceConfig::default()
    };
    config.apply_process_env()?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Raspberry Pi Sensor API");

    // Sensor selection happens once, here.
    let backend = detect_backend(&config.sensor);
    let state = ReadingState::new(backend).shared();
    info!(mock_mode = state.is_mock_mode(), "Sensor ready");

    let listen_addr = config.server.listen_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start publisher
    let publisher_task = if config.thingspeak.enabled() {
        let scheduler = PublishScheduler::from_config(state.clone(), &config.thingspeak)?;
        Some(tokio::spawn(scheduler.run(shutdown_rx.clone())))
    } else {
        warn!("THINGSPEAK_API_KEY not set, publishing disabled");
        None
    };

    // Start HTTP server
    let gateway = MetricsGateway::new(state, &config.system, &config.thingspeak);
    let http_server = HttpServer::new(gateway, listen_addr);
    let http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    let http_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            false
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
            false
        }
        _ = &mut http_task => {
            error!("HTTP server exited unexpectedly");
            true
        }
    };

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(task) = publisher_task {
            let _ = task.await;
        }
        if !http_exited {
            let _ = http_task.await;
        }
    })
    .await;

    info!("Sensor API stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
