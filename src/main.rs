//! Docker Log Forwarder Binary

use clap::Parser;
use docker_log_forwarder::{Config, LogForwarder, Result, ShutdownHandle};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    initialize_tracing(&config.log_level);

    info!("Starting Docker Log Forwarder v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Forwarder configuration - Service: {}, Engine: {}, Gateway: {}, Excluded: {:?}, Include stopped: {}",
        config.service_name,
        config.docker_host,
        config.gateway_url,
        config.excluded_names(),
        config.include_stopped
    );

    let forwarder = match LogForwarder::from_config(config) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            error!("Failed to initialize forwarder: {}", e);
            std::process::exit(1);
        }
    };

    tokio::spawn(watch_signals(forwarder.shutdown_handle()));

    if let Err(e) = forwarder.run().await {
        error!("Forwarder failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing(log_level: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

async fn watch_signals(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.shutdown("SIGINT");
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => handle.shutdown("SIGINT"),
            _ = terminate.recv() => handle.shutdown("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        handle.shutdown("SIGINT");
    }
}
