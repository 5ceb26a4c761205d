use std::path::PathBuf;
use std::time::Duration;
use svcgate::admin::{PKG_NAME, VERSION};
use svcgate::config::Config;
use svcgate::server::GatewayServer;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("svcgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // An explicit path must load; the default path is optional
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let path = PathBuf::from("svcgate.toml");
            if path.exists() {
                let config = Config::load(&path)?;
                info!(path = %path.display(), "Configuration loaded");
                config
            } else {
                info!("No configuration file, using built-in defaults");
                Config::default()
            }
        }
    };

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = config.server.shutdown_timeout();

    let server = GatewayServer::new(config);
    let mut server_handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        _ = wait_for_signal() => {}
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Gateway stopped"),
                Ok(Err(e)) => error!(error = %e, "Gateway failed"),
                Err(e) => error!(error = %e, "Gateway task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    // The server drains connections itself; allow it a little slack on top
    if tokio::time::timeout(drain + Duration::from_secs(1), server_handle)
        .await
        .is_err()
    {
        warn!("Gateway did not stop within the drain period");
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the gateway");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        registry_api_port = config.server.registry_api_port(),
        "Listeners"
    );
    info!(
        auth_mode = ?config.auth.mode,
        rate_limit = config.rate_limit.enabled,
        requests_per_minute = config.rate_limit.requests_per_minute,
        load_balancer = %config.server.load_balancer,
        "Policies"
    );
    info!(
        services = config.boot_services().len(),
        health_interval_secs = config.health.interval_secs,
        "Services"
    );
}
