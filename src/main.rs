use census_collector::adapters::{self, AdapterRegistry};
use census_collector::config::{Config, Credentials};
use census_collector::notify::LogNotifier;
use census_collector::scheduler::Scheduler;
use census_collector::store::TimescaleGateway;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(path = %cfg_path, "loaded config; devices: {}", cfg.devices.len());

    // Without credentials the collector keeps polling but persists nothing.
    let gateway = match Credentials::from_env() {
        Ok(credentials) => {
            info!(host = %credentials.host, port = credentials.port, database = %credentials.database, "time-series store configured");
            TimescaleGateway::new(&credentials)
        }
        Err(e) => {
            error!(error = %e, "time-series store credentials incomplete; samples will not be persisted");
            TimescaleGateway::unconfigured()
        }
    };
    let gateway = Arc::new(gateway);
    if !gateway.verify().await {
        warn!(
            "continuing with an unverified store; retrying every {}s",
            cfg.store.reverify_interval_secs
        );
    }

    let registry = Arc::new(AdapterRegistry::with_builtins(adapters::http_client()?));
    info!(device_types = ?registry.device_types(), "device adapters ready");

    let scheduler = Scheduler::new(cfg, registry, gateway.clone(), Arc::new(LogNotifier))
        .with_reverification(gateway);
    let mut tasks = scheduler.spawn();

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown requested"),
        Some(res) = tasks.join_next() => {
            if let Err(e) = res {
                error!(error = %e, "device task ended unexpectedly");
            }
        }
    }

    tasks.shutdown().await;
    info!("all device tasks stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
