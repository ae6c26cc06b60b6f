use scalezero::config::ServicesConfig;
use scalezero::controller::{ControllerOptions, ServiceController};
use scalezero::docker::DockerDriver;
use scalezero::proxy::ProxyServer;
use scalezero::reaper;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Time allowed for live connections to finish after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalezero=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("services.toml"));

    let config = ServicesConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let driver = Arc::new(DockerDriver::new(None).await.map_err(|e| {
        error!(error = %e, "Cannot reach the container runtime");
        e
    })?);

    let controller = ServiceController::new(&config, driver, ControllerOptions::default());

    let proxy = ProxyServer::bind(&config, Arc::clone(&controller))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to bind listeners");
            e
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper_handle = tokio::spawn(reaper::run(Arc::clone(&controller), shutdown_rx.clone()));
    let accept_handles = proxy.spawn_accept_loops(shutdown_rx);

    wait_for_shutdown_signal().await;

    // Stop accepting, give live connections a bounded window, then stop
    // every container still counted against the budget.
    let _ = shutdown_tx.send(true);
    for handle in accept_handles {
        let _ = handle.await;
    }
    let _ = reaper_handle.await;

    let drain_start = Instant::now();
    while controller.total_connections() > 0 {
        if drain_start.elapsed() > DRAIN_TIMEOUT {
            warn!(
                remaining = controller.total_connections(),
                "Drain timeout exceeded, stopping services anyway"
            );
            break;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }

    info!("Stopping all services...");
    controller.stop_all().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &ServicesConfig) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting proxy"
    );
    let limits = config.resources.allocation_limits;
    info!(
        proxy_ip = %config.proxy_ip,
        service_host_ip = %config.service_host_ip,
        mcpu = limits.mcpu,
        memory_mi = limits.memory_mi,
        gpu_memory_mi = limits.gpu_memory_mi,
        "Allocation limits"
    );
    for service in &config.services {
        let host_ports: Vec<u16> = service
            .ports
            .iter()
            .flat_map(|p| p.host_ports.iter().copied())
            .collect();
        info!(
            service = service.name,
            image = service.image,
            cooldown_secs = service.cooldown,
            ports = ?host_ports,
            "Configured service"
        );
    }
}
