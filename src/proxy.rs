//! TCP listeners and the per-connection forwarder.
//!
//! Every `(service, containerPort, hostPort)` declared in the configuration
//! gets its own listening socket and accept loop; dispatch is by listen port
//! only. Each accepted connection runs one forwarding task that acquires the
//! service, splices bytes both ways, and releases on every exit path.

use crate::config::ServicesConfig;
use crate::controller::ServiceController;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend connect timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One bound listener and the service binding it dispatches to.
struct Listener {
    socket: TcpListener,
    service: String,
    container_port: u16,
}

/// The proxy's public side: a fixed set of listeners bound at startup.
pub struct ProxyServer {
    listeners: Vec<Listener>,
    controller: Arc<ServiceController>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer").finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Bind every configured `proxyIP:hostPort`. Any bind failure is fatal.
    pub async fn bind(
        config: &ServicesConfig,
        controller: Arc<ServiceController>,
    ) -> anyhow::Result<Self> {
        let mut listeners = Vec::new();
        for service in &config.services {
            for mapping in &service.ports {
                for &host_port in &mapping.host_ports {
                    let addr = format!("{}:{}", config.proxy_ip, host_port);
                    let socket = TcpListener::bind(&addr).await.with_context(|| {
                        format!(
                            "failed to listen on {} for service '{}'",
                            addr, service.name
                        )
                    })?;
                    info!(
                        service = service.name,
                        addr,
                        container_port = mapping.container_port,
                        "Listening"
                    );
                    listeners.push(Listener {
                        socket,
                        service: service.name.clone(),
                        container_port: mapping.container_port,
                    });
                }
            }
        }
        Ok(Self {
            listeners,
            controller,
        })
    }

    /// Spawn one accept loop per listener. The loops stop accepting when the
    /// shutdown signal flips; connections already forwarding drain on their
    /// own.
    pub fn spawn_accept_loops(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let ProxyServer {
            listeners,
            controller,
        } = self;
        listeners
            .into_iter()
            .map(|listener| {
                let controller = Arc::clone(&controller);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(accept_loop(listener, controller, shutdown_rx))
            })
            .collect()
    }
}

async fn accept_loop(
    listener: Listener,
    controller: Arc<ServiceController>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.socket.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        debug!(
                            service = listener.service,
                            container_port = listener.container_port,
                            peer = %peer,
                            "Accepted connection"
                        );
                        let controller = Arc::clone(&controller);
                        let service = listener.service.clone();
                        let container_port = listener.container_port;
                        tokio::spawn(async move {
                            handle_connection(controller, service, container_port, client).await;
                        });
                    }
                    Err(e) => {
                        warn!(service = listener.service, error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(service = listener.service, "Listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Forward one client connection. Acquires the service before any dial and
/// releases it exactly once no matter which path exits; both sockets close
/// when this function returns.
pub async fn handle_connection(
    controller: Arc<ServiceController>,
    service: String,
    container_port: u16,
    client: TcpStream,
) {
    if let Err(e) = controller.acquire(&service).await {
        warn!(service, error = %e, "Failed to bring service up, dropping connection");
        return;
    }

    if let Err(e) = forward(&controller, &service, container_port, client).await {
        warn!(service, error = %e, "Connection ended with error");
    }

    controller.release(&service);
}

async fn forward(
    controller: &ServiceController,
    service: &str,
    container_port: u16,
    mut client: TcpStream,
) -> anyhow::Result<()> {
    let (host_ip, host_port) = controller
        .backend_addr(service, container_port)
        .with_context(|| format!("no backend port recorded for '{}':{}", service, container_port))?;

    let addr = format!("{}:{}", host_ip, host_port);
    let mut backend = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("timed out dialing backend {}", addr))?
        .with_context(|| format!("failed to dial backend {}", addr))?;

    let (to_backend, to_client) = tokio::io::copy_bidirectional(&mut client, &mut backend)
        .await
        .context("forwarding failed")?;
    debug!(
        service,
        container_port,
        bytes_in = to_backend,
        bytes_out = to_client,
        "Connection closed"
    );
    Ok(())
}
