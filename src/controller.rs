//! Per-service lifecycle control: ensure-running, connection refcounting,
//! cooldown arming, and stop.
//!
//! All per-service runtime state lives behind one reader/writer lock; every
//! driver interaction for a given service is additionally serialized by the
//! keyed mutex, so launches and stops of the same service are totally ordered
//! while distinct services proceed in parallel. Lock order is always
//! keyed mutex -> controller lock -> ledger lock.

use crate::config::{PullPolicy, Service, ServicesConfig};
use crate::docker::{ContainerDriver, ContainerStatus, CreateSpec, HealthState};
use crate::keyed_mutex::KeyedMutex;
use crate::ports;
use crate::resources::{ResourceLedger, Resources};
use anyhow::{anyhow, bail, Context};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Suffix appended to the service name to form the container name.
const CONTAINER_SUFFIX: &str = "-goscalezero";

/// Tuning knobs for driver waits. Defaults match production behavior; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Total time to wait for a started container to become ready.
    pub readiness_timeout: Duration,
    /// Interval between readiness inspections.
    pub readiness_poll_interval: Duration,
    /// Time to wait for a stopped container to leave the running state.
    pub stop_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(10),
            readiness_poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Mutable state for one service, keyed by service name. Created lazily on
/// first connection, never destroyed.
#[derive(Debug, Default)]
struct ServiceState {
    /// Live connections currently forwarding.
    conn_count: u32,
    /// Armed stop deadline; present iff the service is idle and eligible for
    /// a future stop.
    kill_time: Option<Instant>,
    /// containerPort -> dynamically allocated backend host port.
    host_ports: HashMap<u16, u16>,
    /// The triple currently counted against the ledger, if any. Stored at
    /// admission time so a stop releases exactly what was reserved.
    reserved: Option<Resources>,
}

/// Coordinates service lifecycles across connection tasks and the reaper.
pub struct ServiceController {
    services: HashMap<String, Service>,
    default_host_ip: String,
    state: RwLock<HashMap<String, ServiceState>>,
    api_lock: KeyedMutex,
    ledger: ResourceLedger,
    driver: Arc<dyn ContainerDriver>,
    options: ControllerOptions,
}

impl ServiceController {
    pub fn new(
        config: &ServicesConfig,
        driver: Arc<dyn ContainerDriver>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: config
                .services
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
            default_host_ip: config.service_host_ip.clone(),
            state: RwLock::new(HashMap::new()),
            api_lock: KeyedMutex::new(),
            ledger: ResourceLedger::new(config.resources.allocation_limits),
            driver,
            options,
        })
    }

    /// Called once per inbound connection, before any bytes are forwarded.
    /// Brings the container up if this is the first live connection, then
    /// counts the connection and disarms any pending stop deadline.
    pub async fn acquire(&self, name: &str) -> anyhow::Result<()> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| anyhow!("unknown service '{}'", name))?;

        let active = {
            let state = self.state.read();
            state.get(name).map(|s| s.conn_count > 0).unwrap_or(false)
        };
        if !active {
            self.ensure(service).await?;
        }

        let mut state = self.state.write();
        let entry = state.entry(name.to_string()).or_default();
        entry.conn_count += 1;
        entry.kill_time = None;
        Ok(())
    }

    /// Called exactly once when a connection ends. Arms the cooldown deadline
    /// on the 1 -> 0 transition.
    pub fn release(&self, name: &str) {
        let Some(service) = self.services.get(name) else {
            return;
        };
        let mut state = self.state.write();
        let Some(entry) = state.get_mut(name) else {
            return;
        };
        if entry.conn_count == 0 {
            warn!(service = name, "Release without matching acquire");
            return;
        }
        entry.conn_count -= 1;
        if entry.conn_count == 0 {
            entry.kill_time = Some(Instant::now() + Duration::from_secs(service.cooldown));
            debug!(
                service = name,
                cooldown_secs = service.cooldown,
                "Last connection closed, cooldown armed"
            );
        }
    }

    /// Backend dial target for a forwarding task, once the service has been
    /// launched at least once this run.
    pub fn backend_addr(&self, name: &str, container_port: u16) -> Option<(String, u16)> {
        let host_port = {
            let state = self.state.read();
            state
                .get(name)?
                .host_ports
                .get(&container_port)
                .copied()?
        };
        let service = self.services.get(name)?;
        Some((
            service.effective_host_ip(&self.default_host_ip).to_string(),
            host_port,
        ))
    }

    /// Total live connections across all services.
    pub fn total_connections(&self) -> u32 {
        self.state.read().values().map(|s| s.conn_count).sum()
    }

    /// Currently reserved total, for logging.
    pub fn tracked_resources(&self) -> Resources {
        self.ledger.tracked()
    }

    /// Services whose cooldown deadline has passed and which carry no live
    /// connections. Snapshot only; the caller stops them without any
    /// controller lock held.
    pub fn due_services(&self, now: Instant) -> Vec<String> {
        let state = self.state.read();
        state
            .iter()
            .filter(|(_, s)| s.conn_count == 0 && s.kill_time.is_some_and(|t| t <= now))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bring the service's container to running-and-ready. Idempotent: a
    /// second call while the container runs changes nothing past the first.
    async fn ensure(&self, service: &Service) -> anyhow::Result<()> {
        let _guard = self.api_lock.lock(&service.name).await;

        let container_name = format!("{}{}", service.name, CONTAINER_SUFFIX);
        let mut found = self.driver.find_by_name(&container_name).await?;

        // A leftover container built from a different image is stale.
        if let Some(existing) = &found {
            if existing.image != service.image {
                warn!(
                    service = service.name,
                    have = existing.image,
                    want = service.image,
                    "Existing container image does not match, removing"
                );
                self.driver.remove(&existing.id).await?;
                found = None;
            }
        }

        // Whichever path is taken below, the container that comes out of the
        // match is admitted but not yet running.
        let container_id = match found {
            Some(existing) => {
                let running = existing.state == "running";
                debug!(
                    service = service.name,
                    id = existing.id,
                    state = existing.state,
                    "Reusing existing container"
                );

                // A container adopted from a prior run carries its port
                // bindings; learn them before anything can dial.
                let port_map_empty = {
                    let state = self.state.read();
                    state
                        .get(&service.name)
                        .map(|s| s.host_ports.is_empty())
                        .unwrap_or(true)
                };
                if port_map_empty {
                    let status = self.driver.inspect(&existing.id).await?;
                    self.hydrate_port_map(&service.name, &status)?;
                }

                // Admission: the container counts against the budget whenever
                // it is left running under our accounting, including when it
                // was already running before we looked.
                self.reserve_if_needed(service)?;
                if running {
                    return Ok(());
                }
                existing.id
            }
            None => {
                // Admit before creating anything; a service the budget cannot
                // hold leaves no container behind.
                self.reserve_if_needed(service)?;
                self.prepare_image(service).await;
                match self.create_container(service, &container_name).await {
                    Ok(id) => id,
                    Err(e) => {
                        self.release_reservation(&service.name);
                        return Err(e);
                    }
                }
            }
        };

        if let Err(e) = self.driver.start(&container_id).await {
            self.release_reservation(&service.name);
            return Err(e).with_context(|| format!("failed to start '{}'", service.name));
        }

        if let Err(e) = self.wait_ready(service, &container_id).await {
            self.release_reservation(&service.name);
            return Err(e);
        }

        info!(service = service.name, id = container_id, "Service is up");
        Ok(())
    }

    /// Commit the service's request against the ledger unless a reservation
    /// is already held, recording the reserved triple for the eventual stop.
    fn reserve_if_needed(&self, service: &Service) -> anyhow::Result<()> {
        let already_reserved = {
            let state = self.state.read();
            state
                .get(&service.name)
                .map(|s| s.reserved.is_some())
                .unwrap_or(false)
        };
        if already_reserved {
            return Ok(());
        }
        self.ledger
            .try_reserve(service.resource_request)
            .map_err(|e| anyhow!("cannot launch '{}': {}", service.name, e))?;
        let mut state = self.state.write();
        state.entry(service.name.clone()).or_default().reserved = Some(service.resource_request);
        Ok(())
    }

    /// Execute the pull policy. Pull failures are logged, never fatal here;
    /// create fails on its own if the image is truly absent.
    async fn prepare_image(&self, service: &Service) {
        match service.pull_policy {
            PullPolicy::Always => {
                warn!(
                    service = service.name,
                    "Pull policy 'always' delays every cold start; consider 'ifnotpresent'"
                );
                if let Err(e) = self.driver.pull(&service.image).await {
                    warn!(service = service.name, error = %e, "Image pull failed, continuing with any existing image");
                }
            }
            PullPolicy::IfNotPresent => {
                match self.driver.list_images().await {
                    Ok(tags) if tags.iter().any(|t| t == &service.image) => {
                        debug!(service = service.name, image = service.image, "Image present, skipping pull");
                    }
                    Ok(_) => {
                        if let Err(e) = self.driver.pull(&service.image).await {
                            warn!(service = service.name, error = %e, "Image pull failed");
                        }
                    }
                    Err(e) => {
                        warn!(service = service.name, error = %e, "Image listing failed, skipping pull");
                    }
                }
            }
            PullPolicy::Never | PullPolicy::None => {}
        }
    }

    /// Allocate a backend host port per declared container port, record the
    /// mapping, and create the container with those bindings.
    async fn create_container(
        &self,
        service: &Service,
        container_name: &str,
    ) -> anyhow::Result<String> {
        let host_ip = service.effective_host_ip(&self.default_host_ip).to_string();

        let mut bindings = HashMap::new();
        {
            let mut state = self.state.write();
            let entry = state.entry(service.name.clone()).or_default();
            for mapping in &service.ports {
                let port = ports::find_open_port(&host_ip).with_context(|| {
                    format!("no backend port available for '{}'", service.name)
                })?;
                entry.host_ports.insert(mapping.container_port, port);
                bindings.insert(mapping.container_port, (host_ip.clone(), port));
                info!(
                    service = service.name,
                    container_port = mapping.container_port,
                    host_port = port,
                    host_ip,
                    "Allocated backend port"
                );
            }
        }

        let spec = CreateSpec {
            image: service.image.clone(),
            cmd: service.cmd.clone(),
            env: service.environment.clone(),
            port_bindings: bindings,
            memory_mi: service.resource_request.memory_mi,
            mcpu: service.resource_request.mcpu,
            gpu: service.resource_request.gpu_memory_mi > 0,
            config_overrides: service.config.clone(),
            host_config_overrides: service.host_config.clone(),
        };

        self.driver.create(container_name, spec).await
    }

    /// Populate the port map from a container's observed bindings, parsing
    /// the `"<port>/<proto>"` keys.
    fn hydrate_port_map(&self, name: &str, status: &ContainerStatus) -> anyhow::Result<()> {
        let mut parsed = HashMap::new();
        for (port_key, host_ports) in &status.port_bindings {
            let container_port = parse_port_key(port_key)
                .with_context(|| format!("unparseable port binding key '{}'", port_key))?;
            let Some(host_port) = host_ports.first() else {
                continue;
            };
            let host_port: u16 = host_port
                .parse()
                .with_context(|| format!("unparseable host port '{}'", host_port))?;
            parsed.insert(container_port, host_port);
        }

        let mut state = self.state.write();
        let entry = state.entry(name.to_string()).or_default();
        for (container_port, host_port) in parsed {
            entry.host_ports.insert(container_port, host_port);
        }
        Ok(())
    }

    /// Poll until the container is ready: running, and either free of any
    /// healthcheck or reporting healthy.
    async fn wait_ready(&self, service: &Service, container_id: &str) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.options.readiness_timeout;
        loop {
            let status = self.driver.inspect(container_id).await?;
            if status.status != "running" {
                bail!(
                    "container for '{}' left the running state during startup (state: {})",
                    service.name,
                    status.status
                );
            }
            match status.health {
                None if status.running => return Ok(()),
                Some(HealthState::Healthy) => return Ok(()),
                Some(HealthState::Unhealthy) | Some(HealthState::Starting) | None => {}
            }

            if Instant::now() >= deadline {
                bail!(
                    "container for '{}' did not become ready within {:?}",
                    service.name,
                    self.options.readiness_timeout
                );
            }
            tokio::time::sleep(self.options.readiness_poll_interval).await;
        }
    }

    /// Stop the service's container. Refuses while connections are live.
    /// The stop deadline is cleared regardless of the outcome so the reaper
    /// never spins on a persistent driver failure; the next acquire runs
    /// ensure again.
    pub async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let _guard = self.api_lock.lock(name).await;

        {
            let state = self.state.read();
            if state.get(name).map(|s| s.conn_count).unwrap_or(0) > 0 {
                bail!("service '{}' has active connections, not stopping", name);
            }
        }

        let result = self.stop_container(name).await;
        if result.is_ok() {
            self.release_reservation(name);
        }

        let mut state = self.state.write();
        if let Some(entry) = state.get_mut(name) {
            entry.kill_time = None;
        }
        result
    }

    async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
        let container_name = format!("{}{}", name, CONTAINER_SUFFIX);
        let found = self
            .driver
            .find_by_name(&container_name)
            .await?
            .ok_or_else(|| anyhow!("container '{}' does not exist", container_name))?;

        self.driver
            .stop_and_wait(&found.id, self.options.stop_timeout)
            .await?;
        info!(service = name, id = found.id, "Stopped idle container");
        Ok(())
    }

    fn release_reservation(&self, name: &str) {
        let reserved = {
            let mut state = self.state.write();
            state.get_mut(name).and_then(|s| s.reserved.take())
        };
        if let Some(reserved) = reserved {
            self.ledger.release(reserved);
        }
    }

    /// Shutdown path: stop every service currently holding a reservation.
    /// Services still carrying connections refuse and are left running.
    pub async fn stop_all(&self) {
        let reserved: Vec<String> = {
            let state = self.state.read();
            state
                .iter()
                .filter(|(_, s)| s.reserved.is_some())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in reserved {
            if let Err(e) = self.stop(&name).await {
                warn!(service = name, error = %e, "Failed to stop service during shutdown");
            }
        }
    }
}

/// Parse the container port out of a `"<port>/<proto>"` binding key.
fn parse_port_key(key: &str) -> anyhow::Result<u16> {
    let port = key.split('/').next().unwrap_or(key);
    Ok(port.parse()?)
}
