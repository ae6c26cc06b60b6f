//! Typed facade over the container runtime.
//!
//! The [`ContainerDriver`] trait is the only seam the controller talks
//! through; [`DockerDriver`] binds it to the local Docker daemon via bollard.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{DeviceRequest, HealthStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A container matched by name.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    /// Runtime state string, e.g. "running", "exited", "created".
    pub state: String,
}

/// Healthcheck verdict reported by the runtime. Absent when the container
/// declares no healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Snapshot of a container's observable state.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {
    /// Status string, e.g. "running".
    pub status: String,
    pub running: bool,
    pub health: Option<HealthState>,
    /// Declared bindings keyed by `"<containerPort>/<proto>"`, each mapping
    /// to the bound host ports.
    pub port_bindings: HashMap<String, Vec<String>>,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    /// containerPort -> (host IP, host port) bindings.
    pub port_bindings: HashMap<u16, (String, u16)>,
    /// Memory cap in MiB; zero means uncapped.
    pub memory_mi: i64,
    /// CPU cap in milli-cores; zero means uncapped.
    pub mcpu: i64,
    /// Request GPU devices for the container.
    pub gpu: bool,
    /// Opaque container-config overrides (Docker API field names),
    /// merged over the derived create document.
    pub config_overrides: serde_json::Map<String, serde_json::Value>,
    /// Opaque host-config overrides, merged into the `HostConfig` document.
    pub host_config_overrides: serde_json::Map<String, serde_json::Value>,
}

/// The runtime operations the controller depends on. One in-flight call per
/// service name is guaranteed by the caller, not by implementations.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Look up a container by exact name.
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<ContainerInfo>>;

    /// Pull an image, streaming progress to the log sink.
    async fn pull(&self, image: &str) -> anyhow::Result<()>;

    /// All locally present image tags.
    async fn list_images(&self) -> anyhow::Result<Vec<String>>;

    /// Create a container and return its id.
    async fn create(&self, name: &str, spec: CreateSpec) -> anyhow::Result<String>;

    async fn start(&self, id: &str) -> anyhow::Result<()>;

    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerStatus>;

    /// Stop the container and wait until it is no longer running, up to
    /// `timeout`.
    async fn stop_and_wait(&self, id: &str, timeout: Duration) -> anyhow::Result<()>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// Driver backed by the local Docker daemon.
pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority: explicit `docker_host`, then `DOCKER_HOST`,
    /// then the platform default socket.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let host = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok());

        let client = match host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                let socket = host.trim_start_matches("unix://");
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                    .with_context(|| format!("cannot connect to Docker socket '{}'", socket))?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                    .with_context(|| format!("cannot connect to Docker endpoint '{}'", host))?
            }
            Some(host) => {
                anyhow::bail!(
                    "invalid Docker host '{}': expected unix:///path or tcp://host:port",
                    host
                )
            }
            None => Docker::connect_with_local_defaults()
                .context("cannot connect to the local Docker daemon")?,
        };

        client
            .ping()
            .await
            .context("Docker daemon is not responding")?;
        debug!("Connected to Docker daemon");

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("/{}", name)]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;

        // The name filter matches substrings; require the exact name.
        for container in containers {
            let names = container.names.unwrap_or_default();
            if names.iter().any(|n| n == &format!("/{}", name)) {
                return Ok(Some(ContainerInfo {
                    id: container.id.unwrap_or_default(),
                    image: container.image.unwrap_or_default(),
                    state: container.state.unwrap_or_default(),
                }));
            }
        }
        Ok(None)
    }

    async fn pull(&self, image: &str) -> anyhow::Result<()> {
        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.with_context(|| format!("failed to pull image '{}'", image))?;
            if let Some(error) = progress.error {
                anyhow::bail!("failed to pull image '{}': {}", image, error);
            }
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await
            .context("failed to list images")?;

        Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
    }

    async fn create(&self, name: &str, spec: CreateSpec) -> anyhow::Result<String> {
        let config = build_create_document(&spec)?;

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| {
                format!("failed to create container '{}' from '{}'", name, spec.image)
            })?;

        info!(container = name, id = %response.id, image = %spec.image, "Created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {}", id))?;
        info!(id, "Started container");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerStatus> {
        let response = self
            .client
            .inspect_container(id, None)
            .await
            .with_context(|| format!("failed to inspect container {}", id))?;

        let mut status = ContainerStatus::default();
        if let Some(state) = response.state {
            status.status = state
                .status
                .map(|s| s.to_string())
                .unwrap_or_default();
            status.running = state.running.unwrap_or(false);
            status.health = state.health.and_then(|h| match h.status {
                Some(HealthStatusEnum::STARTING) => Some(HealthState::Starting),
                Some(HealthStatusEnum::HEALTHY) => Some(HealthState::Healthy),
                Some(HealthStatusEnum::UNHEALTHY) => Some(HealthState::Unhealthy),
                _ => None,
            });
        }

        if let Some(bindings) = response.host_config.and_then(|hc| hc.port_bindings) {
            for (port_key, binding) in bindings {
                let host_ports = binding
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| b.host_port)
                    .collect();
                status.port_bindings.insert(port_key, host_ports);
            }
        }

        Ok(status)
    }

    async fn stop_and_wait(&self, id: &str, timeout: Duration) -> anyhow::Result<()> {
        match self.client.stop_container(id, None).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(id, "Container was already stopped");
                return Ok(());
            }
            Err(e) => return Err(anyhow!("failed to stop container {}: {}", id, e)),
        }

        let mut wait = self.client.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(_))) | Ok(None) => {
                info!(id, "Stopped container");
                Ok(())
            }
            Ok(Some(Err(e))) => Err(anyhow!("error waiting for container {} to stop: {}", id, e)),
            Err(_) => Err(anyhow!(
                "container {} did not stop within {:?}",
                id,
                timeout
            )),
        }
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                debug!(id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(anyhow!("failed to remove container {}: {}", id, e)),
        }
    }
}

/// Derive the bollard create document from the spec, then merge the opaque
/// overrides on top. The overrides are cloned per call so concurrent
/// launches never observe a partially modified document.
fn build_create_document(spec: &CreateSpec) -> anyhow::Result<Config<String>> {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for (container_port, (host_ip, host_port)) in &spec.port_bindings {
        let port_key = format!("{}/tcp", container_port);
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(host_ip.clone()),
                host_port: Some(host_port.to_string()),
            }]),
        );
        exposed_ports.insert(port_key, HashMap::new());
    }

    let mut host_config = HostConfig {
        port_bindings: Some(port_bindings),
        ..Default::default()
    };
    if spec.memory_mi > 0 {
        host_config.memory = Some(spec.memory_mi * 1024 * 1024);
    }
    if spec.mcpu > 0 {
        // NanoCPUs are 1e9 per core; a milli-core is 1e6.
        host_config.nano_cpus = Some(spec.mcpu * 1_000_000);
    }
    if spec.gpu {
        host_config.device_requests = Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]);
    }

    let config = Config {
        image: Some(spec.image.clone()),
        cmd: spec.cmd.clone(),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    };

    if spec.config_overrides.is_empty() && spec.host_config_overrides.is_empty() {
        return Ok(config);
    }

    let mut document = serde_json::to_value(&config).context("failed to encode create spec")?;
    merge_json(
        &mut document,
        &serde_json::Value::Object(spec.config_overrides.clone()),
    );
    if !spec.host_config_overrides.is_empty() {
        let host_doc = document
            .as_object_mut()
            .expect("create document is an object")
            .entry("HostConfig")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        merge_json(
            host_doc,
            &serde_json::Value::Object(spec.host_config_overrides.clone()),
        );
    }

    serde_json::from_value(document).context("config overrides produced an invalid create spec")
}

/// Recursively merge `overlay` into `base`; objects merge key-by-key,
/// anything else is replaced by the overlay value.
fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
