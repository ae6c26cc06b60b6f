//! Configuration for the proxy and its services.
//!
//! A single document (TOML, or JSON when the path ends in `.json`) declares
//! the listen interface, the default backend interface, the global resource
//! allocation limits, and the services. Field names follow the runtime's
//! camelCase convention (`proxyIP`, `allocationLimits`, `containerPort`).

use crate::resources::Resources;
use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tracing::warn;

/// Image pull policy, parsed case-insensitively. Unknown values degrade to
/// `None` with a warning; `None` and `Never` both skip the pull, but `None`
/// is the not-configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    #[default]
    None,
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "" => PullPolicy::None,
            "always" => PullPolicy::Always,
            "ifnotpresent" | "if-not-present" => PullPolicy::IfNotPresent,
            "never" => PullPolicy::Never,
            other => {
                warn!(policy = other, "Unknown pull policy, treating as none");
                PullPolicy::None
            }
        }
    }
}

impl<'de> Deserialize<'de> for PullPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(PullPolicy::parse(&value))
    }
}

/// One container port and the proxy-side ports that map to it.
#[derive(Debug, Clone, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "containerPort")]
    pub container_port: u16,

    /// Externally visible ports the proxy listens on; all forward to
    /// `container_port`.
    #[serde(rename = "hostPorts")]
    pub host_ports: Vec<u16>,
}

/// A configured service: one container, one or more listener ports.
/// Immutable after load; `name` keys every per-service lock and map.
#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub name: String,

    pub image: String,

    #[serde(rename = "pullPolicy", default)]
    pub pull_policy: PullPolicy,

    /// Command override for the container, if any.
    #[serde(default)]
    pub cmd: Option<Vec<String>>,

    /// Environment entries in `KEY=value` form.
    #[serde(default)]
    pub environment: Vec<String>,

    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Overrides the default backend interface for this service.
    #[serde(rename = "hostIP", default)]
    pub host_ip: Option<String>,

    /// Seconds of idle time before the container is stopped. Zero stops the
    /// container on the reaper tick after the last connection closes.
    #[serde(default)]
    pub cooldown: u64,

    #[serde(rename = "resources", default)]
    pub resource_request: Resources,

    /// Opaque container-config overrides forwarded to the runtime
    /// (Docker API field names, e.g. `Labels`, `User`).
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Opaque host-config overrides forwarded to the runtime
    /// (e.g. `Privileged`, `Binds`).
    #[serde(rename = "hostConfig", default)]
    pub host_config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceLimits {
    #[serde(rename = "allocationLimits", default)]
    pub allocation_limits: Resources,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Interface the proxy listens on.
    #[serde(rename = "proxyIP", default = "default_proxy_ip")]
    pub proxy_ip: String,

    /// Default interface backend containers bind their allocated ports to.
    #[serde(rename = "serviceHostIP", default = "default_service_host_ip")]
    pub service_host_ip: String,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub services: Vec<Service>,
}

fn default_proxy_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_service_host_ip() -> String {
    "127.0.0.1".to_string()
}

impl Service {
    /// The interface this service's backend ports bind to.
    pub fn effective_host_ip<'a>(&'a self, default: &'a str) -> &'a str {
        match self.host_ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip,
            _ => default,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("service with empty name".to_string());
        }
        if self.image.is_empty() {
            return Err(format!("service '{}': 'image' is required", self.name));
        }
        let request = &self.resource_request;
        if request.mcpu < 0 || request.memory_mi < 0 || request.gpu_memory_mi < 0 {
            return Err(format!(
                "service '{}': resource requests must be non-negative",
                self.name
            ));
        }
        for mapping in &self.ports {
            if mapping.host_ports.is_empty() {
                return Err(format!(
                    "service '{}': container port {} declares no host ports",
                    self.name, mapping.container_port
                ));
            }
        }
        Ok(())
    }
}

impl ServicesConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: ServicesConfig = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("malformed JSON config {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("malformed TOML config {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document, collecting every error before failing.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let limits = self.resources.allocation_limits;
        if limits.mcpu < 0 || limits.memory_mi < 0 || limits.gpu_memory_mi < 0 {
            errors.push("allocationLimits must be non-negative".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }
            if !seen.insert(service.name.as_str()) {
                errors.push(format!("duplicate service name '{}'", service.name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
proxyIP = "0.0.0.0"
serviceHostIP = "127.0.0.1"

[resources.allocationLimits]
mcpu = 8000
memoryMi = 32768
gpuMemoryMi = 24576

[[services]]
name = "helloworld"
image = "nginxdemos/hello:latest"
pullPolicy = "IfNotPresent"
cooldown = 60

[[services.ports]]
containerPort = 80
hostPorts = [8080, 8081]

[services.resources]
mcpu = 500
memoryMi = 256
"#;
        let config: ServicesConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.proxy_ip, "0.0.0.0");
        assert_eq!(config.resources.allocation_limits.gpu_memory_mi, 24576);
        assert_eq!(config.services.len(), 1);

        let service = &config.services[0];
        assert_eq!(service.name, "helloworld");
        assert_eq!(service.pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(service.cooldown, 60);
        assert_eq!(service.ports[0].container_port, 80);
        assert_eq!(service.ports[0].host_ports, vec![8080, 8081]);
        assert_eq!(service.resource_request.mcpu, 500);
        assert_eq!(service.resource_request.gpu_memory_mi, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{
            "proxyIP": "127.0.0.1",
            "serviceHostIP": "127.0.0.1",
            "resources": {"allocationLimits": {"mcpu": 1000, "memoryMi": 1024, "gpuMemoryMi": 0}},
            "services": [{
                "name": "svc",
                "image": "busybox:latest",
                "cmd": ["sleep", "infinity"],
                "environment": ["MODE=prod"],
                "ports": [{"containerPort": 9000, "hostPorts": [9000]}],
                "cooldown": 30,
                "resources": {"mcpu": 100, "memoryMi": 64, "gpuMemoryMi": 0},
                "config": {"Labels": {"app": "svc"}},
                "hostConfig": {"Privileged": false}
            }]
        }"#;
        let config: ServicesConfig = serde_json::from_str(json).unwrap();
        let service = &config.services[0];
        assert_eq!(service.cmd.as_deref(), Some(["sleep", "infinity"].map(String::from).as_slice()));
        assert_eq!(service.environment, vec!["MODE=prod"]);
        assert!(service.config.contains_key("Labels"));
        assert!(service.host_config.contains_key("Privileged"));
        config.validate().unwrap();
    }

    #[test]
    fn test_pull_policy_case_insensitive() {
        assert_eq!(PullPolicy::parse("Always"), PullPolicy::Always);
        assert_eq!(PullPolicy::parse("IFNOTPRESENT"), PullPolicy::IfNotPresent);
        assert_eq!(PullPolicy::parse("if-not-present"), PullPolicy::IfNotPresent);
        assert_eq!(PullPolicy::parse("never"), PullPolicy::Never);
        assert_eq!(PullPolicy::parse(""), PullPolicy::None);
    }

    #[test]
    fn test_unknown_pull_policy_degrades_to_none() {
        assert_eq!(PullPolicy::parse("sometimes"), PullPolicy::None);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let toml = r#"
[[services]]
name = "a"
image = "img:1"

[[services]]
name = "a"
image = "img:2"
"#;
        let config: ServicesConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate service name 'a'"));
    }

    #[test]
    fn test_empty_host_ports_rejected() {
        let toml = r#"
[[services]]
name = "a"
image = "img:1"

[[services.ports]]
containerPort = 80
hostPorts = []
"#;
        let config: ServicesConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_host_ip() {
        let mut service: Service = toml::from_str(
            r#"
name = "a"
image = "img:1"
"#,
        )
        .unwrap();
        assert_eq!(service.effective_host_ip("127.0.0.1"), "127.0.0.1");

        service.host_ip = Some("192.168.1.10".to_string());
        assert_eq!(service.effective_host_ip("127.0.0.1"), "192.168.1.10");
    }
}
