//! Container engine facade.
//!
//! The scheduler talks to a [`ContainerBackend`] trait object rather than a
//! concrete engine. The production implementation drives the Docker CLI
//! ([`docker::DockerCli`]); tests use an in-memory table
//! ([`mock::MockBackend`]).
//!
//! Containers double as the daemon's durable state: every instance
//! container carries the `xw.*` labels below, and both the instance
//! registry and the device allocator reconstruct their view from them.

pub mod docker;
pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Label keys persisted on every instance container.
pub mod labels {
    pub const INSTANCE_ID: &str = "xw.instance_id";
    pub const ALIAS: &str = "xw.alias";
    pub const MODEL_ID: &str = "xw.model_id";
    pub const ENGINE: &str = "xw.engine";
    pub const MODE: &str = "xw.mode";
    pub const PORT: &str = "xw.port";
    pub const DEVICE_INDICES: &str = "xw.device_indices";
    pub const MAX_CONCURRENT: &str = "xw.max_concurrent";
    pub const SHM_SIZE: &str = "xw.shm_size";
    pub const IMAGE: &str = "xw.image";
}

/// A bind mount from host into the container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// A device node exposed to the container with `rwm` cgroup permissions.
#[derive(Debug, Clone)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
}

/// Everything needed to materialize an instance container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub devices: Vec<DeviceMapping>,
    pub labels: HashMap<String, String>,
    pub shm_size: Option<i64>,
    pub privileged: bool,
    pub capabilities: Vec<String>,
    /// Container runtime name (`--runtime`), empty for the engine default.
    pub runtime: Option<String>,
    /// Host networking; instance backends always use it.
    pub host_network: bool,
    /// `unless-stopped` restart policy when true.
    pub restart_unless_stopped: bool,
}

/// Observed state of a container as reported by the engine.
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerView {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|s| s.as_str())
    }

    /// Device indices parsed from the `xw.device_indices` label.
    pub fn device_indices(&self) -> Vec<usize> {
        self.label(labels::DEVICE_INDICES)
            .map(|s| {
                s.split(',')
                    .filter_map(|p| p.trim().parse::<usize>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Thin facade over a container engine. Implementations must be safe to
/// share across tasks.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create a container; returns the engine-assigned container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// List containers (including stopped ones) whose labels contain every
    /// `key=value` pair in `filter_labels`. A key mapped to an empty string
    /// matches any value.
    async fn list(&self, filter_labels: &HashMap<String, String>) -> Result<Vec<ContainerView>>;

    async fn inspect(&self, id: &str) -> Result<ContainerView>;

    /// Last `tail` log lines of a container.
    async fn logs(&self, id: &str, tail: usize) -> Result<String>;

    /// Run a command inside the container, returning combined output.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<String>;
}

/// List every container carrying an `xw.instance_id` label, running or not.
pub async fn list_instance_containers(
    backend: &dyn ContainerBackend,
) -> Result<Vec<ContainerView>> {
    let mut filter = HashMap::new();
    filter.insert(labels::INSTANCE_ID.to_string(), String::new());
    backend.list(&filter).await
}
