//! In-memory index of live instances.
//!
//! The registry is a cache, not a database: the containers themselves are
//! the durable record via their `xw.*` labels, and [`InstanceRegistry::
//! reconcile`] rebuilds the cache from them at boot. All writes go through
//! one lock; readers get snapshots.

use crate::backend::{self, labels, ContainerBackend};
use crate::error::{Error, Result};
use crate::inventory::DeviceInventory;
use crate::ports::PortAllocator;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Lifecycle state of an instance. `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Unhealthy,
    Stopped,
    Error,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Error)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Created => "created",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one running backend. Data only: lifecycle operations live on
/// the scheduler and the container backend.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    /// System-assigned unique id, `<model>-<epoch-seconds>`.
    pub id: String,
    /// User-visible unique name; defaults to the model id.
    pub alias: String,
    pub model_id: String,
    pub engine: String,
    pub mode: String,
    pub devices: Vec<usize>,
    pub port: u16,
    pub tensor_parallel: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    pub container_id: String,
    pub image: String,
    pub state: InstanceState,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl Instance {
    /// The name clients address this instance by.
    pub fn display_alias(&self) -> &str {
        if self.alias.is_empty() {
            &self.model_id
        } else {
            &self.alias
        }
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
struct Inner {
    /// alias -> instance. The alias is the primary key; secondary lookups
    /// scan, which is fine at single-host instance counts.
    by_alias: HashMap<String, Instance>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    inner: RwLock<Inner>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new instance. A terminal record under the same alias is
    /// replaced; a live one is a conflict.
    pub async fn insert(&self, instance: Instance) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.by_alias.get(instance.display_alias()) {
            if !existing.state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "alias {} is already in use by instance {}",
                    instance.display_alias(),
                    existing.id
                )));
            }
        }
        inner
            .by_alias
            .insert(instance.display_alias().to_string(), instance);
        Ok(())
    }

    /// Transition an instance's state. The registry is the sole writer of
    /// state transitions; each one is logged.
    pub async fn set_state(&self, instance_id: &str, state: InstanceState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .by_alias
            .values_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| Error::NotFound(format!("instance {} not found", instance_id)))?;
        info!(
            instance = %instance_id,
            from = %instance.state,
            to = %state,
            "Instance state transition"
        );
        instance.state = state;
        if state == InstanceState::Running && instance.started_at.is_none() {
            instance.started_at = Some(epoch_secs());
        }
        Ok(())
    }

    pub async fn get(&self, alias: &str) -> Option<Instance> {
        let inner = self.inner.read().await;
        inner.by_alias.get(alias).cloned()
    }

    pub async fn by_instance_id(&self, instance_id: &str) -> Option<Instance> {
        let inner = self.inner.read().await;
        inner
            .by_alias
            .values()
            .find(|i| i.id == instance_id)
            .cloned()
    }

    /// The running instance serving `model_id`, if any.
    pub async fn running_by_model(&self, model_id: &str) -> Option<Instance> {
        let inner = self.inner.read().await;
        inner
            .by_alias
            .values()
            .find(|i| i.model_id == model_id && i.state == InstanceState::Running)
            .cloned()
    }

    pub async fn remove(&self, alias: &str) -> Option<Instance> {
        let mut inner = self.inner.write().await;
        inner.by_alias.remove(alias)
    }

    /// All instances, or only non-terminal ones when `all` is false.
    pub async fn snapshot(&self, all: bool) -> Vec<Instance> {
        let inner = self.inner.read().await;
        let mut list: Vec<Instance> = inner
            .by_alias
            .values()
            .filter(|i| all || i.state == InstanceState::Running)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Resolve a client-supplied model name to a running instance.
    ///
    /// Two passes, case-insensitive: exact match on the display alias, then
    /// prefix match either way (so `qwen2-7b` finds `qwen2-7b-instruct` and
    /// vice versa). First hit wins.
    pub async fn resolve_model(&self, model_name: &str) -> Option<Instance> {
        let wanted = model_name.to_lowercase();
        let inner = self.inner.read().await;

        let running = || {
            inner
                .by_alias
                .values()
                .filter(|i| i.state == InstanceState::Running)
        };

        for inst in running() {
            if inst.display_alias().to_lowercase() == wanted {
                return Some(inst.clone());
            }
        }
        for inst in running() {
            let alias = inst.display_alias().to_lowercase();
            if alias.starts_with(&wanted) || wanted.starts_with(&alias) {
                return Some(inst.clone());
            }
        }
        None
    }

    /// Rebuild the registry from containers carrying `xw.*` labels. Ports
    /// found on surviving containers are marked used so the allocator never
    /// hands them out again.
    pub async fn reconcile(
        &self,
        container_backend: &dyn ContainerBackend,
        ports: &PortAllocator,
        inventory: &DeviceInventory,
    ) -> Result<usize> {
        let containers = backend::list_instance_containers(container_backend).await?;
        let mut recovered = 0;

        let mut inner = self.inner.write().await;
        for view in containers {
            let instance_id = match view.label(labels::INSTANCE_ID) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let model_id = view.label(labels::MODEL_ID).unwrap_or_default().to_string();
            let alias = view
                .label(labels::ALIAS)
                .filter(|a| !a.is_empty())
                .unwrap_or(&model_id)
                .to_string();
            let port: u16 = view
                .label(labels::PORT)
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            let device_indices = view.device_indices();

            // A label pointing at a device we no longer know about means
            // the host changed under us; keep the instance but say so.
            for &idx in &device_indices {
                if inventory.by_index(idx).is_none() {
                    warn!(
                        instance = %instance_id,
                        device = idx,
                        "Reconciled container references unknown device index"
                    );
                }
            }

            let state = if view.running {
                InstanceState::Running
            } else {
                InstanceState::Stopped
            };

            if view.running {
                ports.mark_used(port);
            }

            let instance = Instance {
                id: instance_id.clone(),
                alias: alias.clone(),
                model_id,
                engine: view.label(labels::ENGINE).unwrap_or_default().to_string(),
                mode: view.label(labels::MODE).unwrap_or_default().to_string(),
                devices: device_indices,
                port,
                tensor_parallel: view
                    .device_indices()
                    .len()
                    .max(1),
                max_concurrent: view
                    .label(labels::MAX_CONCURRENT)
                    .and_then(|m| m.parse().ok()),
                container_id: view.id.clone(),
                image: view
                    .label(labels::IMAGE)
                    .unwrap_or(&view.image)
                    .to_string(),
                state,
                created_at: 0,
                started_at: None,
            };

            info!(
                instance = %instance_id,
                alias = %alias,
                state = %state,
                "Recovered instance from container labels"
            );
            inner.by_alias.insert(alias, instance);
            recovered += 1;
        }

        Ok(recovered)
    }
}
