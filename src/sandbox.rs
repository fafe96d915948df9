//! Per-chip-family container sandboxes.
//!
//! A sandbox turns a device set into the environment, device-node mounts,
//! library bind mounts, and privilege bits a backend container needs.
//! Everything is synthesized from the chip catalog's `sandbox` section, so
//! a newly registered chip family works without bespoke code.

use crate::catalog::{ChipCatalog, SandboxConfig};
use crate::error::{Error, Result};
use crate::inventory::LogicalDevice;
use std::collections::HashMap;
use std::sync::Arc;

/// Env var used when a chip family does not name its own visible-devices
/// variable.
const DEFAULT_VISIBLE_DEVICES_ENV: &str = "VISIBLE_DEVICES";

/// Config-driven sandbox for one chip family.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config_key: String,
    config: SandboxConfig,
}

impl Sandbox {
    /// Env var carrying the comma-joined device index list. The scheduler
    /// lets the sandbox win merge collisions on this key.
    pub fn visible_devices_env(&self) -> &str {
        self.config
            .visible_devices_env
            .as_deref()
            .unwrap_or(DEFAULT_VISIBLE_DEVICES_ENV)
    }

    /// Device-facing environment for a container running on `devices`.
    pub fn prepare_env(&self, devices: &[LogicalDevice]) -> HashMap<String, String> {
        let joined = devices
            .iter()
            .map(|d| d.index.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut env = HashMap::new();
        env.insert(self.visible_devices_env().to_string(), joined);
        env
    }

    /// Host device-node paths to expose for `devices`: one per index from
    /// the template, plus the family's shared nodes.
    pub fn device_mounts(&self, devices: &[LogicalDevice]) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(template) = &self.config.device_path_template {
            for d in devices {
                paths.push(template.replace("{index}", &d.index.to_string()));
            }
        }
        paths.extend(self.config.shared_device_paths.iter().cloned());
        paths
    }

    /// Driver and runtime library bind mounts, host path to container path.
    /// A `:ro` suffix on the host path marks the mount read-only.
    pub fn extra_mounts(&self) -> &HashMap<String, String> {
        &self.config.extra_mounts
    }

    pub fn default_image(
        &self,
        catalog: &ChipCatalog,
        engine: &str,
        arch: &str,
    ) -> Result<String> {
        catalog.image_for(&self.config_key, engine, arch)
    }

    pub fn requires_privileged(&self) -> bool {
        self.config.privileged
    }

    pub fn capabilities(&self) -> &[String] {
        &self.config.capabilities
    }

    pub fn runtime_name(&self) -> Option<&str> {
        self.config.runtime.as_deref().filter(|s| !s.is_empty())
    }

    pub fn shm_size(&self) -> Option<i64> {
        self.config.shm_size
    }
}

/// Yields a [`Sandbox`] for any chip key registered in the catalog.
pub struct SandboxRegistry {
    catalog: Arc<ChipCatalog>,
}

impl SandboxRegistry {
    pub fn new(catalog: Arc<ChipCatalog>) -> Self {
        Self { catalog }
    }

    /// Sandbox for a chip family. Chips without a `sandbox` catalog section
    /// get the config-driven defaults.
    pub fn select(&self, config_key: &str) -> Result<Sandbox> {
        let chip = self
            .catalog
            .chip_by_key(config_key)
            .ok_or_else(|| Error::NotFound(format!("unknown chip: {}", config_key)))?;
        Ok(Sandbox {
            config_key: config_key.to_string(),
            config: chip.sandbox.clone().unwrap_or_default(),
        })
    }
}
