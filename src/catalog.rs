//! Chip and model catalogs.
//!
//! Two immutable lookup tables parsed once at startup from YAML:
//! `devices.yaml` describes chip families (PCI identifiers, per-chip
//! topology, engine container images, sandbox settings) and `models.yaml`
//! describes models and their supported `(device, engine)` combinations.
//! All lookups return `Option` or an explicit error; nothing here panics.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A group of logical chips with high-speed interconnect. Chips inside one
/// box are treated as distance zero by the device allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyBox {
    /// Logical chip indices in this box (not physical device indices).
    pub devices: Vec<usize>,
}

/// Declared physical topology for a chip family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub boxes: Vec<TopologyBox>,
}

/// Sandbox settings for a chip family, driving env/mount/privilege
/// synthesis without bespoke code per vendor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Env var carrying the comma-joined visible device list
    /// (e.g. `ASCEND_VISIBLE_DEVICES`).
    #[serde(default)]
    pub visible_devices_env: Option<String>,

    /// Per-device node path template; `{index}` is replaced by the logical
    /// chip index (e.g. `/dev/davinci{index}`).
    #[serde(default)]
    pub device_path_template: Option<String>,

    /// Device nodes mounted for every instance regardless of indices
    /// (e.g. `/dev/davinci_manager`).
    #[serde(default)]
    pub shared_device_paths: Vec<String>,

    /// Extra bind mounts, host path to container path. A `:ro` suffix on
    /// the host path marks the mount read-only.
    #[serde(default)]
    pub extra_mounts: HashMap<String, String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Container runtime name (e.g. `ascend`), empty for the default.
    #[serde(default)]
    pub runtime: Option<String>,

    /// Shared memory size in bytes.
    #[serde(default)]
    pub shm_size: Option<i64>,
}

/// Catalog entry for one chip model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipSpec {
    /// Unique key joining catalog, sandbox, and device records
    /// (e.g. `ascend-910b`).
    pub config_key: String,

    /// Human-readable chip name.
    pub model_name: String,

    /// PCIe device identifier as a hex string (e.g. `0xd802`).
    pub device_id: String,

    #[serde(default)]
    pub generation: Option<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// AI cores per physical PCI device; multi-chip cards expand into this
    /// many logical entries.
    #[serde(default = "default_chips_per_device")]
    pub chips_per_device: usize,

    #[serde(default)]
    pub topology: Option<TopologyConfig>,

    /// engine name -> host arch -> container image.
    #[serde(default)]
    pub runtime_images: HashMap<String, HashMap<String, String>>,

    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
}

fn default_chips_per_device() -> usize {
    1
}

impl ChipSpec {
    /// Topology box index for a logical chip index, if topology is declared.
    pub fn box_of(&self, chip_index: usize) -> Option<usize> {
        let topo = self.topology.as_ref()?;
        topo.boxes
            .iter()
            .position(|b| b.devices.contains(&chip_index))
    }
}

/// Catalog entry for one chip vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipVendor {
    pub vendor_name: String,

    /// PCIe vendor identifier as a hex string (e.g. `0x19e5`).
    pub vendor_id: String,

    pub chip_models: Vec<ChipSpec>,
}

/// Root of `devices.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipCatalog {
    pub version: String,
    pub vendors: Vec<ChipVendor>,
}

impl ChipCatalog {
    /// Load and validate the chip catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::PreconditionFailed(format!(
                "cannot read chip catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        let catalog: ChipCatalog = serde_yaml::from_str(&data)
            .map_err(|e| Error::PreconditionFailed(format!("invalid chip catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(Error::PreconditionFailed(
                "chip catalog version is required".into(),
            ));
        }
        if self.vendors.is_empty() {
            return Err(Error::PreconditionFailed(
                "chip catalog must define at least one vendor".into(),
            ));
        }

        let mut keys = HashSet::new();
        for vendor in &self.vendors {
            if vendor.vendor_name.is_empty() || vendor.vendor_id.is_empty() {
                return Err(Error::PreconditionFailed(
                    "vendor_name and vendor_id are required".into(),
                ));
            }
            if vendor.chip_models.is_empty() {
                return Err(Error::PreconditionFailed(format!(
                    "vendor {} defines no chip models",
                    vendor.vendor_name
                )));
            }
            for chip in &vendor.chip_models {
                if chip.config_key.is_empty() || chip.model_name.is_empty() {
                    return Err(Error::PreconditionFailed(
                        "config_key and model_name are required".into(),
                    ));
                }
                if chip.device_id.is_empty() {
                    return Err(Error::PreconditionFailed(format!(
                        "chip {}: device_id is required",
                        chip.config_key
                    )));
                }
                if !keys.insert(chip.config_key.clone()) {
                    return Err(Error::PreconditionFailed(format!(
                        "duplicate config_key: {}",
                        chip.config_key
                    )));
                }
                if chip.chips_per_device == 0 {
                    return Err(Error::PreconditionFailed(format!(
                        "chip {}: chips_per_device must be >= 1",
                        chip.config_key
                    )));
                }
                if chip.runtime_images.is_empty() {
                    return Err(Error::PreconditionFailed(format!(
                        "chip {}: at least one engine image is required",
                        chip.config_key
                    )));
                }
                if let Some(topo) = &chip.topology {
                    let mut seen = HashSet::new();
                    for b in &topo.boxes {
                        for &idx in &b.devices {
                            if !seen.insert(idx) {
                                return Err(Error::PreconditionFailed(format!(
                                    "chip {}: chip index {} appears in multiple topology boxes",
                                    chip.config_key, idx
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a chip by its config key.
    pub fn chip_by_key(&self, key: &str) -> Option<&ChipSpec> {
        self.vendors
            .iter()
            .flat_map(|v| v.chip_models.iter())
            .find(|c| c.config_key == key)
    }

    /// Find a chip by PCI `(vendor_id, device_id)`; returns the vendor too.
    pub fn chip_by_pci(&self, vendor_id: &str, device_id: &str) -> Option<(&ChipVendor, &ChipSpec)> {
        for vendor in &self.vendors {
            if !hex_eq(&vendor.vendor_id, vendor_id) {
                continue;
            }
            for chip in &vendor.chip_models {
                if hex_eq(&chip.device_id, device_id) {
                    return Some((vendor, chip));
                }
            }
        }
        None
    }

    /// Container image for `(chip, engine, arch)`.
    pub fn image_for(&self, chip_key: &str, engine: &str, arch: &str) -> Result<String> {
        let chip = self
            .chip_by_key(chip_key)
            .ok_or_else(|| Error::NotFound(format!("unknown chip: {}", chip_key)))?;
        let by_arch = chip.runtime_images.get(engine).ok_or_else(|| {
            Error::NotFound(format!("chip {} has no image for engine {}", chip_key, engine))
        })?;
        by_arch.get(arch).cloned().ok_or_else(|| {
            Error::NotFound(format!(
                "chip {} engine {} has no image for arch {}",
                chip_key, engine, arch
            ))
        })
    }

    pub fn all_chip_keys(&self) -> Vec<String> {
        self.vendors
            .iter()
            .flat_map(|v| v.chip_models.iter())
            .map(|c| c.config_key.clone())
            .collect()
    }
}

/// Compare hex identifiers tolerating an optional `0x` prefix and case.
fn hex_eq(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim_start_matches("0x").trim_start_matches("0X").to_lowercase();
    norm(a) == norm(b)
}

/// One `(backend, mode)` pair a model can run under, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOption {
    /// Inference engine (e.g. `vllm`, `mindie`).
    pub backend: String,
    /// Deployment mode (e.g. `docker`).
    pub mode: String,
}

impl std::fmt::Display for EngineOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.backend, self.mode)
    }
}

/// Catalog entry for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique model identifier (e.g. `qwen2-7b`).
    pub id: String,

    /// Model id on the source repository (e.g. `Qwen/Qwen2-7B`); determines
    /// the on-disk layout `<data_dir>/models/<owner>/<name>`.
    pub source_id: String,

    /// chip config_key -> ordered engine options.
    pub supported_devices: HashMap<String, Vec<EngineOption>>,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Parameter count in billions.
    #[serde(default)]
    pub parameters: Option<f64>,

    #[serde(default)]
    pub context_length: Option<u32>,
}

impl ModelSpec {
    pub fn supports_chip(&self, chip_key: &str) -> bool {
        self.supported_devices.contains_key(chip_key)
    }
}

/// Root of `models.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::PreconditionFailed(format!(
                "cannot read model catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        let catalog: ModelCatalog = serde_yaml::from_str(&data)
            .map_err(|e| Error::PreconditionFailed(format!("invalid model catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for model in &self.models {
            if model.id.is_empty() {
                return Err(Error::PreconditionFailed("model id cannot be empty".into()));
            }
            if !ids.insert(model.id.clone()) {
                return Err(Error::PreconditionFailed(format!(
                    "duplicate model id: {}",
                    model.id
                )));
            }
            if model.supported_devices.is_empty() {
                return Err(Error::PreconditionFailed(format!(
                    "model {} must support at least one device",
                    model.id
                )));
            }
            for (chip, engines) in &model.supported_devices {
                if engines.is_empty() {
                    return Err(Error::PreconditionFailed(format!(
                        "model {}: device {} must list at least one engine",
                        model.id, chip
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Ordered engine options for `(model, chip)`; empty when unsupported.
    pub fn engine_options(&self, model_id: &str, chip_key: &str) -> Vec<EngineOption> {
        self.model(model_id)
            .and_then(|m| m.supported_devices.get(chip_key))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chip_catalog() -> ChipCatalog {
        serde_yaml::from_str(
            r#"
version: "1"
vendors:
  - vendor_name: Huawei
    vendor_id: "0x19e5"
    chip_models:
      - config_key: ascend-910b
        model_name: Ascend 910B
        device_id: "0xd802"
        chips_per_device: 2
        topology:
          boxes:
            - devices: [0, 1]
            - devices: [2, 3]
        runtime_images:
          vllm:
            arm64: "quay.io/example/vllm-ascend:arm64"
            amd64: "quay.io/example/vllm-ascend:amd64"
        sandbox:
          visible_devices_env: ASCEND_VISIBLE_DEVICES
          device_path_template: "/dev/davinci{index}"
          shared_device_paths: ["/dev/davinci_manager"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_chip_lookup() {
        let cat = sample_chip_catalog();
        cat.validate().unwrap();

        assert!(cat.chip_by_key("ascend-910b").is_some());
        assert!(cat.chip_by_key("nope").is_none());

        let (vendor, chip) = cat.chip_by_pci("0x19e5", "0xd802").unwrap();
        assert_eq!(vendor.vendor_name, "Huawei");
        assert_eq!(chip.config_key, "ascend-910b");

        // Hex comparison tolerates missing 0x prefix and case.
        assert!(cat.chip_by_pci("19E5", "D802").is_some());
    }

    #[test]
    fn test_image_for() {
        let cat = sample_chip_catalog();
        let image = cat.image_for("ascend-910b", "vllm", "arm64").unwrap();
        assert!(image.contains("arm64"));

        assert!(matches!(
            cat.image_for("ascend-910b", "vllm", "riscv"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            cat.image_for("ascend-910b", "mindie", "arm64"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_topology_box_of() {
        let cat = sample_chip_catalog();
        let chip = cat.chip_by_key("ascend-910b").unwrap();
        assert_eq!(chip.box_of(0), Some(0));
        assert_eq!(chip.box_of(3), Some(1));
        assert_eq!(chip.box_of(9), None);
    }

    #[test]
    fn test_duplicate_config_key_rejected() {
        let mut cat = sample_chip_catalog();
        let dup = cat.vendors[0].chip_models[0].clone();
        cat.vendors[0].chip_models.push(dup);
        assert!(cat.validate().is_err());
    }

    #[test]
    fn test_model_catalog() {
        let cat: ModelCatalog = serde_yaml::from_str(
            r#"
models:
  - id: qwen2-7b
    source_id: Qwen/Qwen2-7B
    context_length: 32768
    supported_devices:
      ascend-910b:
        - backend: vllm
          mode: docker
        - backend: mindie
          mode: docker
"#,
        )
        .unwrap();
        cat.validate().unwrap();

        assert!(cat.model("qwen2-7b").is_some());
        assert!(cat.model("other").is_none());

        let opts = cat.engine_options("qwen2-7b", "ascend-910b");
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].backend, "vllm");

        assert!(cat.engine_options("qwen2-7b", "gpu-x").is_empty());
    }
}
