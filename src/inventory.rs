//! Accelerator inventory.
//!
//! Scans the host PCI bus once at startup, matches discovered devices
//! against the chip catalog, and expands multi-chip cards into logical
//! entries. The inventory is immutable for the life of the process;
//! hot-plug is not supported.

use crate::catalog::ChipCatalog;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, info};

/// One logical accelerator chip. Multi-chip cards contribute
/// `chips_per_device` entries sharing a bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalDevice {
    /// Stable index, assigned by enumerating physical devices in bus-address
    /// order and expanding each card.
    pub index: usize,

    /// Chip family key into the catalog.
    pub config_key: String,

    /// PCI bus address of the parent physical device.
    pub bus_address: String,

    /// Topology box this chip belongs to, when the chip family declares one.
    pub topology_box: Option<usize>,
}

/// Ordered, immutable list of logical chips discovered at startup.
#[derive(Debug, Clone)]
pub struct DeviceInventory {
    devices: Vec<LogicalDevice>,
}

impl DeviceInventory {
    /// Scan `/sys/bus/pci/devices` for accelerators known to the catalog.
    pub fn scan(catalog: &ChipCatalog) -> Result<Self> {
        Self::scan_sysfs(catalog, Path::new("/sys/bus/pci/devices"))
    }

    /// Scan a sysfs-style PCI tree rooted at `root`. Split out from
    /// [`DeviceInventory::scan`] so tests can point it at a fixture tree.
    pub fn scan_sysfs(catalog: &ChipCatalog, root: &Path) -> Result<Self> {
        let mut found: Vec<(String, String)> = Vec::new(); // (bus_address, config_key)

        let entries = std::fs::read_dir(root).map_err(|e| {
            Error::PreconditionFailed(format!("cannot scan {}: {}", root.display(), e))
        })?;

        for entry in entries.flatten() {
            let bus_address = entry.file_name().to_string_lossy().to_string();
            let vendor = read_id(&entry.path().join("vendor"));
            let device = read_id(&entry.path().join("device"));
            let (vendor, device) = match (vendor, device) {
                (Some(v), Some(d)) => (v, d),
                _ => continue,
            };

            if let Some((_, chip)) = catalog.chip_by_pci(&vendor, &device) {
                debug!(bus = %bus_address, chip = %chip.config_key, "Matched accelerator");
                found.push((bus_address, chip.config_key.clone()));
            }
        }

        // Canonical ordering: bus address, so indices are stable across runs.
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut devices = Vec::new();
        for (bus_address, config_key) in found {
            let chip = catalog
                .chip_by_key(&config_key)
                .ok_or_else(|| Error::Internal(format!("chip vanished: {}", config_key)))?;
            for _ in 0..chip.chips_per_device {
                let index = devices.len();
                devices.push(LogicalDevice {
                    index,
                    config_key: config_key.clone(),
                    bus_address: bus_address.clone(),
                    topology_box: chip.box_of(index),
                });
            }
        }

        info!(count = devices.len(), "Device inventory initialized");
        Ok(Self { devices })
    }

    /// Build an inventory from pre-enumerated devices. Used by tests and by
    /// deployments that inject a fixed device list.
    pub fn from_devices(devices: Vec<LogicalDevice>) -> Self {
        Self { devices }
    }

    pub fn all(&self) -> &[LogicalDevice] {
        &self.devices
    }

    pub fn by_index(&self, index: usize) -> Option<&LogicalDevice> {
        self.devices.get(index)
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Read a sysfs id file (`vendor` / `device`), returning the trimmed hex
/// string. Returns `None` when the file is missing or unreadable.
fn read_id(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChipCatalog, TopologyBox, TopologyConfig};

    fn catalog_with_topology() -> ChipCatalog {
        let mut cat: ChipCatalog = serde_yaml::from_str(
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
        runtime_images:
          vllm:
            arm64: "quay.io/example/vllm-ascend:arm64"
"#,
        )
        .unwrap();
        cat.vendors[0].chip_models[0].topology = Some(TopologyConfig {
            boxes: vec![
                TopologyBox { devices: vec![0, 1] },
                TopologyBox { devices: vec![2, 3] },
            ],
        });
        cat
    }

    fn write_pci_device(root: &Path, addr: &str, vendor: &str, device: &str) {
        let dir = root.join(addr);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        std::fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
    }

    #[test]
    fn test_scan_expands_multi_chip_cards() {
        let cat = catalog_with_topology();
        let tmp = tempfile::tempdir().unwrap();

        // Two dual-chip cards plus one unrelated device.
        write_pci_device(tmp.path(), "0000:01:00.0", "0x19e5", "0xd802");
        write_pci_device(tmp.path(), "0000:02:00.0", "0x19e5", "0xd802");
        write_pci_device(tmp.path(), "0000:03:00.0", "0x8086", "0x1234");

        let inv = DeviceInventory::scan_sysfs(&cat, tmp.path()).unwrap();
        assert_eq!(inv.count(), 4);

        // Indices are assigned in bus order, two chips per card.
        assert_eq!(inv.by_index(0).unwrap().bus_address, "0000:01:00.0");
        assert_eq!(inv.by_index(1).unwrap().bus_address, "0000:01:00.0");
        assert_eq!(inv.by_index(2).unwrap().bus_address, "0000:02:00.0");

        // Topology boxes follow the catalog declaration.
        assert_eq!(inv.by_index(0).unwrap().topology_box, Some(0));
        assert_eq!(inv.by_index(1).unwrap().topology_box, Some(0));
        assert_eq!(inv.by_index(2).unwrap().topology_box, Some(1));
        assert_eq!(inv.by_index(3).unwrap().topology_box, Some(1));
    }

    #[test]
    fn test_scan_ignores_unknown_devices() {
        let cat = catalog_with_topology();
        let tmp = tempfile::tempdir().unwrap();
        write_pci_device(tmp.path(), "0000:01:00.0", "0x8086", "0x1234");

        let inv = DeviceInventory::scan_sysfs(&cat, tmp.path()).unwrap();
        assert!(inv.is_empty());
    }

    #[test]
    fn test_from_devices() {
        let inv = DeviceInventory::from_devices(vec![LogicalDevice {
            index: 0,
            config_key: "ascend-910b".into(),
            bus_address: "0000:01:00.0".into(),
            topology_box: None,
        }]);
        assert_eq!(inv.count(), 1);
        assert!(inv.by_index(1).is_none());
    }
}
