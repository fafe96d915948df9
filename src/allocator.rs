//! Exclusive accelerator allocation.
//!
//! There is no allocation state file: the live set of allocated device
//! indices is the union of `xw.device_indices` labels on running
//! containers. Every decision re-reads the container backend, so the view
//! survives daemon restarts for free.

use crate::backend::{self, ContainerBackend};
use crate::error::{Error, Result};
use crate::inventory::{DeviceInventory, LogicalDevice};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct DeviceAllocator {
    inventory: Arc<DeviceInventory>,
    backend: Arc<dyn ContainerBackend>,
}

impl DeviceAllocator {
    pub fn new(inventory: Arc<DeviceInventory>, backend: Arc<dyn ContainerBackend>) -> Self {
        Self { inventory, backend }
    }

    /// Indices currently owned by running containers.
    pub async fn allocated_indices(&self) -> Result<HashSet<usize>> {
        let containers = backend::list_instance_containers(self.backend.as_ref()).await?;
        let mut indices = HashSet::new();
        for c in containers.iter().filter(|c| c.running) {
            indices.extend(c.device_indices());
        }
        Ok(indices)
    }

    /// Pick `count` free devices for `instance_id`, minimizing the summed
    /// pairwise topology distance of the chosen set.
    pub async fn allocate(&self, instance_id: &str, count: usize) -> Result<Vec<LogicalDevice>> {
        if count == 0 {
            return Err(Error::Invalid("device count must be >= 1".into()));
        }
        if self.inventory.is_empty() {
            return Err(Error::PreconditionFailed(
                "no accelerators present in inventory".into(),
            ));
        }

        let taken = self.allocated_indices().await?;
        let free: Vec<&LogicalDevice> = self
            .inventory
            .all()
            .iter()
            .filter(|d| !taken.contains(&d.index))
            .collect();

        if count > free.len() {
            return Err(Error::ResourceExhausted(format!(
                "requested {} device(s), {} free",
                count,
                free.len()
            )));
        }

        let chosen = select_minimal_distance(&free, count);
        info!(
            instance = %instance_id,
            devices = ?chosen.iter().map(|d| d.index).collect::<Vec<_>>(),
            "Allocated devices"
        );
        Ok(chosen)
    }

    /// Validate and claim an explicit index list for `instance_id`.
    pub async fn claim(&self, instance_id: &str, indices: &[usize]) -> Result<Vec<LogicalDevice>> {
        if indices.is_empty() {
            return Err(Error::Invalid("device list cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for &idx in indices {
            if !seen.insert(idx) {
                return Err(Error::Invalid(format!("duplicate device index {}", idx)));
            }
        }

        let taken = self.allocated_indices().await?;
        let mut devices = Vec::with_capacity(indices.len());
        for &idx in indices {
            let dev = self.inventory.by_index(idx).ok_or_else(|| {
                Error::NotFound(format!(
                    "device index {} out of range (available: {})",
                    idx,
                    self.inventory.count()
                ))
            })?;
            if taken.contains(&idx) {
                return Err(Error::Conflict(format!(
                    "device {} is already allocated",
                    idx
                )));
            }
            devices.push(dev.clone());
        }

        info!(instance = %instance_id, devices = ?indices, "Claimed requested devices");
        Ok(devices)
    }

    /// Release the devices held by `instance_id` by stopping its container.
    /// The allocation disappears with the container's running state, so a
    /// second release is a no-op.
    pub async fn release(&self, instance_id: &str) -> Result<()> {
        let mut filter = std::collections::HashMap::new();
        filter.insert(
            backend::labels::INSTANCE_ID.to_string(),
            instance_id.to_string(),
        );
        let containers = self.backend.list(&filter).await?;
        for c in containers.iter().filter(|c| c.running) {
            debug!(instance = %instance_id, container = %c.id, "Stopping container to release devices");
            self.backend.stop(&c.id, Duration::from_secs(10)).await?;
        }
        Ok(())
    }
}

/// Distance between two logical devices: zero inside a topology box,
/// box-index distance across boxes, raw index distance when no topology is
/// declared.
fn distance(a: &LogicalDevice, b: &LogicalDevice) -> usize {
    match (a.topology_box, b.topology_box) {
        (Some(ba), Some(bb)) => ba.abs_diff(bb),
        _ => a.index.abs_diff(b.index),
    }
}

fn set_cost(devices: &[&LogicalDevice]) -> usize {
    let mut cost = 0;
    for i in 0..devices.len() {
        for j in (i + 1)..devices.len() {
            cost += distance(devices[i], devices[j]);
        }
    }
    cost
}

/// Exhaustively choose the `count`-subset of `free` with minimal summed
/// pairwise distance. `free` is already index-sorted, and combinations are
/// generated in lexicographic order, so the first minimum found is the
/// deterministic tie-break winner.
fn select_minimal_distance(free: &[&LogicalDevice], count: usize) -> Vec<LogicalDevice> {
    let n = free.len();
    let mut best_cost = usize::MAX;
    let mut best: Vec<usize> = Vec::new();

    // Positions into `free` for the current combination.
    let mut combo: Vec<usize> = (0..count).collect();
    loop {
        let subset: Vec<&LogicalDevice> = combo.iter().map(|&p| free[p]).collect();
        let cost = set_cost(&subset);
        if cost < best_cost {
            best_cost = cost;
            best = combo.clone();
        }
        if !next_combination(&mut combo, n) {
            break;
        }
    }

    best.iter().map(|&p| free[p].clone()).collect()
}

/// Advance `combo` to the next lexicographic k-combination of `0..n`.
/// Returns false when `combo` was the last one.
fn next_combination(combo: &mut [usize], n: usize) -> bool {
    let k = combo.len();
    for i in (0..k).rev() {
        if combo[i] < i + n - k {
            combo[i] += 1;
            for j in (i + 1)..k {
                combo[j] = combo[j - 1] + 1;
            }
            return true;
        }
    }
    false
}
