//! # xw
//!
//! Daemon that turns a pool of AI accelerator devices on one host into a
//! multi-model inference service. Clients reference a model by name; the
//! daemon launches a sandboxed backend container pinned to specific
//! accelerators, tracks it across its lifetime, and routes per-request
//! traffic to it through OpenAI- and Anthropic-compatible endpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                           xw                             │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Request Router (axum)                              │  │
//! │  │ - resolves model → running instance                │  │
//! │  │ - per-instance concurrency gate                    │  │
//! │  │ - Anthropic ⇄ OpenAI translation                   │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                           │                              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Scheduler                                          │  │
//! │  │ - catalog lookup → device + port allocation        │  │
//! │  │ - sandbox env/mounts → container create/start      │  │
//! │  │ - health probe, rollback on partial failure        │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                           │                              │
//! │      ┌────────────────────┼────────────────────┐         │
//! │      ▼                    ▼                    ▼         │
//! │ [container:10881]   [container:10882]   [container:10883]│
//! │  labels xw.* = durable state, registry rebuilt at boot   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod control;
pub mod error;
pub mod hooks;
pub mod inventory;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod telemetry;
pub mod translate;

pub use catalog::{ChipCatalog, ModelCatalog};
pub use config::Config;
pub use error::{Error, Result};
pub use registry::{Instance, InstanceRegistry, InstanceState};
pub use scheduler::{HealthMonitor, Progress, RunOptions, Scheduler};

use axum::Router;
use backend::ContainerBackend;
use hooks::HookRunner;
use inventory::DeviceInventory;
use ports::PortAllocator;
use std::sync::Arc;
use tracing::info;

/// Build the daemon: reconcile surviving containers into the registry and
/// assemble the HTTP router.
///
/// Returns the axum router (proxy + management API) and the scheduler for
/// direct use.
pub async fn build_app(
    config: &Config,
    chips: Arc<ChipCatalog>,
    models: Arc<ModelCatalog>,
    inventory: Arc<DeviceInventory>,
    container_backend: Arc<dyn ContainerBackend>,
    hook_runner: Arc<HookRunner>,
    health: HealthMonitor,
) -> Result<(Router, Arc<Scheduler>)> {
    info!(
        chips = chips.all_chip_keys().len(),
        models = models.models.len(),
        devices = inventory.count(),
        "Building xw daemon"
    );

    let ports = Arc::new(PortAllocator::new(config.min_port, config.max_port));
    let registry = Arc::new(InstanceRegistry::new());

    let recovered = registry
        .reconcile(container_backend.as_ref(), &ports, &inventory)
        .await?;
    if recovered > 0 {
        info!(count = recovered, "Recovered instances from existing containers");
    }

    let scheduler = Arc::new(Scheduler::new(
        chips,
        models,
        inventory,
        ports,
        container_backend,
        hook_runner,
        registry.clone(),
        health,
        config.models_dir(),
        config.server_name.clone(),
    ));

    let app = proxy::router(proxy::ProxyState::new(registry))
        .merge(control::router(scheduler.clone()));

    Ok((app, scheduler))
}
