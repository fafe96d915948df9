//! Instance scheduler.
//!
//! Owns the `Run` / `Stop` / `Remove` state machine. A `Run` composes the
//! catalogs, device and port allocators, sandbox registry, and container
//! backend into one pipeline; any failure after container creation rolls
//! the whole thing back so no devices, ports, or containers leak.

use crate::allocator::DeviceAllocator;
use crate::backend::{labels, BindMount, ContainerBackend, ContainerSpec, DeviceMapping};
use crate::catalog::{ChipCatalog, EngineOption, ModelCatalog};
use crate::error::{Error, Result};
use crate::hooks::HookRunner;
use crate::inventory::{DeviceInventory, LogicalDevice};
use crate::ports::PortAllocator;
use crate::registry::{epoch_secs, Instance, InstanceRegistry, InstanceState};
use crate::sandbox::SandboxRegistry;
use http_body_util::Empty;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Grace period passed to the engine when stopping a container.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Options accepted by [`Scheduler::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model_id: String,
    /// Requested engine (e.g. `vllm`); first catalog option when omitted.
    pub engine: Option<String>,
    /// Requested deployment mode (e.g. `docker`).
    pub mode: Option<String>,
    /// User-visible name; defaults to the model id.
    pub alias: Option<String>,
    /// Explicit device indices; mutually exclusive with `device_count`.
    pub devices: Option<Vec<usize>>,
    /// Number of devices to auto-allocate (default 1).
    pub device_count: Option<usize>,
    /// Requested port; leased from the range when omitted.
    pub port: Option<u16>,
    /// Must equal the device count when set; inferred otherwise.
    pub tensor_parallel: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub max_model_len: Option<u32>,
    /// Extra container environment; loses to canonical and device keys.
    pub env: HashMap<String, String>,
}

/// How `Run` decides an instance is serving.
#[derive(Debug, Clone)]
pub enum HealthMonitor {
    /// Poll `GET /health` on the instance port with exponential backoff
    /// until `deadline` elapses.
    Probe { deadline: Duration },
    /// Trust a successful container start. Used with the mock backend,
    /// where there is no process behind the port.
    AssumeReady,
}

impl HealthMonitor {
    pub fn probe(deadline: Duration) -> Self {
        HealthMonitor::Probe { deadline }
    }

    pub fn assume_ready() -> Self {
        HealthMonitor::AssumeReady
    }
}

/// Best-effort progress reporting for the run endpoint's SSE stream.
#[derive(Clone, Default)]
pub struct Progress(Option<mpsc::Sender<String>>);

impl Progress {
    pub fn channel(sender: mpsc::Sender<String>) -> Self {
        Progress(Some(sender))
    }

    pub fn none() -> Self {
        Progress(None)
    }

    async fn send(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(msg.into()).await;
        }
    }
}

pub struct Scheduler {
    chips: Arc<ChipCatalog>,
    models: Arc<ModelCatalog>,
    inventory: Arc<DeviceInventory>,
    allocator: DeviceAllocator,
    ports: Arc<PortAllocator>,
    sandboxes: SandboxRegistry,
    backend: Arc<dyn ContainerBackend>,
    hooks: Arc<HookRunner>,
    registry: Arc<InstanceRegistry>,
    health: HealthMonitor,
    /// Directory holding model files as `<owner>/<name>` per source id.
    models_dir: PathBuf,
    /// Optional suffix on container names.
    server_name: String,
    /// Deployment modes a runtime is registered for.
    registered_modes: HashSet<String>,
    /// Serializes the allocation-critical section: the backend query that
    /// computes the free device set and the create that publishes the new
    /// labels must not interleave across runs.
    op_lock: Mutex<()>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chips: Arc<ChipCatalog>,
        models: Arc<ModelCatalog>,
        inventory: Arc<DeviceInventory>,
        ports: Arc<PortAllocator>,
        backend: Arc<dyn ContainerBackend>,
        hooks: Arc<HookRunner>,
        registry: Arc<InstanceRegistry>,
        health: HealthMonitor,
        models_dir: PathBuf,
        server_name: String,
    ) -> Self {
        let allocator = DeviceAllocator::new(inventory.clone(), backend.clone());
        let sandboxes = SandboxRegistry::new(chips.clone());
        let mut registered_modes = HashSet::new();
        registered_modes.insert("docker".to_string());
        Self {
            chips,
            models,
            inventory,
            allocator,
            ports,
            sandboxes,
            backend,
            hooks,
            registry,
            health,
            models_dir,
            server_name,
            registered_modes,
            op_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Launch an instance of `model_id`, or return the one already running.
    pub async fn run(&self, opts: RunOptions, progress: Progress) -> Result<Instance> {
        let started = Instant::now();
        metrics::counter!("xw_instance_runs_total").increment(1);

        let result = self.run_inner(opts, progress).await;
        match &result {
            Ok(instance) => {
                metrics::histogram!("xw_instance_start_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    instance = %instance.id,
                    state = %instance.state,
                    port = instance.port,
                    "Run completed"
                );
            }
            Err(e) => {
                metrics::counter!("xw_instance_run_failures_total").increment(1);
                warn!(error = %e, "Run failed");
            }
        }
        result
    }

    async fn run_inner(&self, opts: RunOptions, progress: Progress) -> Result<Instance> {
        let model = self
            .models
            .model(&opts.model_id)
            .ok_or_else(|| Error::NotFound(format!("unknown model: {}", opts.model_id)))?
            .clone();

        let alias = opts
            .alias
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| model.id.clone());

        // Dedup: one running instance per model / alias.
        if let Some(existing) = self.registry.get(&alias).await {
            if existing.state == InstanceState::Running {
                if existing.model_id == model.id {
                    progress
                        .send(format!("instance {} already running", existing.id))
                        .await;
                    return Ok(existing);
                }
                return Err(Error::Conflict(format!(
                    "alias {} is already serving model {}",
                    alias, existing.model_id
                )));
            }
            if !existing.state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "alias {} is held by instance {} in state {}",
                    alias, existing.id, existing.state
                )));
            }
        }
        if let Some(existing) = self.registry.running_by_model(&model.id).await {
            progress
                .send(format!("model already running as {}", existing.id))
                .await;
            return Ok(existing);
        }

        if self.inventory.is_empty() {
            return Err(Error::PreconditionFailed(
                "no accelerators present in inventory".into(),
            ));
        }

        // Model files must already be on disk; downloading is a separate
        // concern.
        let model_path = self.models_dir.join(&model.source_id);
        if !model_path.is_dir() {
            return Err(Error::PreconditionFailed(format!(
                "model files not found at {}",
                model_path.display()
            )));
        }

        // Resolve the engine against the chip the instance will land on.
        let chip_key = self.target_chip_key(&opts, &model.id)?;
        let engine = self.resolve_engine(&opts, &model.id, &chip_key)?;
        progress
            .send(format!("engine {} selected on {}", engine, chip_key))
            .await;

        let sandbox = self.sandboxes.select(&chip_key)?;
        let image = sandbox.default_image(&self.chips, &engine.backend, host_arch())?;

        progress.send("checking container engine").await;
        self.hooks.ensure_docker().await?;
        progress.send(format!("ensuring image {}", image)).await;
        self.hooks.ensure_image(&image).await?;

        let instance_id = format!("{}-{}", model.id, epoch_secs());

        // Allocation-critical section: free-set computation, port lease, and
        // container creation publish atomically with respect to other runs.
        let _guard = self.op_lock.lock().await;

        progress.send("allocating devices").await;
        let devices = match &opts.devices {
            Some(indices) => self.allocator.claim(&instance_id, indices).await?,
            None => {
                let count = opts.device_count.unwrap_or(1);
                self.allocator.allocate(&instance_id, count).await?
            }
        };

        let tensor_parallel = match opts.tensor_parallel {
            Some(tp) if tp != devices.len() => {
                return Err(Error::Invalid(format!(
                    "tensor_parallel {} does not match device count {}",
                    tp,
                    devices.len()
                )));
            }
            Some(tp) => tp,
            None => devices.len(),
        };

        progress.send("leasing port").await;
        let port = match opts.port {
            Some(p) => {
                self.ports.lease_specific(p)?;
                p
            }
            None => self.ports.lease()?,
        };

        let spec = self.build_spec(
            &instance_id,
            &alias,
            &model.id,
            &model_path,
            &engine,
            &devices,
            port,
            tensor_parallel,
            &opts,
            &sandbox,
            &image,
            model.context_length,
        );

        progress.send("creating container").await;
        let container_id = match self.backend.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        let instance = Instance {
            id: instance_id.clone(),
            alias: alias.clone(),
            model_id: model.id.clone(),
            engine: engine.backend.clone(),
            mode: engine.mode.clone(),
            devices: devices.iter().map(|d| d.index).collect(),
            port,
            tensor_parallel,
            max_concurrent: opts.max_concurrent,
            container_id: container_id.clone(),
            image: image.clone(),
            state: InstanceState::Created,
            created_at: epoch_secs(),
            started_at: None,
        };
        if let Err(e) = self.registry.insert(instance.clone()).await {
            self.rollback(&container_id, port).await;
            return Err(e);
        }

        self.registry
            .set_state(&instance_id, InstanceState::Starting)
            .await?;
        progress.send("starting container").await;
        if let Err(e) = self.backend.start(&container_id).await {
            self.rollback(&container_id, port).await;
            let _ = self
                .registry
                .set_state(&instance_id, InstanceState::Error)
                .await;
            return Err(e);
        }

        drop(_guard);

        progress.send("waiting for backend health").await;
        match self.wait_healthy(port).await {
            Ok(()) => {
                self.registry
                    .set_state(&instance_id, InstanceState::Running)
                    .await?;
            }
            Err(e) => {
                // Keep the container for diagnosis; the caller decides
                // whether to remove it.
                warn!(instance = %instance_id, error = %e, "Health probe did not succeed");
                self.registry
                    .set_state(&instance_id, InstanceState::Unhealthy)
                    .await?;
            }
        }

        self.registry
            .by_instance_id(&instance_id)
            .await
            .ok_or_else(|| Error::Internal("instance vanished after start".into()))
    }

    /// Stop an instance: the container is stopped and removed (its labels,
    /// and with them the device allocation, disappear), the port is
    /// released, and the record is kept in `stopped` state.
    pub async fn stop(&self, alias: &str, force: bool) -> Result<()> {
        let instance = self
            .registry
            .get(alias)
            .await
            .ok_or_else(|| Error::NotFound(format!("unknown alias: {}", alias)))?;

        if instance.state.is_terminal() {
            return Ok(());
        }

        if !force {
            if let Err(e) = self.backend.stop(&instance.container_id, STOP_GRACE).await {
                warn!(instance = %instance.id, error = %e, "Graceful stop failed, forcing removal");
            }
        }
        self.backend.remove(&instance.container_id, true).await?;
        self.ports.release(instance.port);
        self.registry
            .set_state(&instance.id, InstanceState::Stopped)
            .await?;
        info!(instance = %instance.id, alias = %alias, "Instance stopped");
        Ok(())
    }

    /// Remove an instance entirely: stop if needed, delete the container,
    /// release the port, and drop the registry record.
    pub async fn remove(&self, alias: &str) -> Result<()> {
        let instance = self
            .registry
            .get(alias)
            .await
            .ok_or_else(|| Error::NotFound(format!("unknown alias: {}", alias)))?;

        if !instance.state.is_terminal() {
            if let Err(e) = self.backend.stop(&instance.container_id, STOP_GRACE).await {
                warn!(instance = %instance.id, error = %e, "Stop during remove failed");
            }
            self.ports.release(instance.port);
        }
        match self.backend.remove(&instance.container_id, true).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.registry.remove(alias).await;
        info!(instance = %instance.id, alias = %alias, "Instance removed");
        Ok(())
    }

    pub async fn list(&self, all: bool) -> Vec<Instance> {
        self.registry.snapshot(all).await
    }

    /// Tear down a half-started instance. Container removal drops the
    /// labels, which releases the devices; the port is released explicitly.
    async fn rollback(&self, container_id: &str, port: u16) {
        if let Err(e) = self.backend.stop(container_id, Duration::from_secs(1)).await {
            warn!(container = %container_id, error = %e, "Rollback stop failed");
        }
        if let Err(e) = self.backend.remove(container_id, true).await {
            warn!(container = %container_id, error = %e, "Rollback remove failed");
        }
        self.ports.release(port);
    }

    /// The chip family the instance will run on: the family of the first
    /// requested device, or the first family in the inventory the model
    /// supports.
    fn target_chip_key(&self, opts: &RunOptions, model_id: &str) -> Result<String> {
        if let Some(indices) = &opts.devices {
            let first = indices
                .first()
                .ok_or_else(|| Error::Invalid("device list cannot be empty".into()))?;
            return self
                .inventory
                .by_index(*first)
                .map(|d| d.config_key.clone())
                .ok_or_else(|| Error::NotFound(format!("device index {} out of range", first)));
        }

        let model = self
            .models
            .model(model_id)
            .ok_or_else(|| Error::NotFound(format!("unknown model: {}", model_id)))?;
        for dev in self.inventory.all() {
            if model.supports_chip(&dev.config_key) {
                return Ok(dev.config_key.clone());
            }
        }
        Err(Error::NotFound(format!(
            "model {} supports none of the present chip families",
            model_id
        )))
    }

    /// First engine option matching the requested engine/mode for which a
    /// runtime is registered.
    fn resolve_engine(
        &self,
        opts: &RunOptions,
        model_id: &str,
        chip_key: &str,
    ) -> Result<EngineOption> {
        let options = self.models.engine_options(model_id, chip_key);
        if options.is_empty() {
            return Err(Error::NotFound(format!(
                "model {} has no engines for chip {}",
                model_id, chip_key
            )));
        }

        options
            .into_iter()
            .find(|opt| {
                opts.engine
                    .as_ref()
                    .map(|e| e == &opt.backend)
                    .unwrap_or(true)
                    && opts.mode.as_ref().map(|m| m == &opt.mode).unwrap_or(true)
                    && self.registered_modes.contains(&opt.mode)
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no registered engine matches request for model {} on {}",
                    model_id, chip_key
                ))
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_spec(
        &self,
        instance_id: &str,
        alias: &str,
        model_id: &str,
        model_path: &std::path::Path,
        engine: &EngineOption,
        devices: &[LogicalDevice],
        port: u16,
        tensor_parallel: usize,
        opts: &RunOptions,
        sandbox: &crate::sandbox::Sandbox,
        image: &str,
        context_length: Option<u32>,
    ) -> ContainerSpec {
        // User env first, then sandbox env (sandbox wins only on its device
        // key), then the canonical keys, which are authoritative.
        let mut env = opts.env.clone();
        for (k, v) in sandbox.prepare_env(devices) {
            if k == sandbox.visible_devices_env() {
                env.insert(k, v);
            } else {
                env.entry(k).or_insert(v);
            }
        }
        env.insert("MODEL_PATH".into(), "/mnt/model".into());
        env.insert("MODEL_NAME".into(), alias.to_string());
        env.insert("TENSOR_PARALLEL_SIZE".into(), tensor_parallel.to_string());
        env.insert("SERVER_PORT".into(), port.to_string());
        let max_len = opts.max_model_len.or(context_length);
        if let Some(len) = max_len {
            env.insert("MAX_MODEL_LEN".into(), len.to_string());
        }

        let mut mounts = vec![BindMount {
            host_path: model_path.to_string_lossy().to_string(),
            container_path: "/mnt/model".into(),
            read_only: true,
        }];
        for (host, container) in sandbox.extra_mounts() {
            let (host, read_only) = match host.strip_suffix(":ro") {
                Some(stripped) => (stripped.to_string(), true),
                None => (host.clone(), false),
            };
            mounts.push(BindMount {
                host_path: host,
                container_path: container.clone(),
                read_only,
            });
        }

        let device_mappings = sandbox
            .device_mounts(devices)
            .into_iter()
            .map(|path| DeviceMapping {
                path_on_host: path.clone(),
                path_in_container: path,
            })
            .collect();

        let indices = devices
            .iter()
            .map(|d| d.index.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let shm_size = sandbox.shm_size();

        let mut label_map = HashMap::new();
        label_map.insert(labels::INSTANCE_ID.into(), instance_id.to_string());
        label_map.insert(labels::ALIAS.into(), alias.to_string());
        label_map.insert(labels::MODEL_ID.into(), model_id.to_string());
        label_map.insert(labels::ENGINE.into(), engine.backend.clone());
        label_map.insert(labels::MODE.into(), engine.mode.clone());
        label_map.insert(labels::PORT.into(), port.to_string());
        label_map.insert(labels::DEVICE_INDICES.into(), indices);
        if let Some(mc) = opts.max_concurrent {
            label_map.insert(labels::MAX_CONCURRENT.into(), mc.to_string());
        }
        label_map.insert(
            labels::SHM_SIZE.into(),
            shm_size.unwrap_or_default().to_string(),
        );
        label_map.insert(labels::IMAGE.into(), image.to_string());

        let name = if self.server_name.is_empty() {
            instance_id.to_string()
        } else {
            format!("{}-{}", instance_id, self.server_name)
        };

        ContainerSpec {
            name,
            image: image.to_string(),
            env,
            mounts,
            devices: device_mappings,
            labels: label_map,
            shm_size,
            privileged: sandbox.requires_privileged(),
            capabilities: sandbox.capabilities().to_vec(),
            runtime: sandbox.runtime_name().map(|s| s.to_string()),
            host_network: true,
            restart_unless_stopped: true,
        }
    }

    /// Poll the backend's health endpoint with exponential backoff until it
    /// answers or the deadline passes.
    async fn wait_healthy(&self, port: u16) -> Result<()> {
        let deadline = match self.health {
            HealthMonitor::AssumeReady => return Ok(()),
            HealthMonitor::Probe { deadline } => deadline,
        };

        let url: hyper::Uri = format!("http://127.0.0.1:{}/health", port)
            .parse()
            .map_err(|e| Error::Internal(format!("invalid health URL: {}", e)))?;

        let client: hyper_util::client::legacy::Client<_, Empty<bytes::Bytes>> =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build_http();

        let started = Instant::now();
        let mut backoff = Duration::from_millis(250);
        loop {
            if started.elapsed() > deadline {
                return Err(Error::Unhealthy(format!(
                    "backend on port {} did not become healthy within {:?}",
                    port, deadline
                )));
            }

            let request = hyper::Request::builder()
                .method("GET")
                .uri(url.clone())
                .body(Empty::new())
                .map_err(|e| Error::Internal(e.to_string()))?;

            match tokio::time::timeout(Duration::from_secs(5), client.request(request)).await {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(()),
                Ok(Ok(resp)) => {
                    tracing::debug!(port, status = %resp.status(), "Health probe not ready")
                }
                Ok(Err(e)) => tracing::debug!(port, error = %e, "Health probe failed"),
                Err(_) => tracing::debug!(port, "Health probe timed out"),
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }
}

/// Container image architecture for the current host.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
