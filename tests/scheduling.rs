//! Scheduler integration tests over the mock container backend.
//!
//! These exercise the allocation invariants end to end: device
//! disjointness, run idempotence, rollback on partial failure, stop
//! semantics, and crash-restart reconciliation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tower::ServiceExt;
use xw::backend::mock::MockBackend;
use xw::backend::{labels, ContainerBackend};
use xw::hooks::HookRunner;
use xw::inventory::{DeviceInventory, LogicalDevice};
use xw::scheduler::Progress;
use xw::{ChipCatalog, Config, Error, HealthMonitor, ModelCatalog, RunOptions, Scheduler};

fn chip_catalog() -> Arc<ChipCatalog> {
    Arc::new(
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
        topology:
          boxes:
            - devices: [0, 1]
            - devices: [2, 3]
        runtime_images:
          vllm:
            amd64: "quay.io/example/vllm-ascend:amd64"
            arm64: "quay.io/example/vllm-ascend:arm64"
        sandbox:
          visible_devices_env: ASCEND_VISIBLE_DEVICES
          device_path_template: "/dev/davinci{index}"
"#,
        )
        .unwrap(),
    )
}

fn model_catalog() -> Arc<ModelCatalog> {
    Arc::new(
        serde_yaml::from_str(
            r#"
models:
  - id: qwen2-7b
    source_id: Qwen/Qwen2-7B
    context_length: 32768
    supported_devices:
      ascend-910b:
        - backend: vllm
          mode: docker
  - id: qwen2-7b-b
    source_id: Qwen/Qwen2-7B-B
    supported_devices:
      ascend-910b:
        - backend: vllm
          mode: docker
  - id: llama3-8b
    source_id: Meta/Llama3-8B
    supported_devices:
      ascend-910b:
        - backend: vllm
          mode: docker
"#,
        )
        .unwrap(),
    )
}

fn inventory() -> Arc<DeviceInventory> {
    let devices = (0..4)
        .map(|index| LogicalDevice {
            index,
            config_key: "ascend-910b".into(),
            bus_address: format!("0000:0{}:00.0", index + 1),
            topology_box: Some(index / 2),
        })
        .collect();
    Arc::new(DeviceInventory::from_devices(devices))
}

/// Scheduler plus the temp data dir holding fake model files.
struct Harness {
    backend: Arc<MockBackend>,
    scheduler: Arc<Scheduler>,
    app: axum::Router,
    _data_dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::over_backend(Arc::new(MockBackend::new())).await
    }

    /// Build a daemon over an existing backend, as a restart would.
    async fn over_backend(backend: Arc<MockBackend>) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        for source in ["Qwen/Qwen2-7B", "Qwen/Qwen2-7B-B", "Meta/Llama3-8B"] {
            let dir = data_dir.path().join("models").join(source);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("config.json"), "{}").unwrap();
        }

        let config = Config {
            data_dir: data_dir.path().to_path_buf(),
            ..Config::default()
        };

        let (app, scheduler) = xw::build_app(
            &config,
            chip_catalog(),
            model_catalog(),
            inventory(),
            backend.clone(),
            Arc::new(HookRunner::noop()),
            HealthMonitor::assume_ready(),
        )
        .await
        .unwrap();

        Self {
            backend,
            scheduler,
            app,
            _data_dir: data_dir,
        }
    }

    async fn run(&self, model: &str, count: usize) -> Result<xw::Instance, Error> {
        self.scheduler
            .run(
                RunOptions {
                    model_id: model.to_string(),
                    device_count: Some(count),
                    ..Default::default()
                },
                Progress::none(),
            )
            .await
    }

    /// Union of device indices labeled on running containers.
    async fn labeled_devices(&self) -> HashSet<usize> {
        let filter = [(labels::INSTANCE_ID.to_string(), String::new())]
            .into_iter()
            .collect();
        let containers = self.backend.list(&filter).await.unwrap();
        containers
            .iter()
            .filter(|c| c.running)
            .flat_map(|c| c.device_indices())
            .collect()
    }
}

/// E1: two runs land on the two topology boxes with distinct ports.
#[tokio::test]
async fn test_two_instance_allocation() {
    let h = Harness::new().await;

    let a = h.run("qwen2-7b", 2).await.unwrap();
    let b = h.run("qwen2-7b-b", 2).await.unwrap();

    assert_eq!(a.devices, vec![0, 1]);
    assert_eq!(b.devices, vec![2, 3]);
    assert_ne!(a.port, b.port);
    for port in [a.port, b.port] {
        assert!((10881..=11881).contains(&port));
    }
    assert_eq!(a.state, xw::InstanceState::Running);
}

/// E2: a second run of the same model returns the same instance and
/// creates no new container.
#[tokio::test]
async fn test_run_idempotence() {
    let h = Harness::new().await;

    let first = h.run("qwen2-7b", 1).await.unwrap();
    let containers_before = h.backend.container_count();

    let second = h.run("qwen2-7b", 1).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.backend.container_count(), containers_before);
}

/// Invariant 1: running device sets are pairwise disjoint and match the
/// union of container labels.
#[tokio::test]
async fn test_device_disjointness() {
    let h = Harness::new().await;

    let a = h.run("qwen2-7b", 1).await.unwrap();
    let b = h.run("qwen2-7b-b", 2).await.unwrap();
    let c = h.run("llama3-8b", 1).await.unwrap();

    let mut seen = HashSet::new();
    for inst in [&a, &b, &c] {
        for &idx in &inst.devices {
            assert!(seen.insert(idx), "device {} allocated twice", idx);
        }
    }
    assert_eq!(seen, h.labeled_devices().await);
}

/// Invariant 5: a start failure leaks nothing — no container, no devices,
/// no port.
#[tokio::test]
async fn test_rollback_on_start_failure() {
    let h = Harness::new().await;

    h.backend.fail_next_start();
    let err = h.run("qwen2-7b", 2).await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));

    assert_eq!(h.backend.container_count(), 0);
    assert!(h.labeled_devices().await.is_empty());

    // All four devices and the lowest port are available again.
    let again = h.run("qwen2-7b", 4).await.unwrap();
    assert_eq!(again.devices, vec![0, 1, 2, 3]);
}

/// Resource exhaustion surfaces as such, and the failed run releases its
/// port lease.
#[tokio::test]
async fn test_exhaustion() {
    let h = Harness::new().await;

    h.run("qwen2-7b", 3).await.unwrap();
    let err = h.run("qwen2-7b-b", 2).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));

    let ok = h.run("llama3-8b", 1).await.unwrap();
    assert_eq!(ok.devices, vec![3]);
}

/// Stop removes the container (releasing devices via label disappearance),
/// releases the port, and keeps the record as stopped.
#[tokio::test]
async fn test_stop_releases_resources() {
    let h = Harness::new().await;

    let a = h.run("qwen2-7b", 4).await.unwrap();
    h.scheduler.stop("qwen2-7b", false).await.unwrap();

    assert_eq!(h.backend.container_count(), 0);
    assert!(h.labeled_devices().await.is_empty());

    let record = h.scheduler.list(true).await;
    assert_eq!(record.len(), 1);
    assert_eq!(record[0].state, xw::InstanceState::Stopped);
    assert!(h.scheduler.list(false).await.is_empty());

    // Devices and the port are reusable; the lowest port comes back.
    let b = h.run("qwen2-7b-b", 4).await.unwrap();
    assert_eq!(b.port, a.port);

    // Stopping a stopped instance is a no-op; unknown aliases are not.
    h.scheduler.stop("qwen2-7b", false).await.unwrap();
    assert!(matches!(
        h.scheduler.stop("ghost", false).await,
        Err(Error::NotFound(_))
    ));
}

/// Remove deletes the registry record entirely.
#[tokio::test]
async fn test_remove_deletes_record() {
    let h = Harness::new().await;

    h.run("qwen2-7b", 1).await.unwrap();
    h.scheduler.remove("qwen2-7b").await.unwrap();

    assert!(h.scheduler.list(true).await.is_empty());
    assert_eq!(h.backend.container_count(), 0);
}

/// Explicit device requests are validated against live allocations.
#[tokio::test]
async fn test_explicit_device_conflict() {
    let h = Harness::new().await;

    h.scheduler
        .run(
            RunOptions {
                model_id: "qwen2-7b".to_string(),
                devices: Some(vec![1, 2]),
                ..Default::default()
            },
            Progress::none(),
        )
        .await
        .unwrap();

    let err = h
        .scheduler
        .run(
            RunOptions {
                model_id: "qwen2-7b-b".to_string(),
                devices: Some(vec![2, 3]),
                ..Default::default()
            },
            Progress::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let err = h
        .scheduler
        .run(
            RunOptions {
                model_id: "qwen2-7b-b".to_string(),
                devices: Some(vec![7]),
                ..Default::default()
            },
            Progress::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

/// Invariant 5 of the data model: explicit tensor_parallel must match the
/// device count.
#[tokio::test]
async fn test_tensor_parallel_mismatch() {
    let h = Harness::new().await;

    let err = h
        .scheduler
        .run(
            RunOptions {
                model_id: "qwen2-7b".to_string(),
                device_count: Some(2),
                tensor_parallel: Some(4),
                ..Default::default()
            },
            Progress::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    // The failed run must not leak its devices.
    let ok = h.run("qwen2-7b", 4).await.unwrap();
    assert_eq!(ok.devices.len(), 4);
    assert_eq!(ok.tensor_parallel, 4);
}

#[tokio::test]
async fn test_unknown_model() {
    let h = Harness::new().await;
    assert!(matches!(
        h.run("no-such-model", 1).await,
        Err(Error::NotFound(_))
    ));
}

/// The container create-spec carries the full label set and canonical env.
#[tokio::test]
async fn test_container_labels_and_env() {
    let h = Harness::new().await;

    let inst = h
        .scheduler
        .run(
            RunOptions {
                model_id: "qwen2-7b".to_string(),
                device_count: Some(2),
                max_concurrent: Some(8),
                ..Default::default()
            },
            Progress::none(),
        )
        .await
        .unwrap();

    let view = h.backend.inspect(&inst.container_id).await.unwrap();
    assert_eq!(view.label(labels::INSTANCE_ID), Some(inst.id.as_str()));
    assert_eq!(view.label(labels::ALIAS), Some("qwen2-7b"));
    assert_eq!(view.label(labels::MODEL_ID), Some("qwen2-7b"));
    assert_eq!(view.label(labels::ENGINE), Some("vllm"));
    assert_eq!(view.label(labels::MODE), Some("docker"));
    assert_eq!(view.label(labels::PORT), Some(inst.port.to_string().as_str()));
    assert_eq!(view.label(labels::DEVICE_INDICES), Some("0,1"));
    assert_eq!(view.label(labels::MAX_CONCURRENT), Some("8"));
    assert!(view.label(labels::IMAGE).unwrap().contains("vllm-ascend"));
}

/// E6: after a daemon restart, a fresh registry is rebuilt from container
/// labels and allocation continues from the surviving set.
#[tokio::test]
async fn test_crash_recovery() {
    let backend = Arc::new(MockBackend::new());

    let (a, b) = {
        let h = Harness::over_backend(backend.clone()).await;
        let a = h.run("qwen2-7b", 1).await.unwrap();
        let b = h.run("qwen2-7b-b", 2).await.unwrap();
        (a, b)
        // Harness dropped here: the daemon "crashes", containers survive.
    };

    let h2 = Harness::over_backend(backend.clone()).await;
    let recovered = h2.scheduler.list(false).await;
    assert_eq!(recovered.len(), 2);

    let by_alias = |alias: &str| {
        recovered
            .iter()
            .find(|i| i.display_alias() == alias)
            .unwrap()
            .clone()
    };
    let ra = by_alias("qwen2-7b");
    assert_eq!(ra.id, a.id);
    assert_eq!(ra.port, a.port);
    assert_eq!(ra.devices, a.devices);
    let rb = by_alias("qwen2-7b-b");
    assert_eq!(rb.id, b.id);
    assert_eq!(rb.devices, b.devices);

    // A new run only sees the remaining free device.
    let c = h2.run("llama3-8b", 1).await.unwrap();
    assert_eq!(c.devices, vec![3]);
    assert_ne!(c.port, a.port);
    assert_ne!(c.port, b.port);

    // And a duplicate run of a recovered model is deduplicated.
    let again = h2.run("qwen2-7b", 1).await.unwrap();
    assert_eq!(again.id, a.id);
    assert_eq!(backend.container_count(), 3);
}

/// The management API drives the same lifecycle over HTTP: run streams
/// progress and a terminal result event, list reflects state, stop works.
#[tokio::test]
async fn test_management_api_lifecycle() {
    let h = Harness::new().await;

    let req = Request::builder()
        .method("GET")
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Run via SSE endpoint.
    let body = json!({
        "model_id": "qwen2-7b",
        "additional_config": {"device_count": 2},
    });
    let req = Request::builder()
        .method("POST")
        .uri("/api/instances/run")
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let raw = resp.into_body().collect().await.unwrap().to_bytes();
    let raw = String::from_utf8_lossy(&raw);
    assert!(raw.contains("allocating devices"));
    assert!(raw.contains("event: result"));

    // The result event carries {id, alias, state, port}.
    let result_data = raw
        .split("event: result\n")
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .and_then(|l| l.strip_prefix("data: "))
        .expect("result event payload");
    let result: Value = serde_json::from_str(result_data).unwrap();
    assert_eq!(result["alias"], "qwen2-7b");
    assert_eq!(result["state"], "running");
    assert!(result["port"].as_u64().unwrap() >= 10881);

    // List shows the running instance.
    let req = Request::builder()
        .method("GET")
        .uri("/api/instances")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    let list: Value =
        serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["devices"], json!([0, 1]));

    // Stop through the API; the non-all listing goes empty.
    let req = Request::builder()
        .method("POST")
        .uri("/api/instances/stop")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"alias": "qwen2-7b"}).to_string()))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.scheduler.list(false).await.is_empty());

    // Stopping an unknown alias reports the error envelope.
    let req = Request::builder()
        .method("POST")
        .uri("/api/instances/stop")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"alias": "ghost"}).to_string()))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: Value =
        serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(err["code"], "404");
}
