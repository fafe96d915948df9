//! Docker CLI container backend.
//!
//! Drives the `docker` binary via subprocesses. Listing and inspection use
//! `--format '{{json .}}'` so output parsing stays on serde rather than
//! column splitting.

use super::{ContainerBackend, ContainerSpec, ContainerView};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct DockerCli {
    docker_bin: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::PreconditionFailed(format!("cannot run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            warn!(args = ?args, stderr = %stderr, "docker command failed");
            return Err(Error::Upstream(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    /// Comma-joined `key=value` pairs.
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_label_csv(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.to_string()))
        })
        .collect()
}

impl From<PsLine> for ContainerView {
    fn from(line: PsLine) -> Self {
        let running = line.state == "running";
        ContainerView {
            id: line.id,
            name: line.names,
            image: line.image,
            state: line.state,
            running,
            labels: parse_label_csv(&line.labels),
        }
    }
}

/// Subset of `docker inspect` output.
#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[async_trait]
impl ContainerBackend for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];

        if spec.host_network {
            args.push("--network".into());
            args.push("host".into());
        }
        if spec.restart_unless_stopped {
            args.push("--restart".into());
            args.push("unless-stopped".into());
        }
        if spec.privileged {
            args.push("--privileged".into());
        }
        for cap in &spec.capabilities {
            args.push("--cap-add".into());
            args.push(cap.clone());
        }
        if let Some(runtime) = &spec.runtime {
            if !runtime.is_empty() {
                args.push("--runtime".into());
                args.push(runtime.clone());
            }
        }
        if let Some(shm) = spec.shm_size {
            args.push("--shm-size".into());
            args.push(shm.to_string());
        }
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{}={}", k, v));
        }
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", k, v));
        }
        for m in &spec.mounts {
            let suffix = if m.read_only { ":ro" } else { "" };
            args.push("--volume".into());
            args.push(format!("{}:{}{}", m.host_path, m.container_path, suffix));
        }
        for d in &spec.devices {
            args.push("--device".into());
            args.push(format!("{}:{}:rwm", d.path_on_host, d.path_in_container));
        }

        args.push(spec.image.clone());

        let out = self.run(&args).await?;
        Ok(out.trim().to_string())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start".into(), id.into()]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        self.run(&[
            "stop".into(),
            "--time".into(),
            grace.as_secs().to_string(),
            id.into(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("--force".into());
        }
        args.push(id.into());
        self.run(&args).await?;
        Ok(())
    }

    async fn list(&self, filter_labels: &HashMap<String, String>) -> Result<Vec<ContainerView>> {
        let mut args: Vec<String> = vec![
            "ps".into(),
            "--all".into(),
            "--no-trunc".into(),
            "--format".into(),
            "{{json .}}".into(),
        ];
        for (k, v) in filter_labels {
            args.push("--filter".into());
            if v.is_empty() {
                args.push(format!("label={}", k));
            } else {
                args.push(format!("label={}={}", k, v));
            }
        }

        let out = self.run(&args).await?;
        let mut views = Vec::new();
        for line in out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<PsLine>(line) {
                Ok(ps) => views.push(ps.into()),
                Err(e) => warn!(error = %e, "Skipping unparseable docker ps line"),
            }
        }
        Ok(views)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerView> {
        let out = self
            .run(&["inspect".into(), "--format".into(), "{{json .}}".into(), id.into()])
            .await?;
        let entry: InspectEntry = serde_json::from_str(out.trim())
            .map_err(|e| Error::Upstream(format!("unparseable docker inspect output: {}", e)))?;
        Ok(ContainerView {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            image: entry.config.image,
            running: entry.state.running,
            state: entry.state.status,
            labels: entry.config.labels.unwrap_or_default(),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        self.run(&[
            "logs".into(),
            "--tail".into(),
            tail.to_string(),
            id.into(),
        ])
        .await
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<String> {
        let mut args: Vec<String> = vec!["exec".into(), id.into()];
        args.extend(argv.iter().cloned());
        self.run(&args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_csv() {
        let labels = parse_label_csv("xw.instance_id=qwen2-7b-1700000000,xw.port=10881");
        assert_eq!(labels.get("xw.instance_id").unwrap(), "qwen2-7b-1700000000");
        assert_eq!(labels.get("xw.port").unwrap(), "10881");
    }

    #[test]
    fn test_ps_line_parsing() {
        let line = r#"{"ID":"abc123","Names":"qwen2-7b-1700000000","Image":"quay.io/x:y","State":"running","Labels":"xw.instance_id=qwen2-7b-1700000000,xw.device_indices=0,1"}"#;
        let ps: PsLine = serde_json::from_str(line).unwrap();
        let view: ContainerView = ps.into();
        assert!(view.running);
        assert_eq!(view.device_indices(), vec![0, 1]);
    }
}
