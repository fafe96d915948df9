//! Pre-run hooks for container prerequisites.
//!
//! Before the scheduler materializes an instance it verifies that the
//! container engine is reachable and the backend image is present locally,
//! pulling it when it is not. Hook failures surface as precondition errors
//! and abort the run before any resource is allocated.

use crate::error::{Error, Result};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct HookRunner {
    docker_bin: String,
    enabled: bool,
}

impl HookRunner {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            enabled: true,
        }
    }

    /// A runner that reports success without touching the host. Used with
    /// the mock container backend in tests.
    pub fn noop() -> Self {
        Self {
            docker_bin: String::new(),
            enabled: false,
        }
    }

    /// Verify the container engine daemon is up.
    pub async fn ensure_docker(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        run_checked(&self.docker_bin, &["info"], "docker")
            .await
            .map(|_| ())
            .map_err(|e| {
                Error::PreconditionFailed(format!("Docker is not installed or not running: {}", e))
            })
    }

    /// Verify the image exists locally, pulling it from the registry when
    /// missing. Pulls can take minutes for inference images; duration is
    /// recorded in metrics.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if run_checked(&self.docker_bin, &["image", "inspect", image], "docker-image")
            .await
            .is_ok()
        {
            debug!(image = %image, "Image already present");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let started = Instant::now();
        let result = run_checked(&self.docker_bin, &["pull", image], "docker-image").await;
        metrics::histogram!("xw_image_pull_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        result.map(|_| ()).map_err(|e| {
            metrics::counter!("xw_hook_failures_total").increment(1);
            Error::PreconditionFailed(format!("failed to pull image {}: {}", image, e))
        })
    }
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_checked(bin: &str, args: &[&str], hook_name: &str) -> Result<String> {
    debug!(hook = %hook_name, args = ?args, "Running hook");

    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::PreconditionFailed(format!("hook {} failed to spawn: {}", hook_name, e)))?;

    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            debug!(hook = %hook_name, stderr = %stderr.trim_end(), "Hook stderr");
        } else {
            warn!(hook = %hook_name, stderr = %stderr.trim_end(), "Hook failed");
        }
    }

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        return Err(Error::PreconditionFailed(format!(
            "hook {} exited with code {}: {}",
            hook_name, code, stderr
        )));
    }

    debug!(hook = %hook_name, "Hook completed");
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
